//! Observable load state for pages backed by a cached resource

use futures::{
    future,
    stream::{self, BoxStream},
    Stream, StreamExt,
};

/// State of a load as a page would render it
#[derive(Debug, Clone, PartialEq)]
pub enum LoadState<T, E> {
    Loading,
    Loaded(T),
    Failed(E),
}

impl<T, E> LoadState<T, E> {
    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            LoadState::Loaded(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            LoadState::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Map a load stream to state transitions
///
/// Yields `Loading` immediately, then `Loaded` for every value and `Failed`
/// for an error. A stale cached value followed by a fresh one yields two
/// `Loaded` states.
pub fn track_state<S, T, E>(stream: S) -> BoxStream<'static, LoadState<T, E>>
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    stream::once(future::ready(LoadState::Loading))
        .chain(stream.map(|item| match item {
            Ok(value) => LoadState::Loaded(value),
            Err(error) => LoadState::Failed(error),
        }))
        .boxed()
}
