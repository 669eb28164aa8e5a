//! Shared, run-once upstream sources
//!
//! A [`SourceMulticaster`] turns a cold single-observer stream into a hot one
//! that many [`Subscription`]s can observe while the underlying stream is
//! polled by exactly one driver task. Every subscriber attached before an
//! event sees it, in the same order as every other subscriber. Values are not
//! replayed: a subscriber attaching after termination only receives the
//! terminal event.
//!
//! The driver starts the first time a *demanding* subscription is polled.
//! Passive subscriptions (see [`SourceMulticaster::observe`]) receive events
//! but never start the source on their own. When the last subscription is
//! dropped before the source terminates, the driver is cancelled. A source
//! that can no longer be started (its multicaster is gone and no demanding
//! subscription is left) completes its passive subscriptions instead of
//! leaving them waiting.

use std::{
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use futures::{stream::BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::UpstreamError;

/// A stream of byte payloads terminated by completion or a single error
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, UpstreamError>>;

#[derive(Debug, Clone)]
enum SourceEvent {
    Value(Vec<u8>),
    Failed(UpstreamError),
    Finished,
}

enum Phase {
    Idle(ByteStream),
    Running,
    Terminated(Terminal),
}

enum Terminal {
    Finished,
    Failed(UpstreamError),
    Cancelled,
}

impl Terminal {
    fn event(&self) -> SourceEvent {
        match self {
            Terminal::Failed(error) => SourceEvent::Failed(error.clone()),
            Terminal::Finished | Terminal::Cancelled => SourceEvent::Finished,
        }
    }
}

struct Subscriber {
    id: u64,
    demanding: bool,
    sender: mpsc::UnboundedSender<SourceEvent>,
}

struct Shared {
    phase: Phase,
    subscribers: Vec<Subscriber>,
    next_id: u64,
    cancel: CancellationToken,
    /// The owning [`SourceMulticaster`] has been dropped
    released: bool,
}

impl Shared {
    fn broadcast(&mut self, event: SourceEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.sender.send(event.clone()).is_ok());
    }

    fn terminate(&mut self, terminal: Terminal) {
        let event = terminal.event();
        for subscriber in self.subscribers.drain(..) {
            let _ = subscriber.sender.send(event.clone());
        }
        self.phase = Phase::Terminated(terminal);
    }

    /// Cancel an idle source that nothing is left to start
    fn release_if_abandoned(&mut self) {
        let idle = matches!(self.phase, Phase::Idle(_));
        let demanded = self.subscribers.iter().any(|subscriber| subscriber.demanding);
        if self.released && idle && !demanded {
            debug!(
                observers = self.subscribers.len(),
                "Shared upstream abandoned before it started"
            );
            self.terminate(Terminal::Cancelled);
        }
    }
}

/// Multicasts one upstream stream to any number of subscribers
///
/// Dropping the multicaster does not stop a running source; its
/// subscriptions keep it alive.
pub struct SourceMulticaster {
    shared: Arc<Mutex<Shared>>,
}

impl SourceMulticaster {
    /// Wrap `upstream`; nothing is polled until a subscription demands it
    pub fn new<S>(upstream: S) -> Self
    where
        S: Stream<Item = Result<Vec<u8>, UpstreamError>> + Send + 'static,
    {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                phase: Phase::Idle(upstream.boxed()),
                subscribers: Vec::new(),
                next_id: 0,
                cancel: CancellationToken::new(),
                released: false,
            })),
        }
    }

    /// Attach a subscription that starts the source when first polled
    pub fn subscribe(&self) -> Subscription {
        self.attach(true)
    }

    /// Attach a subscription that only listens
    ///
    /// It keeps a running source alive like any other subscription but does
    /// not start an idle one.
    pub fn observe(&self) -> Subscription {
        self.attach(false)
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    /// Whether the source has been started
    pub fn is_started(&self) -> bool {
        !matches!(self.shared.lock().phase, Phase::Idle(_))
    }

    fn attach(&self, demand: bool) -> Subscription {
        let (sender, events) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock();

        let terminal = match &shared.phase {
            Phase::Terminated(terminal) => Some(terminal.event()),
            Phase::Idle(_) | Phase::Running => None,
        };

        let id = match terminal {
            Some(event) => {
                let _ = sender.send(event);
                None
            }
            None => {
                let id = shared.next_id;
                shared.next_id += 1;
                shared.subscribers.push(Subscriber {
                    id,
                    demanding: demand,
                    sender,
                });
                Some(id)
            }
        };

        Subscription {
            id,
            events,
            shared: Arc::clone(&self.shared),
            demand,
            done: false,
        }
    }
}

impl Drop for SourceMulticaster {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        shared.released = true;
        shared.release_if_abandoned();
    }
}

fn connect(shared: &Arc<Mutex<Shared>>) {
    let mut guard = shared.lock();
    let upstream = match std::mem::replace(&mut guard.phase, Phase::Running) {
        Phase::Idle(upstream) => upstream,
        other => {
            guard.phase = other;
            return;
        }
    };
    let cancel = guard.cancel.clone();
    drop(guard);

    debug!("Starting shared upstream");
    tokio::spawn(drive(Arc::clone(shared), upstream, cancel));
}

async fn drive(shared: Arc<Mutex<Shared>>, mut upstream: ByteStream, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Shared upstream cancelled, no subscribers left");
                shared.lock().terminate(Terminal::Cancelled);
                return;
            }
            next = upstream.next() => next,
        };

        match next {
            Some(Ok(payload)) => shared.lock().broadcast(SourceEvent::Value(payload)),
            Some(Err(error)) => {
                shared.lock().terminate(Terminal::Failed(error));
                return;
            }
            None => {
                shared.lock().terminate(Terminal::Finished);
                return;
            }
        }
    }
}

/// One observer of a [`SourceMulticaster`]
///
/// Yields the shared values, then ends after completion or a single error.
pub struct Subscription {
    id: Option<u64>,
    events: mpsc::UnboundedReceiver<SourceEvent>,
    shared: Arc<Mutex<Shared>>,
    demand: bool,
    done: bool,
}

impl Stream for Subscription {
    type Item = Result<Vec<u8>, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.demand {
            self.demand = false;
            connect(&self.shared);
        }
        if self.done {
            return Poll::Ready(None);
        }

        match ready!(self.events.poll_recv(cx)) {
            Some(SourceEvent::Value(payload)) => Poll::Ready(Some(Ok(payload))),
            Some(SourceEvent::Failed(error)) => {
                self.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Some(SourceEvent::Finished) | None => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(id) = self.id else {
            return;
        };

        let mut shared = self.shared.lock();
        shared.subscribers.retain(|subscriber| subscriber.id != id);
        if shared.subscribers.is_empty() && matches!(shared.phase, Phase::Running) {
            shared.cancel.cancel();
        } else {
            shared.release_if_abandoned();
        }
    }
}
