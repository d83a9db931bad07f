use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{trace, warn};

use crate::event::Event;
use crate::fault::panic_message;

type Callback = Box<dyn Fn(&Event) + Send + Sync>;

enum Sink {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<Event>),
}

struct Subscriber {
    id: u64,
    sink: Sink,
}

impl Subscriber {
    fn is_closed(&self) -> bool {
        match &self.sink {
            Sink::Callback(_) => false,
            Sink::Channel(tx) => tx.is_closed(),
        }
    }

    fn deliver(&self, event: &Event) {
        match &self.sink {
            Sink::Callback(callback) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                    warn!(
                        "event subscriber {} panicked on {}: {}",
                        self.id,
                        event.kind(),
                        panic_message(payload.as_ref())
                    );
                }
            }
            Sink::Channel(tx) => {
                // A closed receiver is reaped on the next publish.
                let _ = tx.send(event.clone());
            }
        }
    }
}

/// Live registration on an [`EventBus`].
///
/// The bus only keeps a weak reference; dropping the handle ends the
/// subscription and the entry is reaped on the next publish.
pub struct Subscription {
    inner: Arc<Subscriber>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.inner.id).finish()
    }
}

/// Process-wide, best-effort event fan-out. Safe to publish from any thread.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Weak<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(Sink::Callback(Box::new(callback)))
    }

    /// Subscribes through an unbounded channel so the receiving side can drain
    /// events on its own context (for example a UI thread).
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register(Sink::Channel(tx)), rx)
    }

    pub fn subscribe_stream(&self) -> (Subscription, UnboundedReceiverStream<Event>) {
        let (subscription, rx) = self.subscribe_channel();
        (subscription, UnboundedReceiverStream::new(rx))
    }

    /// Removes a subscription right away instead of waiting for the next
    /// publish to reap it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let id = subscription.inner.id;
        self.lock()
            .retain(|weak| weak.upgrade().map_or(true, |sub| sub.id != id));
        drop(subscription);
    }

    pub fn publish(&self, event: Event) {
        let live: Vec<Arc<Subscriber>> = {
            let mut subscribers = self.lock();
            subscribers.retain(|weak| weak.upgrade().is_some_and(|sub| !sub.is_closed()));
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };
        trace!(
            "publish {} {:?} to {} subscriber(s)",
            event.kind(),
            event.stage_name(),
            live.len()
        );
        for subscriber in live {
            subscriber.deliver(&event);
        }
    }

    /// Number of registry entries, including dead ones not yet reaped.
    pub fn registered(&self) -> usize {
        self.lock().len()
    }

    pub fn live_subscribers(&self) -> usize {
        self.lock()
            .iter()
            .filter(|weak| weak.upgrade().is_some_and(|sub| !sub.is_closed()))
            .count()
    }

    fn register(&self, sink: Sink) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(Subscriber { id, sink });
        self.lock().push(Arc::downgrade(&inner));
        Subscription { inner }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Weak<Subscriber>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
