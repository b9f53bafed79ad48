//! In-process publish/subscribe over a closed set of topics.
//!
//! Only [`Request`](crate::types::Request) payloads traverse the bus; errors
//! stay local to the service that detected them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::types::Request;

/// The bus topics. Closed enumeration; collaborators may not invent topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    NewName,
    NameResolved,
    NewSubdomain,
    NewAddress,
    NewAsn,
    ResolveName,
    Output,
    Checked,
}

/// Payloads carried by publications.
#[derive(Debug, Clone)]
pub enum Event {
    Name(Arc<Request>),
    /// A subdomain together with the number of times it has been seen.
    Subdomain(Arc<Request>, usize),
    Asn(u32, String),
    /// Terminal marker published once during shutdown.
    Tick,
}

/// Whether a handler runs in the publisher's context or on its own task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sync,
    Async,
}

type Handler = Arc<dyn Fn(Event) + Send + Sync>;

struct Subscription {
    id: u64,
    delivery: Delivery,
    handler: Handler,
}

/// Publication is safe from many concurrent producers. Per-topic delivery
/// order is causal only within one publisher's sequence; no lock is held
/// across handler invocations.
pub struct EventBus {
    subs: RwLock<AHashMap<Topic, Vec<Subscription>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subs: RwLock::new(AHashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn subscribe<F>(&self, topic: Topic, delivery: Delivery, handler: F) -> u64
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subs.write().entry(topic).or_default().push(Subscription {
            id,
            delivery,
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, topic: Topic, id: u64) {
        if let Some(subs) = self.subs.write().get_mut(&topic) {
            subs.retain(|s| s.id != id);
        }
    }

    pub fn publish(&self, topic: Topic, event: Event) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Snapshot handlers so delivery happens outside the table lock.
        let handlers: Vec<(Delivery, Handler)> = {
            let subs = self.subs.read();
            match subs.get(&topic) {
                Some(list) => list.iter().map(|s| (s.delivery, s.handler.clone())).collect(),
                None => return,
            }
        };

        for (delivery, handler) in handlers {
            match delivery {
                Delivery::Sync => {
                    let ev = event.clone();
                    // A panicking handler must not take its siblings down.
                    if catch_unwind(AssertUnwindSafe(|| handler(ev))).is_err() {
                        tracing::warn!(?topic, "bus handler panicked");
                    }
                }
                Delivery::Async => {
                    let ev = event.clone();
                    tokio::spawn(async move {
                        handler(ev);
                    });
                }
            }
        }
    }

    /// Drop every subscription. Publications after close are no-ops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subs.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::types::Tag;

    fn req(name: &str) -> Event {
        Event::Name(Arc::new(Request::candidate(name, "example.com", Tag::Dns, "test")))
    }

    #[tokio::test]
    async fn sync_delivery_reaches_all_subscribers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            bus.subscribe(Topic::NewName, Delivery::Sync, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.publish(Topic::NewName, req("www.example.com"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn async_delivery_runs_on_its_own_task() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Topic::NameResolved, Delivery::Async, move |ev| {
            if let Event::Name(r) = ev {
                let _ = tx.send(r.name.clone());
            }
        });
        bus.publish(Topic::NameResolved, req("mail.example.com"));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery timed out");
        assert_eq!(got.as_deref(), Some("mail.example.com"));
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_siblings() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Topic::NewName, Delivery::Sync, |_| panic!("boom"));
        let c = count.clone();
        bus.subscribe(Topic::NewName, Delivery::Sync, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(Topic::NewName, req("a.example.com"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_and_close() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe(Topic::Output, Delivery::Sync, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(Topic::Output, req("a.example.com"));
        bus.unsubscribe(Topic::Output, id);
        bus.publish(Topic::Output, req("b.example.com"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = count.clone();
        bus.subscribe(Topic::Output, Delivery::Sync, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.close();
        bus.publish(Topic::Output, req("c.example.com"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
