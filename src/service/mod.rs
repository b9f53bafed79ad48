//! Uniform lifecycle shared by every active worker in the engine.
//!
//! Each service embeds a [`ServiceBase`] carrying its name, start/stop
//! flags, activity timestamp, pause signal, quit token and bounded inbound
//! queue. The coordinator only ever talks to services through this surface.

pub mod flow;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::types::Request;

/// A service counts as active if it touched its activity timestamp within
/// this window; it is the sole quiescence signal the coordinator reads.
pub const ACTIVITY_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service {0} already started")]
    AlreadyStarted(String),
    #[error("service {0} already stopped")]
    AlreadyStopped(String),
}

pub struct ServiceBase {
    name: String,
    started: AtomicBool,
    stopped: AtomicBool,
    last_active: Mutex<Instant>,
    pending: AtomicUsize,
    quit: CancellationToken,
    pause_tx: watch::Sender<bool>,
    queue_tx: mpsc::Sender<Request>,
    queue_rx: Mutex<Option<mpsc::Receiver<Request>>>,
}

impl ServiceBase {
    pub fn new(name: &str, queue_len: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_len.max(1));
        let (pause_tx, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
            pending: AtomicUsize::new(0),
            quit: CancellationToken::new(),
            pause_tx,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_active(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.last_active.lock().elapsed() < ACTIVITY_WINDOW
    }

    /// Non-blocking enqueue; overflow drops the request with a log line.
    pub fn send_request(&self, req: Request) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        match self.queue_tx.try_send(req) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
            }
            Err(mpsc::error::TrySendError::Full(req)) => {
                tracing::debug!(service = %self.name, name = %req.name, "inbound queue full, dropping request");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Requests enqueued but not yet fully processed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Worker-side bookkeeping once a dequeued request is done.
    pub fn mark_processed(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| p.checked_sub(1));
    }

    /// Hand the inbound queue to the worker loop. Callable once.
    pub fn take_queue(&self) -> Option<mpsc::Receiver<Request>> {
        self.queue_rx.lock().take()
    }

    pub fn quit(&self) -> CancellationToken {
        self.quit.clone()
    }

    pub fn pause_rx(&self) -> watch::Receiver<bool> {
        self.pause_tx.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn base(&self) -> &ServiceBase;

    /// The worker loop. Spawned once by [`start`]; must select on the quit
    /// token and exit within a bounded number of operations after closure.
    async fn run(self: Arc<Self>);
}

/// Start a service, spawning its worker loop. Fails on re-entry.
pub fn start(svc: &Arc<dyn Service>) -> Result<(), ServiceError> {
    let base = svc.base();
    if base.started.swap(true, Ordering::SeqCst) {
        return Err(ServiceError::AlreadyStarted(base.name.clone()));
    }
    base.set_active();
    tracing::debug!(service = %base.name, "starting");
    tokio::spawn(svc.clone().run());
    Ok(())
}

/// Stop a service by cancelling its quit token; the worker loop drains its
/// queue and exits. Fails on double stop.
pub fn stop(svc: &Arc<dyn Service>) -> Result<(), ServiceError> {
    let base = svc.base();
    if !base.started.load(Ordering::SeqCst) || base.stopped.swap(true, Ordering::SeqCst) {
        return Err(ServiceError::AlreadyStopped(base.name.clone()));
    }
    tracing::debug!(service = %base.name, "stopping");
    base.quit.cancel();
    Ok(())
}

pub fn pause(svc: &Arc<dyn Service>) {
    let _ = svc.base().pause_tx.send_replace(true);
}

pub fn resume(svc: &Arc<dyn Service>) {
    let _ = svc.base().pause_tx.send_replace(false);
}

/// Discard whatever is left in the queue at shutdown.
pub fn drain_queue(base: &ServiceBase, rx: &mut mpsc::Receiver<Request>) {
    while rx.try_recv().is_ok() {
        base.mark_processed();
    }
}

/// Block while paused, bailing out if the quit token fires first. Returns
/// false when the service should exit.
pub async fn wait_while_paused(base: &ServiceBase, pause_rx: &mut watch::Receiver<bool>) -> bool {
    while *pause_rx.borrow() {
        let quit = base.quit();
        tokio::select! {
            _ = quit.cancelled() => return false,
            res = pause_rx.changed() => {
                if res.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tag;

    struct Echo {
        base: ServiceBase,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Service for Echo {
        fn base(&self) -> &ServiceBase {
            &self.base
        }

        async fn run(self: Arc<Self>) {
            let mut rx = self.base.take_queue().expect("queue taken twice");
            let quit = self.base.quit();
            loop {
                tokio::select! {
                    _ = quit.cancelled() => {
                        drain_queue(&self.base, &mut rx);
                        break;
                    }
                    maybe = rx.recv() => match maybe {
                        Some(req) => {
                            self.base.set_active();
                            self.seen.lock().push(req.name);
                            self.base.mark_processed();
                        }
                        None => break,
                    }
                }
            }
        }
    }

    fn echo() -> Arc<Echo> {
        Arc::new(Echo {
            base: ServiceBase::new("echo", 8),
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn start_is_idempotent_failing() {
        let svc: Arc<dyn Service> = echo();
        assert!(start(&svc).is_ok());
        assert_eq!(
            start(&svc),
            Err(ServiceError::AlreadyStarted("echo".to_string()))
        );
    }

    #[tokio::test]
    async fn stop_twice_fails() {
        let svc: Arc<dyn Service> = echo();
        start(&svc).unwrap();
        assert!(stop(&svc).is_ok());
        assert_eq!(
            stop(&svc),
            Err(ServiceError::AlreadyStopped("echo".to_string()))
        );
    }

    #[tokio::test]
    async fn requests_flow_through_the_queue() {
        let svc = echo();
        let dyn_svc: Arc<dyn Service> = svc.clone();
        start(&dyn_svc).unwrap();
        svc.base()
            .send_request(Request::candidate("a.example.com", "example.com", Tag::Dns, "test"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*svc.seen.lock(), ["a.example.com"]);
        assert_eq!(svc.base().pending(), 0);
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let svc = echo();
        // Worker not started: queue of 8 fills up, the rest drop.
        for i in 0..20 {
            svc.base().send_request(Request::candidate(
                &format!("n{i}.example.com"),
                "example.com",
                Tag::Dns,
                "test",
            ));
        }
        assert_eq!(svc.base().pending(), 8);
    }

    #[tokio::test]
    async fn stale_activity_expires() {
        let svc = echo();
        if let Some(past) = Instant::now().checked_sub(ACTIVITY_WINDOW + Duration::from_secs(1)) {
            *svc.base.last_active.lock() = past;
            assert!(!svc.base().is_active());
        }
        svc.base().set_active();
        assert!(svc.base().is_active());
    }
}
