//! Pending-request table.
//!
//! Every outbound request is recorded here under its envelope id until a
//! reply arrives, the request expires, or the table is closed. Whichever of
//! these removes the entry from the map resolves it; the others find nothing
//! and become no-ops.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{MqError, Result};
use crate::handler::Reply;

struct PendingRequest {
    registered_at: Instant,
    ttl: Duration,
    slot: oneshot::Sender<Result<Reply>>,
}

impl PendingRequest {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.registered_at) >= self.ttl
    }
}

type PendingMap = DashMap<String, PendingRequest>;

/// Completes with the reply to a registered request, or with the error that
/// ended it (`MessageTimeout`, `Closed`, or a send failure).
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    origin: String,
    rx: oneshot::Receiver<Result<Reply>>,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Reply>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // sender dropped without resolving: the table went away
            Poll::Ready(Err(_)) => Poll::Ready(Err(MqError::Closed {
                origin: this.origin.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Outstanding requests keyed by envelope id.
///
/// Every entry is resolved exactly once: by its reply, by the sweep once its
/// ttl has passed, or by `close`. Whichever removes the entry from the map
/// first wins.
pub struct RequestsRoutingTable {
    origin: String,
    sweep_interval: Duration,
    pending: Arc<PendingMap>,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RequestsRoutingTable {
    /// The sweep task is started by the first `register`, so construction
    /// needs no runtime.
    pub fn new(name: &str, sweep_interval: Duration) -> Self {
        Self {
            origin: format!("{name}.RequestsRoutingTable"),
            sweep_interval,
            pending: Arc::new(DashMap::new()),
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }
    }

    /// Records a request that expires `ttl` from now.
    pub fn register(&self, id: impl Into<String>, ttl: Duration) -> Result<PendingReply> {
        let id = id.into();
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error("register"));
        }
        self.ensure_sweeper();

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingRequest {
                registered_at: Instant::now(),
                ttl,
                slot: tx,
            },
        );
        // close() may have drained the map between the check and the insert
        if self.closed.load(Ordering::Acquire) {
            self.pending.remove(&id);
            return Err(self.closed_error("register"));
        }
        debug!(target: "requests_table", %id, ttl_ms = ttl.as_millis() as u64, "Registered pending request");

        Ok(PendingReply {
            id,
            origin: format!("{}.pending", self.origin),
            rx,
        })
    }

    /// Resolves the request registered under `id` with `outcome`.
    pub fn call_by_id(&self, id: &str, outcome: Result<Reply>) -> Result<()> {
        let Some((_, request)) = self.pending.remove(id) else {
            return Err(MqError::UnknownMessageId {
                origin: format!("{}.callById", self.origin),
                id: id.to_string(),
            });
        };
        if request.slot.send(outcome).is_err() {
            debug!(target: "requests_table", %id, "Requester went away before resolution");
        }
        Ok(())
    }

    /// Expires every request whose ttl has elapsed. Returns how many were
    /// resolved with `MessageTimeout`.
    pub fn check_requests_queue(&self) -> usize {
        sweep(&self.pending, &self.origin)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops the sweep and fails every outstanding request with `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.sweeper_slot().take() {
            handle.abort();
        }

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0usize;
        for id in ids {
            if let Some((_, request)) = self.pending.remove(&id) {
                let _ = request.slot.send(Err(self.closed_error("close")));
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(target: "requests_table", failed, "Closed with requests still pending");
        }
    }

    fn closed_error(&self, op: &str) -> MqError {
        MqError::Closed {
            origin: format!("{}.{op}", self.origin),
        }
    }

    fn sweeper_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        // the guarded value stays consistent even if a holder panicked
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_sweeper(&self) {
        let mut slot = self.sweeper_slot();
        if slot.is_some() {
            return;
        }
        let map: Weak<PendingMap> = Arc::downgrade(&self.pending);
        let origin = self.origin.clone();
        let period = self.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(map) = map.upgrade() else {
                    break;
                };
                sweep(&map, &origin);
            }
        }));
    }
}

impl Drop for RequestsRoutingTable {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper_slot().take() {
            handle.abort();
        }
    }
}

fn sweep(map: &PendingMap, origin: &str) -> usize {
    let now = Instant::now();
    let expired: Vec<String> = map
        .iter()
        .filter(|e| e.value().expired(now))
        .map(|e| e.key().clone())
        .collect();

    let mut swept = 0;
    for id in expired {
        // a reply may have won the race since the scan
        if let Some((id, request)) = map.remove_if(&id, |_, r| r.expired(now)) {
            warn!(target: "requests_table", %id, "Request timed out");
            let _ = request.slot.send(Err(MqError::MessageTimeout {
                origin: format!("{origin}.checkRequestsQueue"),
                id,
            }));
            swept += 1;
        }
    }
    swept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RequestsRoutingTable {
        RequestsRoutingTable::new("svc", Duration::from_millis(200))
    }

    fn pong() -> Reply {
        Reply {
            message: b"pong".to_vec(),
            queue: "svc-1".into(),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reply_before_expiry_wins() {
        let table = table();
        let pending = table.register("svc.1", Duration::from_secs(5)).unwrap();
        assert_eq!(pending.id(), "svc.1");
        table.call_by_id("svc.1", Ok(pong())).unwrap();

        let reply = pending.await.unwrap();
        assert_eq!(reply.message, b"pong");
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_within_one_sweep() {
        let table = table();
        let started = Instant::now();
        let pending = table.register("svc.2", Duration::from_secs(1)).unwrap();

        let err = pending.await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, MqError::MessageTimeout { ref id, .. } if id == "svc.2"));
        assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1200), "{elapsed:?}");

        // the late reply finds nothing
        assert!(matches!(
            table.call_by_id("svc.2", Ok(pong())),
            Err(MqError::UnknownMessageId { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_just_inside_ttl_still_wins() {
        let table = table();
        let pending = table.register("svc.10", Duration::from_secs(1)).unwrap();

        // several sweeps run in between
        tokio::time::advance(Duration::from_millis(999)).await;
        tokio::task::yield_now().await;
        assert_eq!(table.pending_count(), 1);

        table.call_by_id("svc.10", Ok(pong())).unwrap();
        assert_eq!(pending.await.unwrap().message, b"pong");
    }

    #[tokio::test(start_paused = true)]
    async fn reply_after_sweep_loses_to_timeout() {
        let table = table();
        let pending = table.register("svc.11", Duration::from_secs(1)).unwrap();

        while table.pending_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            table.call_by_id("svc.11", Ok(pong())),
            Err(MqError::UnknownMessageId { ref id, .. }) if id == "svc.11"
        ));
        assert!(matches!(pending.await, Err(MqError::MessageTimeout { .. })));
    }

    #[tokio::test]
    async fn unknown_id_is_reported() {
        let table = table();
        let err = table.call_by_id("svc.404", Ok(pong())).unwrap_err();
        assert_eq!(err.code(), "MQ_ROUTER_UNKNOWN_MESSAGE_ID");
        assert_eq!(err.origin(), "svc.RequestsRoutingTable.callById");
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_check_expires_only_stale_entries() {
        let table = table();
        let stale = table.register("svc.3", Duration::from_millis(50)).unwrap();
        let fresh = table.register("svc.4", Duration::from_secs(5)).unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(table.check_requests_queue(), 1);
        assert_eq!(table.pending_count(), 1);
        assert!(matches!(stale.await, Err(MqError::MessageTimeout { .. })));

        table.call_by_id("svc.4", Ok(pong())).unwrap();
        assert!(fresh.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_error_is_delivered_as_is() {
        let table = table();
        let pending = table.register("svc.5", Duration::from_secs(5)).unwrap();
        table
            .call_by_id("svc.5", Err(MqError::broker("memory_broker", "publish rejected")))
            .unwrap();
        assert!(matches!(pending.await, Err(MqError::Broker { .. })));
    }

    #[tokio::test]
    async fn close_fails_outstanding_and_future_requests() {
        let table = table();
        let a = table.register("svc.6", Duration::from_secs(5)).unwrap();
        let b = table.register("svc.7", Duration::from_secs(5)).unwrap();

        table.close();
        assert!(table.is_closed());
        assert!(matches!(a.await, Err(MqError::Closed { .. })));
        assert!(matches!(b.await, Err(MqError::Closed { .. })));
        assert_eq!(table.pending_count(), 0);
        assert!(matches!(
            table.register("svc.8", Duration::from_secs(5)),
            Err(MqError::Closed { .. })
        ));
    }
}
