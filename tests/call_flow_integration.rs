//! Call-flow integration tests
//!
//! Exercises the coordination pattern behind the orchestrator against
//! in-memory stores and a scripted engine: the composite creation step,
//! the registration/originate race (exactly one originate per lease),
//! ring timeout, client reject and janitor reconciliation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// In-memory stand-in for the TTL'd KV substrate.
#[derive(Default)]
struct MockKv {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MockKv {
    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    async fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries.get(key).and_then(|(value, expires)| {
            if Instant::now() < *expires {
                Some(value.clone())
            } else {
                None
            }
        })
    }

    /// Read-and-delete under one lock: exactly one of any number of
    /// concurrent callers observes the value.
    async fn take(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some((value, expires)) if Instant::now() < expires => Some(value),
            _ => None,
        }
    }

    async fn del(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
    }
}

/// Scripted telephony engine that only counts what the orchestration
/// layer asks of it.
#[derive(Default)]
struct MockEngine {
    bridges_created: AtomicU64,
    channels_added: AtomicU64,
    originates: AtomicU64,
    hangups: AtomicU64,
    fail_create_bridge: AtomicBool,
    fail_originate: AtomicBool,
}

impl MockEngine {
    fn create_bridge(&self) -> Result<String, &'static str> {
        if self.fail_create_bridge.load(Ordering::SeqCst) {
            return Err("engine unavailable");
        }
        let n = self.bridges_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("bridge-{}", n))
    }

    fn add_channel(&self) {
        self.channels_added.fetch_add(1, Ordering::SeqCst);
    }

    fn originate(&self) -> Result<(), &'static str> {
        if self.fail_originate.load(Ordering::SeqCst) {
            return Err("engine unavailable");
        }
        self.originates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn hangup(&self) {
        self.hangups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Endpoint rows as the realtime store sees them.
#[derive(Default)]
struct MockRealtime {
    endpoints: Mutex<HashSet<String>>,
}

impl MockRealtime {
    async fn insert(&self, id: &str) {
        self.endpoints.lock().await.insert(id.to_string());
    }

    async fn remove(&self, id: &str) {
        self.endpoints.lock().await.remove(id);
    }

    async fn list(&self) -> Vec<String> {
        self.endpoints.lock().await.iter().cloned().collect()
    }
}

/// Mirror of the orchestrator's coordination rules, wired to the mocks.
struct CallFlow {
    kv: Arc<MockKv>,
    engine: Arc<MockEngine>,
    realtime: Arc<MockRealtime>,
    pushes: AtomicU64,
    token_ttl: Duration,
    ring_timeout: Duration,
}

impl CallFlow {
    fn new(token_ttl: Duration, ring_timeout: Duration) -> Self {
        Self {
            kv: Arc::new(MockKv::default()),
            engine: Arc::new(MockEngine::default()),
            realtime: Arc::new(MockRealtime::default()),
            pushes: AtomicU64::new(0),
            token_ttl,
            ring_timeout,
        }
    }

    /// The composite creation step: endpoint row, the three KV indexes,
    /// bridge + doorphone leg, pending-originate lease, push.
    async fn start_call(&self, channel_id: &str) -> Result<String, &'static str> {
        let endpoint_id = format!("tmp_{}", channel_id.to_lowercase());
        let token = format!("token-{}", channel_id);

        self.realtime.insert(&endpoint_id).await;
        self.kv
            .set(&format!("call:{}", token), channel_id, self.token_ttl)
            .await;
        self.kv
            .set(&format!("channel:{}", channel_id), &token, self.token_ttl)
            .await;
        self.kv
            .set(&format!("endpoint:{}", endpoint_id), &token, self.token_ttl)
            .await;

        let bridge = self.engine.create_bridge()?;
        self.engine.add_channel();
        self.kv
            .set(&format!("originate:{}", endpoint_id), &bridge, self.ring_timeout)
            .await;
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(token)
    }

    /// Lease-guarded originate. Both the endpoint-state event and the
    /// fallback poller funnel through this, possibly concurrently; the
    /// atomic take means exactly one caller proceeds and a failed
    /// originate writes the lease back.
    async fn endpoint_reachable(&self, endpoint_id: &str) -> bool {
        let key = format!("originate:{}", endpoint_id);
        let bridge = match self.kv.take(&key).await {
            Some(bridge) => bridge,
            None => return false,
        };
        if self.engine.originate().is_err() {
            self.kv.set(&key, &bridge, self.ring_timeout).await;
            return false;
        }
        // Stamp the owning call as bridged, as the orchestrator does.
        if let Some(token) = self.kv.get(&format!("endpoint:{}", endpoint_id)).await {
            self.kv
                .set(&format!("bridged:{}", token), "1", self.token_ttl)
                .await;
        }
        true
    }

    /// Ring timer body: hang up only calls that are still ringing.
    async fn ring_timer_fired(&self, token: &str) -> bool {
        if self.kv.get(&format!("call:{}", token)).await.is_none() {
            return false;
        }
        if self.kv.get(&format!("bridged:{}", token)).await.is_some() {
            return false;
        }
        self.engine.hangup();
        true
    }

    /// Client end/reject: delete-on-end makes the second attempt a miss.
    async fn end_call(&self, token: &str) -> Result<(), &'static str> {
        let key = format!("call:{}", token);
        if self.kv.get(&key).await.is_none() {
            return Err("not found");
        }
        self.engine.hangup();
        self.kv.del(&key).await;
        Ok(())
    }

    /// Janitor sweep: reclaim endpoint rows whose lease (or whose lease's
    /// token record) is gone.
    async fn sweep(&self) {
        for id in self.realtime.list().await {
            let live = match self.kv.get(&format!("endpoint:{}", id)).await {
                None => false,
                Some(token) => self.kv.get(&format!("call:{}", token)).await.is_some(),
            };
            if !live {
                self.realtime.remove(&id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_TTL: Duration = Duration::from_millis(400);
    const RING_TIMEOUT: Duration = Duration::from_millis(150);

    #[tokio::test]
    async fn test_happy_path_counts() {
        let flow = CallFlow::new(TOKEN_TTL, RING_TIMEOUT);

        let token = flow.start_call("CH1").await.unwrap();
        assert_eq!(flow.engine.bridges_created.load(Ordering::SeqCst), 1);
        assert_eq!(flow.engine.channels_added.load(Ordering::SeqCst), 1);
        assert_eq!(flow.pushes.load(Ordering::SeqCst), 1);
        assert!(flow.kv.get("originate:tmp_ch1").await.is_some());
        assert!(flow.kv.get(&format!("call:{}", token)).await.is_some());

        // Client registers: the event-driven path originates exactly once
        // and consumes the lease.
        assert!(flow.endpoint_reachable("tmp_ch1").await);
        assert_eq!(flow.engine.originates.load(Ordering::SeqCst), 1);
        assert!(flow.kv.get("originate:tmp_ch1").await.is_none());

        // The originated leg joins the bridge.
        flow.engine.add_channel();
        assert_eq!(flow.engine.channels_added.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_originate_once() {
        let flow = Arc::new(CallFlow::new(TOKEN_TTL, RING_TIMEOUT));
        flow.start_call("CH1").await.unwrap();

        // Two state-change events dispatched on separate tasks race for
        // the lease; the atomic take lets exactly one of them through.
        let first = tokio::spawn({
            let flow = flow.clone();
            async move { flow.endpoint_reachable("tmp_ch1").await }
        });
        let second = tokio::spawn({
            let flow = flow.clone();
            async move { flow.endpoint_reachable("tmp_ch1").await }
        });
        let (first, second) = (first.await.unwrap(), second.await.unwrap());

        assert!(first ^ second, "exactly one trigger may claim the lease");
        assert_eq!(flow.engine.originates.load(Ordering::SeqCst), 1);

        // A later poller tick finds no lease and is a no-op.
        assert!(!flow.endpoint_reachable("tmp_ch1").await);
        assert_eq!(flow.engine.originates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_originate_restores_lease() {
        let flow = CallFlow::new(TOKEN_TTL, RING_TIMEOUT);
        flow.start_call("CH1").await.unwrap();

        flow.engine.fail_originate.store(true, Ordering::SeqCst);
        assert!(!flow.endpoint_reachable("tmp_ch1").await);
        assert!(flow.kv.get("originate:tmp_ch1").await.is_some());

        // The next trigger after the engine recovers wins normally.
        flow.engine.fail_originate.store(false, Ordering::SeqCst);
        assert!(flow.endpoint_reachable("tmp_ch1").await);
        assert_eq!(flow.engine.originates.load(Ordering::SeqCst), 1);
        assert!(flow.kv.get("originate:tmp_ch1").await.is_none());
    }

    #[tokio::test]
    async fn test_ring_timeout_closes_and_janitor_reclaims() {
        let flow = CallFlow::new(TOKEN_TTL, RING_TIMEOUT);
        let token = flow.start_call("CH1").await.unwrap();

        tokio::time::sleep(RING_TIMEOUT).await;
        assert!(flow.ring_timer_fired(&token).await);
        assert_eq!(flow.engine.hangups.load(Ordering::SeqCst), 1);

        // Records are still live inside the TTL window, so the sweep
        // leaves the endpoint row alone.
        flow.sweep().await;
        assert_eq!(flow.realtime.list().await.len(), 1);

        // After the TTL budget everything is gone within one cycle.
        tokio::time::sleep(TOKEN_TTL).await;
        flow.sweep().await;
        assert!(flow.realtime.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_client_reject_is_idempotent_and_isolated() {
        let flow = CallFlow::new(TOKEN_TTL, RING_TIMEOUT);
        let token1 = flow.start_call("CH1").await.unwrap();
        let token2 = flow.start_call("CH2").await.unwrap();

        assert!(flow.end_call(&token1).await.is_ok());
        assert_eq!(flow.engine.hangups.load(Ordering::SeqCst), 1);

        // Second identical end is a miss and disturbs nothing else.
        assert_eq!(flow.end_call(&token1).await, Err("not found"));
        assert_eq!(flow.engine.hangups.load(Ordering::SeqCst), 1);
        assert!(flow.kv.get(&format!("call:{}", token2)).await.is_some());
    }

    #[tokio::test]
    async fn test_engine_failure_during_setup_aborts_before_push() {
        let flow = CallFlow::new(TOKEN_TTL, RING_TIMEOUT);
        flow.engine.fail_create_bridge.store(true, Ordering::SeqCst);

        assert!(flow.start_call("CH1").await.is_err());
        assert_eq!(flow.pushes.load(Ordering::SeqCst), 0);
        assert!(flow.kv.get("originate:tmp_ch1").await.is_none());

        // The half-created call is harmless: once its records expire the
        // janitor reclaims the endpoint row.
        tokio::time::sleep(TOKEN_TTL).await;
        flow.sweep().await;
        assert!(flow.realtime.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_ring_timer_leaves_bridged_call_alone() {
        let flow = CallFlow::new(TOKEN_TTL, RING_TIMEOUT);
        let token = flow.start_call("CH1").await.unwrap();

        // The client connects before the timer fires.
        assert!(flow.endpoint_reachable("tmp_ch1").await);

        tokio::time::sleep(RING_TIMEOUT).await;
        assert!(!flow.ring_timer_fired(&token).await);
        assert_eq!(flow.engine.hangups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ring_timer_is_a_noop_after_end() {
        let flow = CallFlow::new(TOKEN_TTL, RING_TIMEOUT);
        let token = flow.start_call("CH1").await.unwrap();

        flow.end_call(&token).await.unwrap();
        assert!(!flow.ring_timer_fired(&token).await);
        assert_eq!(flow.engine.hangups.load(Ordering::SeqCst), 1);
    }
}
