//! Periodic reconciliation
//!
//! Two loops keep the realtime tables honest against the KV leases: a
//! slow sweep that reclaims endpoint rows whose leases expired, and a
//! fast retry pass for pending originates the event path missed. Both
//! are idempotent; the KV records act as single-writer leases, so
//! running concurrently with the event handlers is safe.

use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, warn};

use crate::kv::{self, EndpointKind, EndpointRecord, KvStore};
use crate::orchestrator::Orchestrator;
use crate::realtime::RealtimeStore;
use crate::Result;

const STALE_SWEEP_PERIOD: Duration = Duration::from_secs(60);
const ORIGINATE_RETRY_PERIOD: Duration = Duration::from_secs(2);

pub async fn run_stale_sweep(kv: KvStore, realtime: RealtimeStore) {
    let mut ticker = interval(STALE_SWEEP_PERIOD);
    loop {
        ticker.tick().await;
        if let Err(err) = sweep_once(&kv, &realtime).await {
            warn!(error = %err, "Stale-endpoint sweep failed");
        }
    }
}

/// Delete realtime rows for every disposable endpoint whose KV lease is
/// gone, or whose lease points at a token record that no longer exists.
pub async fn sweep_once(kv: &KvStore, realtime: &RealtimeStore) -> Result<()> {
    for id in realtime.list_ephemeral_endpoints().await? {
        let lease: Option<EndpointRecord> = kv.get_json(&kv::endpoint_key(&id)).await?;
        let live = match &lease {
            None => false,
            Some(record) => {
                let token_key = match record.kind {
                    EndpointKind::Call => kv::call_key(&record.token),
                    EndpointKind::Outgoing => kv::outgoing_key(&record.token),
                };
                kv.exists(&token_key).await?
            }
        };
        if !live {
            debug!(endpoint = %id, "Reclaiming stale endpoint rows");
            realtime.delete_ephemeral_endpoint(&id).await?;
            if lease.is_some() {
                kv.del(&kv::endpoint_key(&id)).await?;
            }
        }
    }
    Ok(())
}

pub async fn run_originate_retry(orchestrator: Orchestrator, realtime: RealtimeStore) {
    let mut ticker = interval(ORIGINATE_RETRY_PERIOD);
    loop {
        ticker.tick().await;
        if let Err(err) = retry_once(&orchestrator, &realtime).await {
            debug!(error = %err, "Pending-originate retry pass failed");
        }
    }
}

/// Walk current disposable endpoints and retry any pending originate.
/// The lease is deleted on success, so an endpoint whose event-driven
/// originate already won is a no-op here.
pub async fn retry_once(orchestrator: &Orchestrator, realtime: &RealtimeStore) -> Result<()> {
    for id in realtime.list_ephemeral_endpoints().await? {
        orchestrator.try_pending_originate(&id).await?;
    }
    Ok(())
}
