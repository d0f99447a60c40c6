//! Call orchestrator
//!
//! Per-call state machine driven by engine events and client requests.
//! Every piece of per-call state lives in the KV and realtime stores; the
//! process keeps no call table, so a crash-restart recovers from the
//! stores alone and the janitor reclaims whatever a dead process left
//! behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ari::AriClient;
use crate::config::Config;
use crate::events::AriEvent;
use crate::kv::{
    self, CallRecord, ChannelRecord, EndpointKind, EndpointRecord, KvStore, OriginateRecord,
    OutgoingRecord, SipCredentials,
};
use crate::push::PushDispatcher;
use crate::realtime::{
    EphemeralEndpoint, RealtimeStore, INBOUND_PREFIX, OUTBOUND_PREFIX, TEMPLATE_CLIENT,
    TEMPLATE_DOMOPHONE,
};
use crate::{Error, Result};

/// First app argument marking a leg we originated ourselves
const OUTGOING_APP_ARG: &str = "outgoing";
/// Dialplan context minted endpoints register into
const ENDPOINT_CONTEXT: &str = "intercom";
/// Settle interval before bridging a freshly originated leg
const BRIDGE_SETTLE: Duration = Duration::from_millis(200);
/// Single retry delay when add-to-bridge fails
const ADD_CHANNEL_RETRY: Duration = Duration::from_millis(500);
const TOKEN_LEN: usize = 32;
const PASSWORD_LEN: usize = 24;

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    kv: KvStore,
    realtime: RealtimeStore,
    ari: AriClient,
    push: PushDispatcher,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        kv: KvStore,
        realtime: RealtimeStore,
        ari: AriClient,
        push: PushDispatcher,
    ) -> Self {
        Self {
            config,
            kv,
            realtime,
            ari,
            push,
        }
    }

    pub async fn handle_event(&self, event: AriEvent) {
        match event {
            AriEvent::StasisStart { channel, args } => {
                if args.first().map(String::as_str) == Some(OUTGOING_APP_ARG) {
                    match args.get(1) {
                        Some(bridge_id) => {
                            if let Err(err) = self.join_outgoing_leg(&channel.id, bridge_id).await {
                                warn!(channel = %channel.id, bridge = %bridge_id, error = %err,
                                    "Failed to join client leg to bridge");
                            }
                        }
                        None => {
                            warn!(channel = %channel.id, "Originated leg arrived without a bridge argument")
                        }
                    }
                } else if let Err(err) = self.start_doorphone_call(&channel.id).await {
                    warn!(channel = %channel.id, error = %err, "Doorphone call setup aborted");
                }
            }
            AriEvent::EndpointStateChange { endpoint } => {
                if !is_disposable(&endpoint.resource) {
                    return;
                }
                if matches!(endpoint.state.as_str(), "offline" | "unknown" | "") {
                    return;
                }
                if let Err(err) = self.try_pending_originate(&endpoint.resource).await {
                    warn!(endpoint = %endpoint.resource, error = %err, "Endpoint-state handling failed");
                }
            }
            AriEvent::StasisEnd { channel } => self.on_channel_gone(&channel.id).await,
            AriEvent::Other => {}
        }
    }

    /// The composite creation step for one doorphone ring: disposable
    /// endpoint rows, the three KV indexes, a mixing bridge holding the
    /// doorphone leg, a pending-originate lease, the push, the ring
    /// timer. A failure anywhere aborts the call; TTLs and the janitor
    /// take the leftovers to a clean state.
    async fn start_doorphone_call(&self, channel_id: &str) -> Result<()> {
        let call_id = Uuid::new_v4().to_string();
        let call_token = mint_secret(TOKEN_LEN);
        let endpoint_id = format!("{}{}", INBOUND_PREFIX, call_id);
        let password = mint_secret(PASSWORD_LEN);
        let credentials = SipCredentials {
            username: endpoint_id.clone(),
            password: password.clone(),
            domain: self.config.server_domain.clone(),
            host: self.config.server_ip.clone(),
        };

        info!(call_id = %call_id, channel = %channel_id, "Doorphone call arrived");

        // Doorphone leg policy: answer as soon as the leg enters the
        // application.
        self.ari.answer(channel_id).await?;

        self.realtime
            .create_ephemeral_endpoint(&EphemeralEndpoint {
                id: endpoint_id.clone(),
                username: endpoint_id.clone(),
                password,
                context: ENDPOINT_CONTEXT.to_string(),
                template_id: TEMPLATE_DOMOPHONE.to_string(),
            })
            .await?;

        let ttl = self.config.call_token_ttl_sec;
        let created_at = Utc::now();
        let mut call = CallRecord {
            call_id: call_id.clone(),
            channel_id: channel_id.to_string(),
            endpoint_id: endpoint_id.clone(),
            bridge_id: None,
            credentials,
            created_at,
            ends_not_before: created_at
                + chrono::Duration::seconds(self.config.ring_timeout_sec as i64),
            bridged_at: None,
        };
        self.kv
            .set_json(&kv::call_key(&call_token), &call, ttl)
            .await?;
        self.kv
            .set_json(
                &kv::channel_key(channel_id),
                &ChannelRecord {
                    call_token: call_token.clone(),
                    endpoint_id: endpoint_id.clone(),
                },
                ttl,
            )
            .await?;
        self.kv
            .set_json(
                &kv::endpoint_key(&endpoint_id),
                &EndpointRecord {
                    kind: EndpointKind::Call,
                    token: call_token.clone(),
                },
                ttl,
            )
            .await?;

        let bridge_id = self.ari.create_mixing_bridge().await?;
        self.ari.add_channel(&bridge_id, channel_id).await?;
        call.bridge_id = Some(bridge_id.clone());
        self.kv
            .set_json(&kv::call_key(&call_token), &call, ttl)
            .await?;

        // The lease must exist before any push goes out.
        self.kv
            .set_json(
                &kv::originate_key(&endpoint_id),
                &OriginateRecord {
                    bridge_id: bridge_id.clone(),
                    channel_id: channel_id.to_string(),
                },
                self.config.ring_timeout_sec,
            )
            .await?;

        if let Err(err) = self
            .realtime
            .record_call(&call_id, channel_id, &endpoint_id)
            .await
        {
            warn!(call_id = %call_id, error = %err, "Call log row not written");
        }

        let targets = self.realtime.list_push_tokens(&self.config.realphone).await?;
        match self
            .push
            .send_call_invites(&targets, &call_id, &call.credentials)
            .await
        {
            Ok(()) => {
                info!(call_id = %call_id, targets = targets.len(), "Call invites dispatched")
            }
            Err(err) => {
                warn!(call_id = %call_id, error = %err,
                    "Push dispatch failed; the ring timer will close the call")
            }
        }

        self.arm_ring_timer(call_token, channel_id.to_string());
        Ok(())
    }

    fn arm_ring_timer(&self, call_token: String, channel_id: String) {
        let orchestrator = self.clone();
        let timeout = Duration::from_secs(self.config.ring_timeout_sec);
        tokio::spawn(async move {
            sleep(timeout).await;
            orchestrator.on_ring_timeout(&call_token, &channel_id).await;
        });
    }

    /// The only call-level deadline. A call that is still ringing when
    /// the timer fires gets its doorphone leg hung up; records decay by
    /// TTL so a late client sees a deterministic not-found instead of a
    /// half-open call. A call the client already connected to is left
    /// alone.
    async fn on_ring_timeout(&self, call_token: &str, channel_id: &str) {
        match self.kv.get_json::<CallRecord>(&kv::call_key(call_token)).await {
            Ok(Some(call)) => {
                if call.bridged_at.is_some() {
                    return;
                }
                info!(channel = %channel_id, "Ring timed out, hanging up doorphone leg");
                if let Err(err) = self.ari.hangup(channel_id).await {
                    warn!(channel = %channel_id, error = %err, "Hangup after ring timeout failed");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "Ring-timeout lookup failed"),
        }
    }

    /// Lease-guarded originate. Both the endpoint-state event and the
    /// fallback poller funnel through here, possibly concurrently; the
    /// lease is claimed atomically, so exactly one caller proceeds to
    /// originate and everyone else observes a no-op. A failed originate
    /// writes the lease back for the next event or poller tick.
    pub async fn try_pending_originate(&self, endpoint_id: &str) -> Result<()> {
        let key = kv::originate_key(endpoint_id);
        let pending = match self.kv.take_json::<OriginateRecord>(&key).await? {
            Some(pending) => pending,
            None => return Ok(()),
        };

        let app_args = format!("{},{}", OUTGOING_APP_ARG, pending.bridge_id);
        match self
            .ari
            .originate(&format!("PJSIP/{}", endpoint_id), &app_args)
            .await
        {
            Ok(()) => {
                info!(endpoint = %endpoint_id, bridge = %pending.bridge_id, "Client leg originated");
                self.mark_client_connected(endpoint_id).await;
            }
            Err(err) => {
                // Transient: restore the lease for the next attempt.
                warn!(endpoint = %endpoint_id, error = %err, "Originate attempt failed");
                self.kv
                    .set_json(&key, &pending, self.config.ring_timeout_sec)
                    .await?;
            }
        }
        Ok(())
    }

    /// Stamp the owning call record once the client leg is originated so
    /// the ring timer can tell a bridged call from a ringing one.
    async fn mark_client_connected(&self, endpoint_id: &str) {
        let lease = match self
            .kv
            .get_json::<EndpointRecord>(&kv::endpoint_key(endpoint_id))
            .await
        {
            Ok(Some(lease)) if lease.kind == EndpointKind::Call => lease,
            Ok(_) => return,
            Err(err) => {
                warn!(endpoint = %endpoint_id, error = %err, "Endpoint lease lookup failed");
                return;
            }
        };

        let key = kv::call_key(&lease.token);
        match self.kv.get_json::<CallRecord>(&key).await {
            Ok(Some(mut call)) => {
                call.bridged_at = Some(Utc::now());
                if let Err(err) = self
                    .kv
                    .set_json(&key, &call, self.config.call_token_ttl_sec)
                    .await
                {
                    warn!(endpoint = %endpoint_id, error = %err, "Bridged stamp not written");
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(endpoint = %endpoint_id, error = %err, "Call lookup for bridged stamp failed")
            }
        }
    }

    /// A leg we originated has entered the application: put it into its
    /// bridge and answer whichever counterpart legs have not picked up.
    async fn join_outgoing_leg(&self, channel_id: &str, bridge_id: &str) -> Result<()> {
        sleep(BRIDGE_SETTLE).await;

        if let Err(err) = self.ari.add_channel(bridge_id, channel_id).await {
            warn!(channel = %channel_id, bridge = %bridge_id, error = %err,
                "Add to bridge failed, retrying once");
            sleep(ADD_CHANNEL_RETRY).await;
            self.ari.add_channel(bridge_id, channel_id).await?;
        }

        let members = self.ari.bridge_channels(bridge_id).await?;
        for member in members.iter().filter(|m| m.as_str() != channel_id) {
            if let Err(err) = self.ari.answer(member).await {
                debug!(channel = %member, error = %err, "Counterpart answer skipped");
            }
        }

        info!(channel = %channel_id, bridge = %bridge_id, "Client leg joined bridge");
        Ok(())
    }

    /// A channel left the application. If it was a doorphone leg this is
    /// the call's terminal transition: tear down engine-side resources
    /// and the endpoint rows; the KV indexes decay by TTL and the janitor
    /// reconciles anything a crash left over.
    async fn on_channel_gone(&self, channel_id: &str) {
        let record = match self
            .kv
            .get_json::<ChannelRecord>(&kv::channel_key(channel_id))
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                warn!(channel = %channel_id, error = %err, "Channel-end lookup failed");
                return;
            }
        };

        let call = self
            .kv
            .get_json::<CallRecord>(&kv::call_key(&record.call_token))
            .await
            .ok()
            .flatten();
        if let Some(bridge_id) = call.as_ref().and_then(|c| c.bridge_id.as_deref()) {
            self.teardown_bridge(bridge_id, channel_id).await;
        }

        if let Err(err) = self.realtime.delete_ephemeral_endpoint(&record.endpoint_id).await {
            warn!(endpoint = %record.endpoint_id, error = %err, "Endpoint row delete failed");
        }
        info!(channel = %channel_id, endpoint = %record.endpoint_id, "Call torn down");
    }

    /// Hang up every remaining leg and delete the bridge. Cleanup-path
    /// failures are logged and swallowed so the rest of the teardown
    /// still runs.
    async fn teardown_bridge(&self, bridge_id: &str, gone_channel: &str) {
        match self.ari.bridge_channels(bridge_id).await {
            Ok(members) => {
                for member in members.iter().filter(|m| m.as_str() != gone_channel) {
                    if let Err(err) = self.ari.hangup(member).await {
                        warn!(channel = %member, error = %err, "Hangup of remaining leg failed");
                    }
                }
            }
            Err(err) => debug!(bridge = %bridge_id, error = %err, "Bridge inspection failed during teardown"),
        }
        if let Err(err) = self.ari.delete_bridge(bridge_id).await {
            warn!(bridge = %bridge_id, error = %err, "Bridge delete failed");
        }
    }

    /// Resolve a call token to the credentials it was minted with.
    pub async fn call_credentials(&self, call_token: &str) -> Result<CallRecord> {
        self.kv
            .get_json::<CallRecord>(&kv::call_key(call_token))
            .await?
            .ok_or_else(|| Error::NotFound("unknown call token".to_string()))
    }

    /// Client-side end/reject. The call record is deleted so a repeated
    /// end observes not-found; the weak back-references decay by TTL.
    pub async fn end_call(&self, call_token: &str) -> Result<()> {
        let key = kv::call_key(call_token);
        let call = self
            .kv
            .get_json::<CallRecord>(&key)
            .await?
            .ok_or_else(|| Error::NotFound("unknown call token".to_string()))?;

        if let Err(err) = self.ari.hangup(&call.channel_id).await {
            warn!(channel = %call.channel_id, error = %err, "Hangup on client end failed");
        }
        if let Some(bridge_id) = call.bridge_id.as_deref() {
            self.teardown_bridge(bridge_id, &call.channel_id).await;
        }
        self.kv.del(&key).await?;

        info!(call_id = %call.call_id, "Call ended by client");
        Ok(())
    }

    /// Mint a disposable outbound identity for a client-initiated call.
    pub async fn mint_outgoing(&self) -> Result<(String, SipCredentials)> {
        let id = Uuid::new_v4().to_string();
        let endpoint_id = format!("{}{}", OUTBOUND_PREFIX, id);
        let token = mint_secret(TOKEN_LEN);
        let password = mint_secret(PASSWORD_LEN);
        let credentials = SipCredentials {
            username: endpoint_id.clone(),
            password: password.clone(),
            domain: self.config.server_domain.clone(),
            host: self.config.server_ip.clone(),
        };

        self.realtime
            .create_ephemeral_endpoint(&EphemeralEndpoint {
                id: endpoint_id.clone(),
                username: endpoint_id.clone(),
                password,
                context: ENDPOINT_CONTEXT.to_string(),
                template_id: TEMPLATE_CLIENT.to_string(),
            })
            .await?;

        let ttl = self.config.call_token_ttl_sec;
        self.kv
            .set_json(
                &kv::endpoint_key(&endpoint_id),
                &EndpointRecord {
                    kind: EndpointKind::Outgoing,
                    token: token.clone(),
                },
                ttl,
            )
            .await?;
        self.kv
            .set_json(
                &kv::outgoing_key(&token),
                &OutgoingRecord {
                    endpoint_id: endpoint_id.clone(),
                    credentials: credentials.clone(),
                },
                ttl,
            )
            .await?;

        info!(endpoint = %endpoint_id, "Outgoing identity minted");
        Ok((token, credentials))
    }

    /// Symmetric cleanup for a minted outbound identity.
    pub async fn cleanup_outgoing(&self, token: &str) -> Result<()> {
        let key = kv::outgoing_key(token);
        let record = self
            .kv
            .get_json::<OutgoingRecord>(&key)
            .await?
            .ok_or_else(|| Error::NotFound("unknown outgoing token".to_string()))?;

        if let Err(err) = self
            .realtime
            .delete_ephemeral_endpoint(&record.endpoint_id)
            .await
        {
            warn!(endpoint = %record.endpoint_id, error = %err, "Outgoing endpoint row delete failed");
        }
        self.kv.del(&kv::endpoint_key(&record.endpoint_id)).await?;
        self.kv.del(&key).await?;

        info!(endpoint = %record.endpoint_id, "Outgoing identity cleaned up");
        Ok(())
    }
}

/// Whether an endpoint id belongs to the disposable namespace.
pub fn is_disposable(endpoint_id: &str) -> bool {
    endpoint_id.starts_with(INBOUND_PREFIX) || endpoint_id.starts_with(OUTBOUND_PREFIX)
}

fn mint_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_disposable() {
        assert!(is_disposable("tmp_8c1f"));
        assert!(is_disposable("out_8c1f"));
        assert!(!is_disposable("door-0001"));
        assert!(!is_disposable("template"));
    }

    #[test]
    fn test_mint_secret_length_and_charset() {
        let secret = mint_secret(PASSWORD_LEN);
        assert_eq!(secret.len(), PASSWORD_LEN);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(mint_secret(PASSWORD_LEN), mint_secret(PASSWORD_LEN));
    }

    #[test]
    fn test_outgoing_app_args_shape() {
        let app_args = format!("{},{}", OUTGOING_APP_ARG, "bridge-7");
        assert_eq!(app_args, "outgoing,bridge-7");
    }
}
