//! TTL'd key-value records
//!
//! Redis is the coordination substrate for everything per-call: each key
//! is a single-writer lease owned by the call that created it, and every
//! exit path can rely on expiry instead of explicit deletes. Records are
//! JSON-encoded for forward compatibility.

use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{Error, Result};

/// SIP account material handed to the mobile client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipCredentials {
    pub username: String,
    pub password: String,
    pub domain: String,
    pub host: String,
}

/// Payload behind `call:<callToken>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub channel_id: String,
    pub endpoint_id: String,
    /// Set once the mixing bridge exists
    pub bridge_id: Option<String>,
    pub credentials: SipCredentials,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Earliest instant the ring timer may close this call
    pub ends_not_before: chrono::DateTime<chrono::Utc>,
    /// Stamped when the client leg is originated; a stamped call is past
    /// ringing and the ring timer leaves it alone
    #[serde(default)]
    pub bridged_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Payload behind `channel:<channelId>`, a weak back-reference for lookup
/// and cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub call_token: String,
    pub endpoint_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Call,
    Outgoing,
}

/// Payload behind `endpoint:<endpointId>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub kind: EndpointKind,
    pub token: String,
}

/// Payload behind `originate:<endpointId>`: "when this endpoint becomes
/// reachable, originate into the bridge". Deleted on originate success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginateRecord {
    pub bridge_id: String,
    pub channel_id: String,
}

/// Payload behind `outgoing:<token>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingRecord {
    pub endpoint_id: String,
    pub credentials: SipCredentials,
}

pub fn call_key(call_token: &str) -> String {
    format!("call:{}", call_token)
}

pub fn channel_key(channel_id: &str) -> String {
    format!("channel:{}", channel_id)
}

pub fn endpoint_key(endpoint_id: &str) -> String {
    format!("endpoint:{}", endpoint_id)
}

pub fn originate_key(endpoint_id: &str) -> String {
    format!("originate:{}", endpoint_id)
}

pub fn outgoing_key(token: &str) -> String {
    format!("outgoing:{}", token)
}

/// Redis-backed store. Cheap to clone; the connection manager multiplexes
/// and reconnects underneath.
#[derive(Clone)]
pub struct KvStore {
    conn: ConnectionManager,
}

impl KvStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_sec: u64) -> Result<()> {
        let payload =
            serde_json::to_string(value).map_err(|e| Error::Internal(e.to_string()))?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, payload, ttl_sec).await?;
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(raw) => {
                let value =
                    serde_json::from_str(&raw).map_err(|e| Error::Internal(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Atomically read and delete a record (GETDEL). Exactly one of any
    /// number of concurrent callers observes the value, which makes a
    /// single SET/take pair usable as a one-shot lease.
    pub async fn take_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get_del(key).await?;
        match raw {
            Some(raw) => {
                let value =
                    serde_json::from_str(&raw).map_err(|e| Error::Internal(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_builders() {
        assert_eq!(call_key("T1"), "call:T1");
        assert_eq!(channel_key("CH1"), "channel:CH1");
        assert_eq!(endpoint_key("tmp_a"), "endpoint:tmp_a");
        assert_eq!(originate_key("tmp_a"), "originate:tmp_a");
        assert_eq!(outgoing_key("T2"), "outgoing:T2");
    }

    #[test]
    fn test_endpoint_kind_wire_form() {
        let record = EndpointRecord {
            kind: EndpointKind::Outgoing,
            token: "T".to_string(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""kind":"outgoing""#));

        let parsed: EndpointRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, EndpointKind::Outgoing);
    }
}
