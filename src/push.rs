//! Push dispatcher
//!
//! Sends data-only call invites to registered mobile devices so the OS
//! wakes the app's background handler. Delivery is best-effort: the
//! orchestrator warns on failure and lets the ring timer close the call.

use serde_json::{json, Value};
use tracing::debug;

use crate::kv::SipCredentials;
use crate::realtime::PushTarget;
use crate::{Error, Result};

const PUSH_ENDPOINT: &str = "https://exp.host/--/api/v2/push/send";

#[derive(Clone)]
pub struct PushDispatcher {
    http: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
}

impl PushDispatcher {
    pub fn new(access_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: PUSH_ENDPOINT.to_string(),
            access_token,
        }
    }

    /// Vendor envelope for one device: high priority, data-only, carrying
    /// everything the client needs to register and join.
    fn call_invite(target: &PushTarget, call_id: &str, credentials: &SipCredentials) -> Value {
        json!({
            "to": target.token,
            "priority": "high",
            "data": {
                "type": "SIP_CALL",
                "callId": call_id,
                "sipCredentials": credentials,
            }
        })
    }

    /// Dispatch one invite per registered device. Partial failures across
    /// the batch collapse into a single error reporting the count and the
    /// first cause.
    pub async fn send_call_invites(
        &self,
        targets: &[PushTarget],
        call_id: &str,
        credentials: &SipCredentials,
    ) -> Result<()> {
        if targets.is_empty() {
            return Err(Error::Push("no push targets registered".to_string()));
        }

        let messages: Vec<Value> = targets
            .iter()
            .map(|target| Self::call_invite(target, call_id, credentials))
            .collect();

        let mut request = self.http.post(&self.endpoint).json(&messages);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Push(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Push(format!("vendor returned {}: {}", status, body)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Push(e.to_string()))?;
        debug!(targets = targets.len(), "Push batch accepted");
        Self::check_tickets(&body, targets.len())
    }

    /// The vendor answers with one ticket per message; collapse errored
    /// tickets into an aggregate.
    fn check_tickets(body: &Value, total: usize) -> Result<()> {
        let tickets = match body.get("data").and_then(Value::as_array) {
            Some(tickets) => tickets,
            None => return Ok(()),
        };
        let mut failed = 0;
        let mut first_cause = None;
        for ticket in tickets {
            if ticket.get("status").and_then(Value::as_str) == Some("error") {
                failed += 1;
                if first_cause.is_none() {
                    first_cause = ticket
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
            }
        }
        if failed > 0 {
            return Err(Error::Push(format!(
                "{} of {} invites failed: {}",
                failed,
                total,
                first_cause.unwrap_or_else(|| "unknown cause".to_string())
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> SipCredentials {
        SipCredentials {
            username: "tmp_abc".to_string(),
            password: "s3cret".to_string(),
            domain: "intercom.example.com".to_string(),
            host: "203.0.113.10".to_string(),
        }
    }

    #[test]
    fn test_invite_envelope_is_data_only_and_high_priority() {
        let target = PushTarget {
            token: "ExponentPushToken[xyz]".to_string(),
            platform: "android".to_string(),
        };
        let envelope = PushDispatcher::call_invite(&target, "call-1", &credentials());

        assert_eq!(envelope["to"], "ExponentPushToken[xyz]");
        assert_eq!(envelope["priority"], "high");
        assert_eq!(envelope["data"]["type"], "SIP_CALL");
        assert_eq!(envelope["data"]["callId"], "call-1");
        assert_eq!(envelope["data"]["sipCredentials"]["username"], "tmp_abc");
        // Data-only: nothing for the OS to render on its own.
        assert!(envelope.get("title").is_none());
        assert!(envelope.get("body").is_none());
    }

    #[test]
    fn test_tickets_aggregate_count_and_first_cause() {
        let body = json!({
            "data": [
                {"status": "ok", "id": "1"},
                {"status": "error", "message": "DeviceNotRegistered"},
                {"status": "error", "message": "MessageTooBig"}
            ]
        });
        let err = PushDispatcher::check_tickets(&body, 3).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("2 of 3"));
        assert!(text.contains("DeviceNotRegistered"));
    }

    #[test]
    fn test_tickets_all_ok() {
        let body = json!({"data": [{"status": "ok"}, {"status": "ok"}]});
        assert!(PushDispatcher::check_tickets(&body, 2).is_ok());
    }
}
