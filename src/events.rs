//! Typed events from the telephony engine

use serde::Deserialize;

/// One leg of a call from the engine's perspective. Only the id matters
/// here; everything else the engine reports is dropped on decode.
#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
}

/// SIP endpoint as reported by the engine
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub resource: String,
    #[serde(default)]
    pub state: String,
}

/// Engine events the orchestrator reacts to. Everything else decodes to
/// `Other` and is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    StasisStart {
        channel: Channel,
        #[serde(default)]
        args: Vec<String>,
    },
    StasisEnd {
        channel: Channel,
    },
    EndpointStateChange {
        endpoint: Endpoint,
    },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_stasis_start() {
        let payload = r#"{
            "type": "StasisStart",
            "application": "domophone",
            "args": ["outgoing", "bridge-1"],
            "channel": {"id": "CH1", "name": "PJSIP/door-0001", "state": "Ring"}
        }"#;

        match serde_json::from_str::<AriEvent>(payload).unwrap() {
            AriEvent::StasisStart { channel, args } => {
                assert_eq!(channel.id, "CH1");
                assert_eq!(args, vec!["outgoing", "bridge-1"]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_stasis_start_without_args() {
        let payload = r#"{"type": "StasisStart", "channel": {"id": "CH2"}}"#;

        match serde_json::from_str::<AriEvent>(payload).unwrap() {
            AriEvent::StasisStart { channel, args } => {
                assert_eq!(channel.id, "CH2");
                assert!(args.is_empty());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_endpoint_state_change() {
        let payload = r#"{
            "type": "EndpointStateChange",
            "endpoint": {"technology": "PJSIP", "resource": "tmp_abc", "state": "online"}
        }"#;

        match serde_json::from_str::<AriEvent>(payload).unwrap() {
            AriEvent::EndpointStateChange { endpoint } => {
                assert_eq!(endpoint.resource, "tmp_abc");
                assert_eq!(endpoint.state, "online");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_kind_decodes_to_other() {
        let payload = r#"{"type": "ChannelDtmfReceived", "digit": "5"}"#;
        assert!(matches!(
            serde_json::from_str::<AriEvent>(payload).unwrap(),
            AriEvent::Other
        ));
    }

    #[test]
    fn test_invalid_payload_is_an_error() {
        assert!(serde_json::from_str::<AriEvent>("not json").is_err());
        assert!(serde_json::from_str::<AriEvent>(r#"{"type": "StasisStart"}"#).is_err());
    }
}
