//! Payload codec.
//!
//! The topic carries the addressing; the payload carries the rest of a
//! command as `{ "action": ..., "callseq": ..., "params": ... }`. The byte
//! encoding is pluggable so endpoints can agree on something other than JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, ProtocolResult};

/// String-keyed parameter mapping carried by a command.
pub type Params = Map<String, Value>;

/// Wire body of a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default, rename = "callseq")]
    pub call_seq: Option<u64>,
    #[serde(default)]
    pub params: Option<Params>,
}

/// Encodes and decodes command payload bytes.
pub trait PayloadCodec: Send + Sync {
    /// Short codec name for logs.
    fn name(&self) -> &'static str;

    /// Encode a payload to bytes.
    fn encode(&self, payload: &Payload) -> ProtocolResult<Vec<u8>>;

    /// Decode payload bytes.
    fn decode(&self, bytes: &[u8]) -> ProtocolResult<Payload>;
}

/// UTF-8 JSON payload codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, payload: &Payload) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(payload).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> ProtocolResult<Payload> {
        // An empty body is a command with no action, callseq or params
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Payload::default());
        }
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_encode_shape() {
        let payload = Payload {
            action: Some("yqmiot.method.ping".to_string()),
            call_seq: Some(7),
            params: None,
        };
        let bytes = JsonCodec.encode(&payload).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"action": "yqmiot.method.ping", "callseq": 7, "params": null})
        );
    }

    #[test]
    fn test_json_decode() {
        let payload = JsonCodec
            .decode(br#"{"action":"set","callseq":3,"params":{"on":true}}"#)
            .unwrap();
        assert_eq!(payload.action.as_deref(), Some("set"));
        assert_eq!(payload.call_seq, Some(3));
        assert_eq!(payload.params.unwrap().get("on"), Some(&json!(true)));
    }

    #[test]
    fn test_json_decode_missing_fields() {
        let payload = JsonCodec.decode(br#"{"params":{"t":21.5}}"#).unwrap();
        assert!(payload.action.is_none());
        assert!(payload.call_seq.is_none());

        assert_eq!(JsonCodec.decode(b"").unwrap(), Payload::default());
    }

    #[test]
    fn test_json_decode_invalid() {
        assert!(matches!(JsonCodec.decode(b"{not json"), Err(ProtocolError::Decode(_))));
        assert!(matches!(
            JsonCodec.decode(br#"{"callseq":"seven"}"#),
            Err(ProtocolError::Decode(_))
        ));
        assert!(matches!(JsonCodec.decode(br#"[1,2]"#), Err(ProtocolError::Decode(_))));
    }
}
