//! Line-delimited JSON protocol spoken by keepalive backends.
//!
//! The child prints one JSON object per line on stdout: a single
//! `{"type":"ready"}` handshake after startup, then `{"type":"result"}`
//! frames matched to requests by id. Anything that is not valid JSON is
//! diagnostic log output, not protocol traffic.

use serde::Deserialize;
use serde_json::Value;

use crate::error::KeepaliveError;

/// A protocol frame received from the backend.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready,
    Result(ResultFrame),
}

/// Response to one request. `ok: false` carries the backend's error string;
/// any extra fields are the result payload.
#[derive(Debug, Deserialize)]
pub struct ResultFrame {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: serde_json::Map<String, Value>,
}

/// Parse one stdout line. `None` means "not protocol traffic".
pub fn parse_line(line: &str) -> Option<ServerMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Encode one request line. `body` must be a JSON object; `id` and `type`
/// are stamped in by the client.
pub fn encode_request(id: u64, body: &Value) -> Result<String, KeepaliveError> {
    let Value::Object(map) = body else {
        return Err(KeepaliveError::Protocol(
            "request body must be a JSON object".into(),
        ));
    };
    let mut obj = map.clone();
    obj.insert("id".into(), Value::from(id));
    obj.insert("type".into(), Value::from("request"));
    let mut line = serde_json::to_string(&Value::Object(obj))
        .map_err(|e| KeepaliveError::Protocol(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ready() {
        assert!(matches!(
            parse_line(r#"{"type":"ready"}"#),
            Some(ServerMessage::Ready)
        ));
    }

    #[test]
    fn parses_result_with_payload() {
        let msg = parse_line(r#"{"type":"result","id":7,"ok":true,"text":"hello"}"#).unwrap();
        let ServerMessage::Result(frame) = msg else {
            panic!("expected result frame");
        };
        assert_eq!(frame.id, 7);
        assert!(frame.ok);
        assert_eq!(frame.data.get("text").unwrap(), "hello");
    }

    #[test]
    fn parses_result_error() {
        let msg = parse_line(r#"{"type":"result","id":3,"ok":false,"error":"bad text"}"#).unwrap();
        let ServerMessage::Result(frame) = msg else {
            panic!("expected result frame");
        };
        assert!(!frame.ok);
        assert_eq!(frame.error.as_deref(), Some("bad text"));
    }

    #[test]
    fn non_json_lines_are_diagnostics() {
        assert!(parse_line("loading model...").is_none());
        assert!(parse_line("").is_none());
        assert!(parse_line("{not json").is_none());
    }

    #[test]
    fn encode_stamps_id_and_type() {
        let line = encode_request(42, &serde_json::json!({"op": "synthesize"})).unwrap();
        assert!(line.ends_with('\n'));
        let parsed: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["id"], 42);
        assert_eq!(parsed["type"], "request");
        assert_eq!(parsed["op"], "synthesize");
    }

    #[test]
    fn encode_rejects_non_objects() {
        assert!(encode_request(1, &serde_json::json!("nope")).is_err());
    }
}
