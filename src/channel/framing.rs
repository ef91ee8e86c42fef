//! Line framing for the stdio protocol
//!
//! Every protocol message is one UTF-8 line: a fixed magic prefix followed by a
//! JSON object. Anything the child prints without the prefix is passthrough
//! output and is never parsed.
//!
//! ```text
//! PYIPCHEAD_{"call":"ping","id":"3f2a_1","data":{}}\n      host -> child
//! PYIPCHEAD_{"id":"3f2a_1","data":{"pong":true}}\n         child -> host
//! PYIPCHEAD_{"id":"3f2a_1","error":"boom"}\n               child -> host
//! PYIPCHEAD_{}\n                                           heartbeat
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{Error, Result};

/// Marker that distinguishes protocol lines from incidental child output
pub const MAGIC_PREFIX: &str = "PYIPCHEAD_";

/// Payload carried by calls and successful replies
pub type Payload = Map<String, JsonValue>;

/// Outbound call (host -> child)
#[derive(Debug, Serialize)]
struct CallMessage<'a> {
    call: &'a str,
    id: &'a str,
    data: &'a Payload,
}

/// Outbound reply (child -> host)
#[derive(Debug, Serialize)]
struct ReplyMessage<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Loose shape of any inbound protocol object
#[derive(Debug, Default, Deserialize)]
struct RawMessage {
    #[serde(default)]
    call: Option<String>,
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(default)]
    error: Option<JsonValue>,
}

/// A decoded reply from the child
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Data { id: String, data: Payload },
    Error { id: String, message: String },
}

impl Response {
    /// Correlation id this reply answers
    pub fn id(&self) -> &str {
        match self {
            Response::Data { id, .. } | Response::Error { id, .. } => id,
        }
    }
}

/// Classification of one line read from the child's stdout
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Non-protocol output, with line terminators stripped
    Passthrough(String),
    /// Empty protocol object
    Heartbeat,
    Response(Response),
}

/// A decoded call from the host, as seen by the child
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub call: String,
    pub id: String,
    pub data: Payload,
}

/// Normalize call arguments into a payload mapping.
///
/// `null` becomes an empty mapping; anything other than an object is rejected.
pub fn into_payload(args: JsonValue) -> Result<Payload> {
    match args {
        JsonValue::Null => Ok(Payload::new()),
        JsonValue::Object(map) => Ok(map),
        other => Err(Error::InvalidPayload(format!(
            "call arguments must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

/// Encode a call as one newline-terminated protocol line
pub fn encode_call(call: &str, id: &str, data: &Payload) -> Result<String> {
    let message = CallMessage { call, id, data };
    Ok(frame(serde_json::to_string(&message)?))
}

/// Encode a successful reply
pub fn encode_data(id: &str, data: &Payload) -> Result<String> {
    let message = ReplyMessage {
        id,
        data: Some(data),
        error: None,
    };
    Ok(frame(serde_json::to_string(&message)?))
}

/// Encode an error reply
pub fn encode_error(id: &str, error: &str) -> Result<String> {
    let message = ReplyMessage {
        id,
        data: None,
        error: Some(error),
    };
    Ok(frame(serde_json::to_string(&message)?))
}

/// Encode a heartbeat line
pub fn encode_heartbeat() -> String {
    frame("{}".to_string())
}

/// Decode one line read from the child's stdout
pub fn decode_line(line: &str) -> Result<Frame> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(body) = line.strip_prefix(MAGIC_PREFIX) else {
        return Ok(Frame::Passthrough(line.to_string()));
    };

    let object = parse_object(body)?;
    if object.is_empty() {
        return Ok(Frame::Heartbeat);
    }

    let raw: RawMessage = serde_json::from_value(JsonValue::Object(object))
        .map_err(|e| Error::Protocol(format!("Malformed message: {}", e)))?;
    let id = id_to_string(raw.id);

    if let Some(error) = raw.error {
        let message = match error {
            JsonValue::String(s) => s,
            other => other.to_string(),
        };
        return Ok(Frame::Response(Response::Error { id, message }));
    }

    // A malformed reply still answers its call, so the caller is not left waiting
    let response = match raw.data {
        None | Some(JsonValue::Null) => Response::Data {
            id,
            data: Payload::new(),
        },
        Some(JsonValue::Object(map)) => Response::Data { id, data: map },
        Some(other) => Response::Error {
            id,
            message: format!("Reply data must be an object, got {}", json_kind(&other)),
        },
    };

    Ok(Frame::Response(response))
}

/// Decode one line read from the host, as the child does.
///
/// Returns `None` for anything that is not a prefixed JSON object. Missing or
/// non-object `data` is treated as an empty mapping.
pub fn decode_request(line: &str) -> Option<Request> {
    let line = line.trim_end_matches(['\r', '\n']);
    let body = line.strip_prefix(MAGIC_PREFIX)?;
    let object = parse_object(body).ok()?;
    let raw: RawMessage = serde_json::from_value(JsonValue::Object(object)).ok()?;

    let data = match raw.data {
        Some(JsonValue::Object(map)) => map,
        _ => Payload::new(),
    };

    Some(Request {
        call: raw.call.unwrap_or_default(),
        id: id_to_string(raw.id),
        data,
    })
}

fn frame(body: String) -> String {
    let mut line = String::with_capacity(MAGIC_PREFIX.len() + body.len() + 1);
    line.push_str(MAGIC_PREFIX);
    line.push_str(&body);
    line.push('\n');
    line
}

fn parse_object(body: &str) -> Result<Payload> {
    match serde_json::from_str::<JsonValue>(body) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(other) => Err(Error::Protocol(format!(
            "Expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(Error::Protocol(format!("Invalid JSON: {}", e))),
    }
}

fn id_to_string(id: Option<JsonValue>) -> String {
    match id {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: JsonValue) -> Payload {
        into_payload(value).unwrap()
    }

    #[test]
    fn test_encode_call_is_one_prefixed_line() {
        let line = encode_call("ping", "1", &Payload::new()).unwrap();
        assert_eq!(line, "PYIPCHEAD_{\"call\":\"ping\",\"id\":\"1\",\"data\":{}}\n");
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_encode_escapes_embedded_newlines() {
        let data = payload(json!({"text": "a\nb"}));
        let line = encode_call("say", "", &data).unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_decode_passthrough() {
        let frame = decode_line("hello from the child\r\n").unwrap();
        assert_eq!(frame, Frame::Passthrough("hello from the child".to_string()));

        // Prefix must be at the very start of the line
        let frame = decode_line(" PYIPCHEAD_{}").unwrap();
        assert!(matches!(frame, Frame::Passthrough(_)));
    }

    #[test]
    fn test_decode_heartbeat() {
        assert_eq!(decode_line("PYIPCHEAD_{}\n").unwrap(), Frame::Heartbeat);
        assert_eq!(decode_line("PYIPCHEAD_ { }\r\n").unwrap(), Frame::Heartbeat);
    }

    #[test]
    fn test_decode_data_reply() {
        let frame = decode_line(r#"PYIPCHEAD_{"id":"1","data":{"pong":true}}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Response(Response::Data {
                id: "1".to_string(),
                data: payload(json!({"pong": true})),
            })
        );
    }

    #[test]
    fn test_decode_error_reply_wins_over_data() {
        let frame = decode_line(r#"PYIPCHEAD_{"id":"7","error":"boom","data":{}}"#).unwrap();
        match frame {
            Frame::Response(Response::Error { id, message }) => {
                assert_eq!(id, "7");
                assert_eq!(message, "boom");
            }
            other => panic!("Expected error reply, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_reply_without_data_is_empty_mapping() {
        let frame = decode_line(r#"PYIPCHEAD_{"id":"2"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Response(Response::Data {
                id: "2".to_string(),
                data: Payload::new(),
            })
        );
    }

    #[test]
    fn test_decode_rejects_garbage_after_prefix() {
        assert!(matches!(
            decode_line("PYIPCHEAD_{not json"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(decode_line("PYIPCHEAD_[1,2]"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_decode_non_object_data_becomes_error_reply() {
        let frame = decode_line(r#"PYIPCHEAD_{"id":"x_1","data":[1,2]}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Response(Response::Error {
                id: "x_1".to_string(),
                message: "Reply data must be an object, got an array".to_string(),
            })
        );
    }

    #[test]
    fn test_decode_request() {
        let line = encode_call("echo", "abc_3", &payload(json!({"x": 1}))).unwrap();
        let request = decode_request(&line).unwrap();
        assert_eq!(request.call, "echo");
        assert_eq!(request.id, "abc_3");
        assert_eq!(request.data, payload(json!({"x": 1})));
    }

    #[test]
    fn test_decode_request_tolerates_missing_fields() {
        let request = decode_request(r#"PYIPCHEAD_{"call":"ping","data":5}"#).unwrap();
        assert_eq!(request.id, "");
        assert!(request.data.is_empty());

        assert!(decode_request("ping").is_none());
        assert!(decode_request("PYIPCHEAD_nope").is_none());
    }

    #[test]
    fn test_encode_replies() {
        let line = encode_data("1", &payload(json!({"ok": true}))).unwrap();
        assert_eq!(line, "PYIPCHEAD_{\"id\":\"1\",\"data\":{\"ok\":true}}\n");

        let line = encode_error("1", "No handler: nope").unwrap();
        assert_eq!(line, "PYIPCHEAD_{\"id\":\"1\",\"error\":\"No handler: nope\"}\n");

        assert_eq!(encode_heartbeat(), "PYIPCHEAD_{}\n");
    }

    #[test]
    fn test_into_payload() {
        assert!(into_payload(JsonValue::Null).unwrap().is_empty());
        assert!(matches!(
            into_payload(json!([1, 2])),
            Err(Error::InvalidPayload(_))
        ));
    }
}
