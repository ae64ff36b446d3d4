// gate-protocol: gateway wire protocol types, codec, and error taxonomy.
//
// All frames are UTF-8 JSON objects discriminated by a top-level `type`
// field.  Client requests carry a numeric `id` echoed back on exactly one
// terminal frame; server pushes and heartbeat frames carry no `id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

pub mod error;
pub mod ops;

pub use error::{ErrorCode, GatewayError};
pub use ops::{Namespace, Operation, Tier};

/// Protocol version advertised in the welcome frame.
pub const PROTOCOL_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Server -> client frames
// ---------------------------------------------------------------------------

/// First frame after the WebSocket upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub version: String,
    /// Epoch milliseconds at send time.
    pub server_time: i64,
    pub requires_auth: bool,
}

/// Terminal success frame for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFrame {
    pub id: Number,
    pub data: Value,
}

/// Terminal error frame for a request.
///
/// `id` is 0 when the failing frame did not yield a usable numeric id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub id: Number,
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Push channels.  `subscription` frames carry store-query snapshots,
/// `event` frames carry rules-topic matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Subscription,
    Event,
}

/// Server-initiated push for a live subscription.  Never carries an `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushFrame {
    pub channel: Channel,
    pub subscription_id: String,
    pub data: Value,
}

/// Heartbeat probe (server -> client).  The client echoes the timestamp in
/// a `pong` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingFrame {
    pub timestamp: i64,
}

/// Out-of-band server notice.  `shutdown` carries the grace period granted
/// for voluntary disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_ms: Option<u64>,
}

/// All server-to-client frame kinds, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome(Welcome),
    Result(ResultFrame),
    Error(ErrorFrame),
    Push(PushFrame),
    Ping(PingFrame),
    System(SystemFrame),
}

impl ServerFrame {
    pub fn result(id: Number, data: Value) -> Self {
        ServerFrame::Result(ResultFrame { id, data })
    }

    pub fn error(id: Number, err: GatewayError) -> Self {
        ServerFrame::Error(ErrorFrame {
            id,
            code: err.code,
            message: err.message,
            details: err.details,
        })
    }

    /// Error frame for failures where no request id could be extracted.
    pub fn error_without_id(err: GatewayError) -> Self {
        ServerFrame::error(Number::from(0u32), err)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Client -> server frames
// ---------------------------------------------------------------------------

/// A validated client request: numeric id, operation name, and the full
/// frame body for operation-specific field extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Number,
    pub op: String,
    pub body: Map<String, Value>,
}

impl Request {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.body.get(name).and_then(Value::as_str)
    }

    pub fn u64_field(&self, name: &str) -> Option<u64> {
        self.body.get(name).and_then(Value::as_u64)
    }

    pub fn i64_field(&self, name: &str) -> Option<i64> {
        self.body.get(name).and_then(Value::as_i64)
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.body.get(name).and_then(Value::as_bool)
    }

    /// Required string field; absence is a `VALIDATION_ERROR`.
    pub fn require_str(&self, name: &str) -> Result<&str, GatewayError> {
        self.str_field(name)
            .ok_or_else(|| GatewayError::validation(format!("missing or invalid field `{name}`")))
    }

    /// Required field of any type; absence is a `VALIDATION_ERROR`.
    pub fn require_field(&self, name: &str) -> Result<&Value, GatewayError> {
        self.field(name)
            .ok_or_else(|| GatewayError::validation(format!("missing field `{name}`")))
    }
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(Request),
    /// Heartbeat echo; carries the client-reported timestamp.
    Pong { timestamp: f64 },
    /// A malformed pong.  Dropped without an error frame -- liveness is
    /// enforced by the heartbeat timing check, not by pong validation.
    Ignored,
}

/// Decode and validate one inbound text frame.
///
/// Validation is fail-fast in a fixed order:
///
/// 1. JSON parse          -> `PARSE_ERROR`
/// 2. must be an object   -> `PARSE_ERROR`
/// 3. `type` non-empty    -> `INVALID_REQUEST`
/// 4. `pong` special case (no id required; malformed pongs are dropped)
/// 5. finite numeric `id` -> `INVALID_REQUEST`
///
/// Every error returned here is emitted with `id = 0`.
pub fn decode(text: &str) -> Result<Inbound, GatewayError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| GatewayError::new(ErrorCode::ParseError, format!("invalid JSON: {e}")))?;

    let Value::Object(body) = value else {
        return Err(GatewayError::new(
            ErrorCode::ParseError,
            "frame must be a JSON object",
        ));
    };

    let op = match body.get("type").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_owned(),
        _ => {
            return Err(GatewayError::new(
                ErrorCode::InvalidRequest,
                "missing or empty `type` field",
            ));
        }
    };

    if op == "pong" {
        return Ok(match body.get("timestamp").and_then(Value::as_f64) {
            Some(ts) if ts.is_finite() => Inbound::Pong { timestamp: ts },
            _ => Inbound::Ignored,
        });
    }

    let id = match body.get("id") {
        Some(Value::Number(n)) if n.as_f64().is_some_and(f64::is_finite) => n.clone(),
        _ => {
            return Err(GatewayError::new(
                ErrorCode::InvalidRequest,
                "missing or non-numeric `id` field",
            ));
        }
    };

    Ok(Inbound::Request(Request { id, op, body }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_invalid_json_as_parse_error() {
        let err = decode("{not-json").unwrap_err();
        assert_eq!(err.code, ErrorCode::ParseError);
    }

    #[test]
    fn decode_rejects_non_object_frames_as_parse_error() {
        for frame in ["[1,2]", "null", "42", "\"hi\""] {
            let err = decode(frame).unwrap_err();
            assert_eq!(err.code, ErrorCode::ParseError, "frame: {frame}");
        }
    }

    #[test]
    fn decode_rejects_missing_or_empty_type_as_invalid_request() {
        for frame in [r#"{"id":1}"#, r#"{"id":1,"type":""}"#, r#"{"id":1,"type":7}"#] {
            let err = decode(frame).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidRequest, "frame: {frame}");
        }
    }

    #[test]
    fn decode_accepts_pong_without_id() {
        let inbound = decode(r#"{"type":"pong","timestamp":1234.0}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Pong {
                timestamp: 1234.0
            }
        );
    }

    #[test]
    fn decode_drops_malformed_pong_silently() {
        for frame in [
            r#"{"type":"pong"}"#,
            r#"{"type":"pong","timestamp":"later"}"#,
        ] {
            assert_eq!(decode(frame).unwrap(), Inbound::Ignored, "frame: {frame}");
        }
    }

    #[test]
    fn decode_requires_numeric_id_for_requests() {
        for frame in [
            r#"{"type":"store.get"}"#,
            r#"{"type":"store.get","id":"1"}"#,
            r#"{"type":"store.get","id":null}"#,
        ] {
            let err = decode(frame).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidRequest, "frame: {frame}");
        }
    }

    #[test]
    fn decode_returns_request_with_body_fields() {
        let inbound = decode(r#"{"id":7,"type":"store.get","bucket":"tasks","key":"k1"}"#).unwrap();
        let Inbound::Request(req) = inbound else {
            panic!("expected request");
        };
        assert_eq!(req.id, Number::from(7u32));
        assert_eq!(req.op, "store.get");
        assert_eq!(req.str_field("bucket"), Some("tasks"));
        assert_eq!(req.str_field("key"), Some("k1"));
        assert!(req.require_str("missing").is_err());
    }

    #[test]
    fn server_frames_serialize_with_type_tag_and_camel_case() {
        let welcome = ServerFrame::Welcome(Welcome {
            version: PROTOCOL_VERSION.to_owned(),
            server_time: 1000,
            requires_auth: true,
        });
        let json: Value = serde_json::from_str(&welcome.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "welcome");
        assert_eq!(json["version"], "1.0.0");
        assert_eq!(json["serverTime"], 1000);
        assert_eq!(json["requiresAuth"], true);

        let push = ServerFrame::Push(PushFrame {
            channel: Channel::Subscription,
            subscription_id: "s1".to_owned(),
            data: Value::Array(vec![]),
        });
        let json: Value = serde_json::from_str(&push.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "push");
        assert_eq!(json["channel"], "subscription");
        assert_eq!(json["subscriptionId"], "s1");
        assert!(json.get("id").is_none(), "push frames must not carry an id");
    }

    #[test]
    fn error_frame_defaults_to_id_zero_and_elides_missing_details() {
        let frame = ServerFrame::error_without_id(GatewayError::validation("bad"));
        let json: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["id"], 0);
        assert_eq!(json["code"], "VALIDATION_ERROR");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn system_shutdown_frame_carries_grace_period() {
        let frame = ServerFrame::System(SystemFrame {
            event: "shutdown".to_owned(),
            grace_period_ms: Some(500),
        });
        let json: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "system");
        assert_eq!(json["event"], "shutdown");
        assert_eq!(json["gracePeriodMs"], 500);
    }
}
