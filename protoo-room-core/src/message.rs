//! Protoo wire frames
//!
//! The three frame kinds exchanged over the signaling socket. This is the only
//! place where payloads are handled as untyped JSON documents; everything above
//! it goes through the per-method schema in [`crate::methods`].

use crate::peer::ProtooError;
use serde_json::{json, Map, Value};

/// A parsed protoo frame
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request expecting a response
    Request(Request),
    /// Response to a previously sent request
    Response(Response),
    /// One-way notification
    Notification(Notification),
}

/// Request frame: `{request: true, id, method, data}`
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id
    pub id: u32,
    /// Method name
    pub method: String,
    /// Payload
    pub data: Value,
}

/// Response frame: `{response: true, id, ok, data | errorCode + errorReason}`
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request being answered
    pub id: u32,
    /// Outcome
    pub body: ResponseBody,
}

/// Success or failure carried by a response
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// `ok: true` with its data
    Ok(Value),
    /// `ok: false` with the server's code and reason
    Err {
        /// `errorCode`
        code: i64,
        /// `errorReason`
        reason: String,
    },
}

/// Notification frame: `{notification: true, method, data}`
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name
    pub method: String,
    /// Payload
    pub data: Value,
}

impl Message {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns [`ProtooError::InvalidMessage`] if the text is not JSON or does
    /// not match any of the three frame shapes.
    pub fn parse(text: &str) -> Result<Self, ProtooError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtooError::InvalidMessage(format!("not JSON: {e}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| ProtooError::InvalidMessage("frame is not an object".to_string()))?;

        if flag(object, "request") {
            let id = parse_id(object)?;
            let method = parse_method(object)?;
            Ok(Self::Request(Request {
                id,
                method,
                data: parse_data(object),
            }))
        } else if flag(object, "response") {
            let id = parse_id(object)?;
            let ok = object
                .get("ok")
                .and_then(Value::as_bool)
                .ok_or_else(|| ProtooError::InvalidMessage("response without ok".to_string()))?;
            let body = if ok {
                ResponseBody::Ok(parse_data(object))
            } else {
                ResponseBody::Err {
                    code: object.get("errorCode").and_then(Value::as_i64).unwrap_or(0),
                    reason: object
                        .get("errorReason")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }
            };
            Ok(Self::Response(Response { id, body }))
        } else if flag(object, "notification") {
            let method = parse_method(object)?;
            Ok(Self::Notification(Notification {
                method,
                data: parse_data(object),
            }))
        } else {
            Err(ProtooError::InvalidMessage(
                "frame is neither request, response nor notification".to_string(),
            ))
        }
    }

    /// Serialize into a text frame
    #[must_use]
    pub fn to_text(&self) -> String {
        let value = match self {
            Self::Request(r) => json!({
                "request": true,
                "id": r.id,
                "method": r.method,
                "data": r.data,
            }),
            Self::Response(r) => match &r.body {
                ResponseBody::Ok(data) => json!({
                    "response": true,
                    "id": r.id,
                    "ok": true,
                    "data": data,
                }),
                ResponseBody::Err { code, reason } => json!({
                    "response": true,
                    "id": r.id,
                    "ok": false,
                    "errorCode": code,
                    "errorReason": reason,
                }),
            },
            Self::Notification(n) => json!({
                "notification": true,
                "method": n.method,
                "data": n.data,
            }),
        };
        value.to_string()
    }
}

fn flag(object: &Map<String, Value>, key: &str) -> bool {
    object.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn parse_id(object: &Map<String, Value>) -> Result<u32, ProtooError> {
    object
        .get("id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| ProtooError::InvalidMessage("missing or invalid id".to_string()))
}

fn parse_method(object: &Map<String, Value>) -> Result<String, ProtooError> {
    object
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtooError::InvalidMessage("missing method".to_string()))
}

// Absent data is an empty object on the wire.
fn parse_data(object: &Map<String, Value>) -> Value {
    match object.get("data") {
        Some(Value::Null) | None => Value::Object(Map::new()),
        Some(data) => data.clone(),
    }
}
