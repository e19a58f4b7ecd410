// src/protocol/mod.rs

//! Supervisor/worker wire protocol.
//!
//! Both directions carry concatenated JSON objects:
//!
//! | direction           | first message               | later messages                    |
//! |---------------------|-----------------------------|-----------------------------------|
//! | supervisor → worker | `{"initData": ...}`         | `{"message": {...}}`              |
//! | worker → supervisor | `{"initSuccess": true}` or `{"initError": ...}` | `{"response": ...}` or `{"error": ...}` |
//!
//! - [`framer`] turns the raw stdout byte stream back into values.
//! - This module builds outgoing messages and classifies incoming ones. It
//!   does not decide what a classification means for the worker; that is
//!   the worker state machine's job.

pub mod framer;

pub use framer::{FrameError, JsonFramer};

use serde_json::{Map, Value, json};

/// Handshake sent as the very first message to a fresh subprocess.
pub fn encode_init(init_data: &Value) -> Vec<u8> {
    json!({ "initData": init_data }).to_string().into_bytes()
}

/// Envelope for one task payload.
pub fn encode_message(payload: &Value) -> Vec<u8> {
    json!({ "message": payload }).to_string().into_bytes()
}

/// What a subprocess answered to the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum InitResponse {
    Success,
    Error(Value),
    /// Neither `initSuccess` nor `initError`.
    Invalid(Value),
}

impl InitResponse {
    pub fn classify(value: Value) -> Self {
        match value {
            Value::Object(mut map) => {
                if let Some(err) = map.remove("initError") {
                    InitResponse::Error(err)
                } else if map.contains_key("initSuccess") {
                    InitResponse::Success
                } else {
                    InitResponse::Invalid(Value::Object(map))
                }
            }
            other => InitResponse::Invalid(other),
        }
    }
}

/// What a subprocess answered to a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResponse {
    Response(Value),
    Error(Value),
    /// Neither `response` nor `error`.
    Malformed(Value),
}

impl TaskResponse {
    /// An `error` key wins over a `response` key when both are present.
    pub fn classify(value: Value) -> Self {
        match value {
            Value::Object(mut map) => {
                if let Some(err) = map.remove("error") {
                    TaskResponse::Error(err)
                } else if let Some(resp) = map.remove("response") {
                    TaskResponse::Response(resp)
                } else {
                    TaskResponse::Malformed(Value::Object(map))
                }
            }
            other => TaskResponse::Malformed(other),
        }
    }
}

/// Compact rendering of a payload for error messages.
pub(crate) fn render(value: &Value) -> String {
    value.to_string()
}

/// Compact rendering of several decoded values, as a JSON array.
pub(crate) fn render_all(values: &[Value]) -> String {
    Value::Array(values.to_vec()).to_string()
}

/// A payload is acceptable as a task only if it is a JSON object.
pub(crate) fn as_task_payload(payload: &Value) -> Option<&Map<String, Value>> {
    payload.as_object()
}
