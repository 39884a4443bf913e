use std::collections::BTreeMap;

use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::{actuator::Actuator, topics::rpc_request_id};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("missing `enabled` field")]
    MissingEnabled,
    #[error("`enabled` must be 0 or 1, got {0}")]
    InvalidEnabled(&'static str),
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("method `{0}` registered twice")]
    DuplicateMethod(&'static str),
    #[error("dispatch table needs {requested} subscriptions, transport allows {capacity}")]
    TooManySubscriptions { requested: usize, capacity: usize },
    #[error("payload of {size} bytes exceeds the {limit} byte bound")]
    Oversized { size: usize, limit: usize },
    #[error("malformed rpc envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Inbound command envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcRequest {
    #[serde(skip)]
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Decodes an inbound publish. `Ok(None)` means the topic is not an RPC request.
    pub fn from_publish(topic: &str, payload: &[u8], limit: usize) -> Result<Option<Self>, RpcError> {
        let Some(id) = rpc_request_id(topic) else {
            return Ok(None);
        };
        if payload.len() > limit {
            return Err(RpcError::Oversized {
                size: payload.len(),
                limit,
            });
        }

        let mut request: RpcRequest = serde_json::from_slice(payload)?;
        request.id = id;
        Ok(Some(request))
    }
}

/// Outbound reply body.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse(pub Value);

impl RpcResponse {
    pub fn state(energized: bool) -> Self {
        Self(Value::Bool(energized))
    }

    pub fn status(actuator: Actuator, energized: bool) -> Self {
        let mut body = Map::new();
        body.insert(actuator.key().to_string(), Value::Bool(energized));
        Self(Value::Object(body))
    }

    pub fn error(err: &RpcError) -> Self {
        Self(json!({ "error": err.to_string() }))
    }

    pub fn encode(&self, limit: usize) -> Result<Vec<u8>, RpcError> {
        encode_bounded(&self.0, limit)
    }
}

pub(crate) fn encode_bounded(value: &Value, limit: usize) -> Result<Vec<u8>, RpcError> {
    let body = serde_json::to_vec(value)?;
    if body.len() > limit {
        return Err(RpcError::Oversized {
            size: body.len(),
            limit,
        });
    }
    Ok(body)
}

/// Encodes a single `{"key": value}` attribute or telemetry body.
pub fn encode_key_value(key: &str, value: &Value, limit: usize) -> Result<Vec<u8>, RpcError> {
    let mut body = Map::new();
    body.insert(key.to_string(), value.clone());
    encode_bounded(&Value::Object(body), limit)
}

pub fn decode_enabled(params: &Value) -> Result<bool, RpcError> {
    let enabled = params.get("enabled").ok_or(RpcError::MissingEnabled)?;
    match enabled.as_i64() {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        Some(_) => Err(RpcError::InvalidEnabled("another integer")),
        None => Err(RpcError::InvalidEnabled(kind_of(enabled))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(number) if number.is_u64() => "another integer",
        Value::Number(_) => "a non-integer",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

const ECHOED_METHOD_CHARS: usize = 32;

impl RpcError {
    /// Echoes at most a short, escape-free prefix of the caller's method name.
    pub fn unknown_method(method: &str) -> Self {
        let mut echoed: String = method
            .chars()
            .take(ECHOED_METHOD_CHARS)
            .map(|c| {
                if c.is_ascii_graphic() && c != '"' && c != '\\' {
                    c
                } else {
                    '?'
                }
            })
            .collect();
        if method.chars().count() > ECHOED_METHOD_CHARS {
            echoed.push_str("...");
        }
        Self::UnknownMethod(echoed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcHandler {
    Set(Actuator),
    Get(Actuator),
}

#[derive(Debug, Clone)]
pub struct DispatchTable {
    routes: BTreeMap<&'static str, RpcHandler>,
    capacity: usize,
}

impl DispatchTable {
    pub fn empty(capacity: usize) -> Self {
        Self {
            routes: BTreeMap::new(),
            capacity,
        }
    }

    /// Full relay table: one set and one get method per actuator.
    pub fn relays(capacity: usize) -> Result<Self, RpcError> {
        let requested = Actuator::ALL.len() * 2;
        if requested > capacity {
            return Err(RpcError::TooManySubscriptions {
                requested,
                capacity,
            });
        }

        let mut table = Self::empty(capacity);
        for actuator in Actuator::ALL {
            table.register(actuator.set_method(), RpcHandler::Set(actuator))?;
            table.register(actuator.get_method(), RpcHandler::Get(actuator))?;
        }
        Ok(table)
    }

    pub fn register(&mut self, method: &'static str, handler: RpcHandler) -> Result<(), RpcError> {
        if self.routes.contains_key(method) {
            return Err(RpcError::DuplicateMethod(method));
        }
        if self.routes.len() >= self.capacity {
            return Err(RpcError::TooManySubscriptions {
                requested: self.routes.len() + 1,
                capacity: self.capacity,
            });
        }
        self.routes.insert(method, handler);
        Ok(())
    }

    pub fn resolve(&self, method: &str) -> Option<RpcHandler> {
        self.routes.get(method).copied()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.routes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// What a session adapter does with one inbound publish.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Queue for the device loop.
    Request(RpcRequest),
    /// Answer immediately; the method is not registered.
    Reject { id: u64, response: RpcResponse },
    Ignore,
}

/// Classifies an inbound publish against the registered method batch. Oversized,
/// malformed and non-RPC payloads are dropped.
pub fn route_publish(topic: &str, payload: &[u8], limit: usize, methods: &[&'static str]) -> Inbound {
    match RpcRequest::from_publish(topic, payload, limit) {
        Ok(Some(request)) if methods.contains(&request.method.as_str()) => Inbound::Request(request),
        Ok(Some(request)) => {
            let err = RpcError::unknown_method(&request.method);
            warn!("rejecting rpc {}: {err}", request.id);
            Inbound::Reject {
                id: request.id,
                response: RpcResponse::error(&err),
            }
        }
        Ok(None) => {
            debug!("ignoring publish on {topic}");
            Inbound::Ignore
        }
        Err(err) => {
            warn!("dropping inbound payload on {topic} ({} bytes): {err}", payload.len());
            Inbound::Ignore
        }
    }
}
