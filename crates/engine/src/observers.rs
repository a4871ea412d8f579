//! Routing table for server-initiated stream messages.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::error::ObserverError;

/// A parsed inbound stream frame.
///
/// Every frame is a JSON object; `id` and `type` are lifted out and the
/// remaining fields stay available as the payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: Option<String>,
    pub kind: Option<String>,
    pub payload: Map<String, Value>,
}

impl Frame {
    pub(crate) fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let Value::Object(mut object) = value else {
            return None;
        };
        let id = object.remove("id").and_then(as_string);
        let kind = object.remove("type").and_then(as_string);
        Some(Self {
            id,
            kind,
            payload: object,
        })
    }

    /// A payload field by name.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

fn as_string(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        _ => None,
    }
}

type Observer = Box<dyn Fn(&Frame) -> anyhow::Result<Option<Value>> + Send + Sync>;

/// Single-owner routing table keyed by message type: at most one handler
/// per type, and re-registration without prior removal is an error.
#[derive(Default)]
pub struct ObserverRegistry {
    handlers: RwLock<HashMap<String, Observer>>,
}

impl ObserverRegistry {
    pub fn register<F>(&self, kind: impl Into<String>, handler: F) -> Result<(), ObserverError>
    where
        F: Fn(&Frame) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        let kind = kind.into();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&kind) {
            return Err(ObserverError::AlreadyRegistered(kind));
        }
        handlers.insert(kind, Box::new(handler));
        Ok(())
    }

    pub fn deregister(&self, kind: &str) -> Result<(), ObserverError> {
        match self.handlers.write().remove(kind) {
            Some(_) => Ok(()),
            None => Err(ObserverError::NotRegistered(kind.to_string())),
        }
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.handlers.read().contains_key(kind)
    }

    /// Invoke the handler for `kind`, if one is registered.
    pub(crate) fn notify(&self, kind: &str, frame: &Frame) -> Option<anyhow::Result<Option<Value>>> {
        let handlers = self.handlers.read();
        handlers.get(kind).map(|handler| handler(frame))
    }
}

#[cfg(test)]
#[path = "observers_tests.rs"]
mod tests;
