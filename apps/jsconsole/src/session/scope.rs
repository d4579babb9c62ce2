//! Materializes scope objects into plain JSON trees.
//!
//! Scope and property values arrive as `{"ref": N, ...}` handles. Each distinct
//! handle costs one `lookup`; objects with a property list become a name -> value
//! map, anything else is returned as the agent described it.

use std::collections::HashMap;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::trace;
use v8_debug_client::protocol::LookupArgs;
use v8_debug_client::{Command, ProtocolClient};

use super::SessionError;

/// `attributes` bit marking a property as not enumerable.
const DONT_ENUM: u64 = 2;
/// Highest `propertyType` that is a plain data property (Normal, Field,
/// ConstantFunction); above are callbacks, handlers and interceptors.
const MAX_DATA_PROPERTY_TYPE: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Global,
    Local,
    With,
    Closure,
    Catch,
    Block,
    Script,
    Other(u64),
}

impl From<u64> for ScopeKind {
    fn from(value: u64) -> Self {
        match value {
            0 => ScopeKind::Global,
            1 => ScopeKind::Local,
            2 => ScopeKind::With,
            3 => ScopeKind::Closure,
            4 => ScopeKind::Catch,
            5 => ScopeKind::Block,
            6 => ScopeKind::Script,
            other => ScopeKind::Other(other),
        }
    }
}

/// One scope of a frame with its variables resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeVariables {
    pub index: u32,
    pub frame_index: u32,
    pub kind: ScopeKind,
    pub variables: Value,
}

impl ScopeVariables {
    pub(crate) fn from_scope(scope: &Value, variables: Value) -> Self {
        let number = |key: &str| {
            scope
                .get(key)
                .and_then(Value::as_u64)
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or_default()
        };
        Self {
            index: number("index"),
            frame_index: number("frameIndex"),
            kind: ScopeKind::from(scope.get("type").and_then(Value::as_u64).unwrap_or(0)),
            variables,
        }
    }
}

pub(crate) fn reference_of(value: &Value) -> Option<i64> {
    value.get("ref").and_then(Value::as_i64)
}

pub(crate) fn is_plain_data_property(property: &Value) -> bool {
    let attributes = property
        .get("attributes")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let kind = property
        .get("propertyType")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    attributes & DONT_ENUM == 0 && kind <= MAX_DATA_PROPERTY_TYPE
}

fn property_name(property: &Value) -> Option<String> {
    match property.get("name")? {
        Value::String(name) => Some(name.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

pub(crate) struct ScopeResolver<'a> {
    client: &'a ProtocolClient,
    max_depth: usize,
    resolved: HashMap<i64, Value>,
}

/// State of one walk: the handles on the path from the root to the current
/// value, and every handle already materialized.
struct Walk {
    ancestors: Vec<i64>,
    resolved: HashMap<i64, Value>,
}

impl<'a> ScopeResolver<'a> {
    pub(crate) fn new(client: &'a ProtocolClient, max_depth: usize) -> Self {
        Self {
            client,
            max_depth,
            resolved: HashMap::new(),
        }
    }

    /// Handles shared between calls on one resolver are looked up once.
    pub(crate) async fn resolve(&mut self, value: Value) -> Result<Value, SessionError> {
        let mut walk = Walk {
            ancestors: Vec::new(),
            resolved: std::mem::take(&mut self.resolved),
        };
        let outcome = self.resolve_inner(value, &mut walk).await;
        self.resolved = walk.resolved;
        outcome
    }

    /// A handle reappearing among `walk.ancestors` is a cycle; one that was
    /// already resolved through another path is reused as is.
    fn resolve_inner<'b>(
        &'b self,
        value: Value,
        walk: &'b mut Walk,
    ) -> BoxFuture<'b, Result<Value, SessionError>> {
        async move {
            let Some(handle) = reference_of(&value) else {
                return Ok(value);
            };
            if walk.ancestors.contains(&handle) {
                return Ok(json!({"ref": handle, "circular": true}));
            }
            if let Some(done) = walk.resolved.get(&handle) {
                return Ok(done.clone());
            }
            if walk.ancestors.len() >= self.max_depth {
                return Ok(json!({"ref": handle, "truncated": true}));
            }

            let object = self.lookup(handle).await?;
            let Some(properties) = object.get("properties").and_then(Value::as_array) else {
                walk.resolved.insert(handle, object.clone());
                return Ok(object);
            };

            walk.ancestors.push(handle);
            let mut resolved = Map::new();
            for property in properties {
                if !is_plain_data_property(property) {
                    continue;
                }
                let Some(name) = property_name(property) else {
                    continue;
                };
                match self.resolve_inner(property.clone(), walk).await {
                    Ok(value) => {
                        resolved.insert(name, value);
                    }
                    Err(err) => {
                        walk.ancestors.pop();
                        return Err(err);
                    }
                }
            }
            walk.ancestors.pop();
            let resolved = Value::Object(resolved);
            walk.resolved.insert(handle, resolved.clone());
            Ok(resolved)
        }
        .boxed()
    }

    async fn lookup(&self, handle: i64) -> Result<Value, SessionError> {
        trace!(handle, "resolving scope handle");
        let response = self
            .client
            .send_request(Command::Lookup(LookupArgs::new(vec![handle])))
            .await?;
        if let Some(message) = response.failure_message() {
            return Err(SessionError::Protocol {
                command: "lookup",
                message,
            });
        }
        response
            .body
            .get(handle.to_string())
            .cloned()
            .ok_or_else(|| SessionError::Protocol {
                command: "lookup",
                message: format!("no object returned for handle {handle}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_filter() {
        assert!(is_plain_data_property(&json!({"name": "x", "ref": 3})));
        assert!(is_plain_data_property(
            &json!({"name": "x", "attributes": 1, "propertyType": 1, "ref": 3})
        ));
        assert!(!is_plain_data_property(
            &json!({"name": "hidden", "attributes": 2, "ref": 3})
        ));
        assert!(!is_plain_data_property(
            &json!({"name": "getter", "propertyType": 3, "ref": 3})
        ));
    }

    #[test]
    fn references_and_names() {
        assert_eq!(reference_of(&json!({"ref": -4})), Some(-4));
        assert_eq!(reference_of(&json!({"value": 4})), None);
        assert_eq!(property_name(&json!({"name": 0})), Some("0".to_string()));
        assert_eq!(property_name(&json!({"ref": 1})), None);
    }

    #[test]
    fn scope_header() {
        let scope = ScopeVariables::from_scope(
            &json!({"type": 3, "index": 1, "frameIndex": 2, "object": {"ref": 9}}),
            json!({}),
        );
        assert_eq!(scope.kind, ScopeKind::Closure);
        assert_eq!((scope.index, scope.frame_index), (1, 2));
        assert_eq!(ScopeKind::from(42), ScopeKind::Other(42));
    }
}
