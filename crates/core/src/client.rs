//! Interfaces consumed by the engine, plus their error types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resource::{ManagedResource, ObjectKey};
use crate::stage::{RuleError, Stage};
use crate::Json;

/// Errors surfaced by the resource/event/lease clients.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("other: {0}")]
    Other(String),
}

impl ClientError {
    /// Conflicts restart the cycle; timeouts and transport failures back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Conflict(_) | ClientError::Timeout(_) | ClientError::Transport(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Timeout(_) | ClientError::Transport(_))
    }

    /// Short label for logs and metrics.
    pub fn class(&self) -> &'static str {
        match self {
            ClientError::Conflict(_) => "conflict",
            ClientError::NotFound(_) => "not_found",
            ClientError::Forbidden(_) => "forbidden",
            ClientError::Timeout(_) => "timeout",
            ClientError::Transport(_) => "transport",
            ClientError::Invalid(_) => "invalid",
            ClientError::Other(_) => "other",
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Patch body tagged with its semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatchBody {
    /// RFC 6902 operation list.
    Json(Json),
    /// RFC 7386 merge patch.
    Merge(Json),
    Strategic(Json),
}

impl PatchBody {
    pub fn value(&self) -> &Json {
        match self {
            PatchBody::Json(v) | PatchBody::Merge(v) | PatchBody::Strategic(v) => v,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PatchBody::Json(_) => "json",
            PatchBody::Merge(_) => "merge",
            PatchBody::Strategic(_) => "strategic",
        }
    }
    /// The resourceVersion this write is guarded on: `metadata.resourceVersion` in a
    /// merge body, or the value of a `test` op on that path in an operation list.
    pub fn version_guard(&self) -> Option<&str> {
        const PATH: &str = "/metadata/resourceVersion";
        match self {
            PatchBody::Merge(v) | PatchBody::Strategic(v) => v.pointer(PATH).and_then(|rv| rv.as_str()),
            PatchBody::Json(ops) => ops.as_array()?.iter().find_map(|op| {
                let guard = op.get("op").and_then(|v| v.as_str()) == Some("test")
                    && op.get("path").and_then(|v| v.as_str()) == Some(PATH);
                if guard {
                    op.get("value").and_then(|v| v.as_str())
                } else {
                    None
                }
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRequest {
    /// `None` patches the main resource.
    pub subresource: Option<String>,
    pub body: PatchBody,
    /// Impersonated user name, if any.
    pub identity: Option<String>,
}

/// Access to the external object store.
///
/// Version guards travel inside the patch body (see the planner), so a stale write
/// comes back as [`ClientError::Conflict`].
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> ClientResult<ManagedResource>;

    async fn patch(&self, key: &ObjectKey, req: &PatchRequest) -> ClientResult<ManagedResource>;

    /// Delete, optionally preconditioned on `resource_version`.
    async fn delete(&self, key: &ObjectKey, resource_version: Option<&str>) -> ClientResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_type: String,
    pub reason: String,
    pub message: String,
    pub subject: ObjectKey,
    pub subject_uid: Option<String>,
}

#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: EventRecord) -> ClientResult<()>;
}

/// Per-node heartbeat object writer.
#[async_trait::async_trait]
pub trait LeaseClient: Send + Sync {
    async fn renew(&self, node: &str, holder: &str, duration_secs: i32) -> ClientResult<()>;
}

#[async_trait::async_trait]
pub trait RuleSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Stage>, RuleError>;

    /// Human readable origin for logs.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("parse {expr:?}: {message}")]
    Parse { expr: String, message: String },
    #[error("unknown variable ${name} in {expr:?}")]
    UnknownVariable { expr: String, name: String },
    #[error("unknown function {name} in {expr:?}")]
    UnknownFunction { expr: String, name: String },
    #[error("type error in {expr:?}: {message}")]
    Type { expr: String, message: String },
}

/// Read-only evaluation context: the object tree plus named variables (`$now`, `$stage`, ...).
#[derive(Debug, Clone)]
pub struct EvalContext<'a> {
    pub root: &'a Json,
    pub vars: BTreeMap<String, Json>,
}

impl<'a> EvalContext<'a> {
    pub fn new(root: &'a Json) -> Self { Self { root, vars: BTreeMap::new() } }

    pub fn with_var(mut self, name: &str, value: Json) -> Self {
        self.vars.insert(name.to_string(), value);
        self
    }

    pub fn var(&self, name: &str) -> Option<&Json> { self.vars.get(name) }
}

/// Side-effect free expression evaluation.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expr: &str, ctx: &EvalContext<'_>) -> Result<Json, EvalError>;
}
