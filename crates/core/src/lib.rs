//! Stagehand core types: stage rules, managed resources, and the interfaces the
//! engine consumes (resource client, event sink, lease client, evaluator, rule source).

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod client;
pub mod config;
pub mod resource;
pub mod stage;

pub use client::{
    ClientError, ClientResult, EvalContext, EvalError, Evaluator, EventRecord, EventSink, LeaseClient,
    PatchBody, PatchRequest, ResourceClient, RuleSource,
};
pub use config::EngineConfig;
pub use resource::{GroupKind, ManagedResource, ObjectKey, ResourceError, TypeRef};
pub use stage::{
    Delay, EventSpec, ExpressionFrom, FinalizerItem, FinalizerSpec, Impersonation, Next, PatchSpec, PatchType,
    ResourceRef, RuleError, Selector, SelectorOperator, SelectorRequirement, Stage, StageDocument,
};

pub type Json = serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A watch notification for one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub key: ObjectKey,
    pub kind: DeltaKind,
    /// Raw object as observed by the watcher (managedFields stripped).
    pub raw: Json,
}

impl Delta {
    pub fn from_raw(kind: DeltaKind, raw: Json) -> Result<Self, ResourceError> {
        let key = ObjectKey::from_raw(&raw)?;
        Ok(Self { key, kind, raw })
    }
}

pub mod prelude {
    pub use super::{
        ClientError, Delta, DeltaKind, EvalContext, Evaluator, Json, ManagedResource, ObjectKey, Selector, Stage,
        TypeRef,
    };
}
