//! Mutation planner and plan executor.
//!
//! [`plan`] turns a selected stage into concrete writes without doing any I/O.
//! [`apply_plan`] runs them in order against a [`ResourceClient`], threading the
//! resource version through every write so that an intervening change surfaces as
//! a conflict instead of being overwritten.

#![forbid(unsafe_code)]

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value as Json};
use stagehand_core::{
    ClientError, EvalContext, EvalError, Evaluator, EventRecord, EventSink, ManagedResource, ObjectKey, PatchBody,
    PatchRequest, PatchSpec, PatchType, ResourceClient, Stage,
};
use stagehand_expr::{render, render_string};
use tracing::{debug, warn};

pub mod memory;
mod patch;

pub use patch::{diff_summary, json_ops, DiffSummary};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("stage {stage}: {source}")]
    Eval {
        stage: String,
        #[source]
        source: EvalError,
    },
    #[error("stage {stage}: {message}")]
    Template { stage: String, message: String },
}

impl PlanError {
    /// Plans are deterministic for a given object; retrying cannot help.
    pub fn is_retryable(&self) -> bool { false }
}

/// Concrete writes for one stage application, in execution order:
/// patches, finalizer ops, event, delete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub key: ObjectKey,
    pub stage: String,
    /// Version captured when the object was read; the first write is guarded by it.
    pub resource_version: String,
    pub patches: Vec<PatchRequest>,
    pub finalizers: Option<PatchRequest>,
    pub event: Option<EventRecord>,
    pub delete: bool,
    /// Merge patches dropped because they would not change the object.
    pub skipped_noop: usize,
}

impl Plan {
    pub fn write_count(&self) -> usize {
        self.patches.len() + usize::from(self.finalizers.is_some()) + usize::from(self.delete)
    }

    pub fn is_empty(&self) -> bool { self.write_count() == 0 && self.event.is_none() }
}

/// Variables visible to templates besides the object itself.
pub fn template_context<'a>(res: &'a ManagedResource, stage: &Stage, now: DateTime<Utc>) -> EvalContext<'a> {
    EvalContext::new(&res.raw)
        .with_var("now", Json::String(now.to_rfc3339_opts(SecondsFormat::Secs, true)))
        .with_var("stage", Json::String(stage.name.clone()))
        .with_var("identity", Json::String(res.key.to_string()))
        .with_var("name", Json::String(res.key.name.clone()))
        .with_var("namespace", res.key.namespace.clone().map(Json::String).unwrap_or(Json::Null))
}

/// Build the plan for applying `stage` to `res`. Any template failure aborts the
/// whole plan.
pub fn plan(res: &ManagedResource, stage: &Stage, ev: &dyn Evaluator, now: DateTime<Utc>) -> Result<Plan, PlanError> {
    let ctx = template_context(res, stage, now);
    let eval_err = |source: EvalError| PlanError::Eval { stage: stage.name.clone(), source };

    let mut projected = res.raw.clone();
    let mut patches = Vec::new();
    let mut skipped_noop = 0;
    for spec in stage.next.effective_patches() {
        let body = render_patch(&spec, stage, ev, &ctx)?;
        match &body {
            PatchBody::Merge(v) | PatchBody::Strategic(v) => {
                let before = projected.clone();
                json_patch::merge(&mut projected, v);
                if diff_summary(&projected, &before).is_empty() {
                    debug!(key = %res.key, stage = %stage.name, "skipping no-op patch");
                    skipped_noop += 1;
                    continue;
                }
            }
            PatchBody::Json(ops) => {
                if let Ok(p) = json_ops(ops) {
                    // json_patch::patch rolls back on failure
                    let _ = json_patch::patch(&mut projected, &p.0);
                }
            }
        }
        let identity = match &spec.impersonation {
            Some(i) => Some(render_string(&i.username, ev, &ctx).map_err(eval_err)?),
            None => None,
        };
        patches.push(PatchRequest { subresource: spec.subresource.clone().filter(|s| !s.is_empty()), body, identity });
    }

    let finalizers = stage.next.finalizers.as_ref().and_then(|f| {
        let current: Vec<String> = res.finalizers.iter().cloned().collect();
        let add: Vec<String> = f.add.iter().map(|i| i.value.clone()).collect();
        let remove: Vec<String> = f.remove.iter().map(|i| i.value.clone()).collect();
        let has_field = res.raw.pointer("/metadata/finalizers").is_some();
        let ops = finalizer_ops(&current, has_field, &add, &remove, f.empty);
        (!ops.is_empty()).then(|| PatchRequest { subresource: None, body: PatchBody::Json(Json::Array(ops)), identity: None })
    });

    let event = match &stage.next.event {
        Some(spec) => Some(EventRecord {
            event_type: render_string(&spec.event_type, ev, &ctx).map_err(eval_err)?,
            reason: render_string(&spec.reason, ev, &ctx).map_err(eval_err)?,
            message: render_string(&spec.message, ev, &ctx).map_err(eval_err)?,
            subject: res.key.clone(),
            subject_uid: res.uid.clone(),
        }),
        None => None,
    };

    Ok(Plan {
        key: res.key.clone(),
        stage: stage.name.clone(),
        resource_version: res.resource_version.clone(),
        patches,
        finalizers,
        event,
        delete: stage.next.delete,
        skipped_noop,
    })
}

fn render_patch(spec: &PatchSpec, stage: &Stage, ev: &dyn Evaluator, ctx: &EvalContext<'_>) -> Result<PatchBody, PlanError> {
    let eval_err = |source: EvalError| PlanError::Eval { stage: stage.name.clone(), source };
    let template_err = |message: String| PlanError::Template { stage: stage.name.clone(), message };
    match spec.patch_type {
        PatchType::Json => {
            let ops = match &spec.template {
                Json::String(s) => {
                    let text = render_string(s, ev, ctx).map_err(eval_err)?;
                    serde_json::from_str::<Json>(&text).map_err(|e| template_err(format!("json patch: {e}")))?
                }
                other => render(other, ev, ctx).map_err(eval_err)?,
            };
            if !ops.is_array() {
                return Err(template_err("json patch must render to a list of operations".into()));
            }
            Ok(PatchBody::Json(ops))
        }
        PatchType::Merge | PatchType::Strategic => {
            let rendered = render(&spec.template, ev, ctx).map_err(eval_err)?;
            let body = wrap_at_root(spec.root.as_deref(), rendered);
            if !body.is_object() {
                return Err(template_err("merge patch must render to an object".into()));
            }
            Ok(if spec.patch_type == PatchType::Merge { PatchBody::Merge(body) } else { PatchBody::Strategic(body) })
        }
    }
}

/// Nest `body` under a dotted root path (`status`, `metadata.labels`).
pub fn wrap_at_root(root: Option<&str>, body: Json) -> Json {
    let Some(root) = root.filter(|r| !r.is_empty()) else { return body };
    root.rsplit('.').filter(|s| !s.is_empty()).fold(body, |acc, seg| {
        let mut m = Map::new();
        m.insert(seg.to_string(), acc);
        Json::Object(m)
    })
}

/// Minimal JSON-patch sequence turning `current` into the requested finalizer set.
/// Removals go first, by descending index; additions append missing values.
pub fn finalizer_ops(current: &[String], has_field: bool, add: &[String], remove: &[String], empty: bool) -> Vec<Json> {
    let mut ops = Vec::new();
    if empty {
        if has_field && !current.is_empty() {
            ops.push(json!({"op": "remove", "path": "/metadata/finalizers"}));
        }
        return ops;
    }
    let mut kept: Vec<&String> = current.iter().collect();
    let mut drop_idx: Vec<usize> =
        current.iter().enumerate().filter(|(_, f)| remove.contains(f)).map(|(i, _)| i).collect();
    drop_idx.sort_unstable_by(|a, b| b.cmp(a));
    for i in &drop_idx {
        ops.push(json!({"op": "remove", "path": format!("/metadata/finalizers/{i}")}));
        kept.remove(*i);
    }
    let mut missing: Vec<&String> = Vec::new();
    for f in add {
        if !kept.contains(&f) && !missing.contains(&f) {
            missing.push(f);
        }
    }
    if missing.is_empty() {
        return ops;
    }
    if has_field {
        for f in missing {
            ops.push(json!({"op": "add", "path": "/metadata/finalizers/-", "value": f}));
        }
    } else {
        ops.push(json!({"op": "add", "path": "/metadata/finalizers", "value": missing}));
    }
    ops
}

/// Attach the optimistic-concurrency guard for `resource_version` to a write.
pub fn with_version_guard(req: &PatchRequest, resource_version: &str) -> PatchRequest {
    if resource_version.is_empty() {
        return req.clone();
    }
    let body = match &req.body {
        PatchBody::Merge(v) => PatchBody::Merge(guard_object(v, resource_version)),
        PatchBody::Strategic(v) => PatchBody::Strategic(guard_object(v, resource_version)),
        PatchBody::Json(ops) => {
            let mut out = vec![json!({"op": "test", "path": "/metadata/resourceVersion", "value": resource_version})];
            if let Some(arr) = ops.as_array() {
                out.extend(arr.iter().cloned());
            }
            PatchBody::Json(Json::Array(out))
        }
    };
    PatchRequest { subresource: req.subresource.clone(), body, identity: req.identity.clone() }
}

fn guard_object(v: &Json, rv: &str) -> Json {
    let mut out = v.clone();
    json_patch::merge(&mut out, &json!({"metadata": {"resourceVersion": rv}}));
    out
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{op} #{index} failed: {source}")]
pub struct ApplyError {
    pub op: &'static str,
    pub index: usize,
    /// Writes that succeeded before the failure.
    pub completed: usize,
    #[source]
    pub source: ClientError,
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool { self.source.is_retryable() }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    pub writes: usize,
    /// Version after the last write (unchanged if nothing was written).
    pub resource_version: String,
    pub deleted: bool,
    pub event_emitted: bool,
}

/// Execute `plan` sequentially. The first failing write stops the plan; earlier
/// writes are not rolled back. Event emission is best effort.
pub async fn apply_plan(
    plan: &Plan,
    client: &dyn ResourceClient,
    events: &dyn EventSink,
    timeout: Duration,
) -> Result<Applied, ApplyError> {
    let mut rv = plan.resource_version.clone();
    let mut done = Applied { resource_version: rv.clone(), ..Default::default() };
    let writes = plan.patches.iter().map(|p| ("patch", p)).chain(plan.finalizers.iter().map(|p| ("finalizers", p)));
    for (index, (op, req)) in writes.enumerate() {
        let guarded = with_version_guard(req, &rv);
        let updated = with_timeout(timeout, client.patch(&plan.key, &guarded))
            .await
            .map_err(|source| ApplyError { op, index, completed: done.writes, source })?;
        rv = updated.resource_version;
        done.writes += 1;
        done.resource_version = rv.clone();
    }
    if let Some(event) = &plan.event {
        match with_timeout(timeout, events.emit(event.clone())).await {
            Ok(()) => done.event_emitted = true,
            Err(e) => {
                warn!(key = %plan.key, stage = %plan.stage, error = %e, "event emission failed");
                metrics::counter!("stage_event_errors_total", 1u64);
            }
        }
    }
    if plan.delete {
        let precondition = (!rv.is_empty()).then_some(rv.as_str());
        with_timeout(timeout, client.delete(&plan.key, precondition))
            .await
            .map_err(|source| ApplyError { op: "delete", index: done.writes, completed: done.writes, source })?;
        done.writes += 1;
        done.deleted = true;
    }
    Ok(done)
}

/// Bound a client call; an elapsed deadline becomes [`ClientError::Timeout`].
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, ClientError>
where
    F: std::future::Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(ClientError::Timeout(format!("no response within {}ms", timeout.as_millis()))),
    }
}
