//! In-memory object store implementing the client traits.
//!
//! Tracks resource versions, honors version guards, emulates finalizer-blocked
//! deletion and lets tests inject conflicts and failures. Every change is
//! published to subscribers as a [`Delta`], so it can also stand in for a watch.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rustc_hash::FxHashMap;
use serde_json::{json, Value as Json};
use stagehand_core::{
    ClientError, ClientResult, Delta, DeltaKind, EventRecord, EventSink, LeaseClient, ManagedResource, ObjectKey,
    PatchBody, PatchRequest, ResourceClient,
};
use tokio::sync::mpsc;

use crate::json_ops;

/// One write seen by the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub key: ObjectKey,
    pub op: &'static str,
    pub subresource: Option<String>,
    pub identity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: String,
    pub duration_secs: i32,
    pub renewals: u64,
    pub renew_time: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Json>,
    version: u64,
    events: Vec<EventRecord>,
    leases: BTreeMap<String, LeaseRecord>,
    writes: Vec<WriteRecord>,
    conflicts: FxHashMap<ObjectKey, u32>,
    /// Per-call script: `None` lets a call through, `Some` fails it.
    failures: VecDeque<Option<ClientError>>,
    inflight: FxHashMap<ObjectKey, usize>,
    max_inflight: usize,
    subscribers: Vec<mpsc::UnboundedSender<Delta>>,
}

impl State {
    fn bump(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn publish(&mut self, kind: DeltaKind, key: &ObjectKey, raw: &Json) {
        let delta = Delta { key: key.clone(), kind, raw: raw.clone() };
        self.subscribers.retain(|tx| tx.send(delta.clone()).is_ok());
    }

    fn store(&mut self, key: &ObjectKey, mut raw: Json) -> Json {
        let rv = self.bump();
        if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        // finalizers cleared on a deleting object complete the delete
        let deleting = raw.pointer("/metadata/deletionTimestamp").is_some();
        let finalizers_left = raw.pointer("/metadata/finalizers").and_then(|f| f.as_array()).map(|a| !a.is_empty());
        if deleting && !finalizers_left.unwrap_or(false) {
            self.objects.remove(key);
            self.publish(DeltaKind::Deleted, key, &raw);
        } else {
            self.objects.insert(key.clone(), raw.clone());
            self.publish(DeltaKind::Applied, key, &raw);
        }
        raw
    }
}

/// Shared in-memory cluster. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
    latency: Duration,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    /// Every call sleeps for `latency` while counted as in flight.
    pub fn with_latency(latency: Duration) -> Self { Self { latency, ..Self::default() } }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Receive a [`Delta`] for every subsequent change.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Delta> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Create or replace an object out of band, assigning a fresh resource version.
    pub fn upsert(&self, raw: Json) -> ClientResult<ManagedResource> {
        let key = ObjectKey::from_raw(&raw).map_err(|e| ClientError::Invalid(e.to_string()))?;
        let mut st = self.lock();
        let stored = st.store(&key, raw);
        ManagedResource::from_raw(stored).map_err(|e| ClientError::Invalid(e.to_string()))
    }

    /// Mutate an object out of band.
    pub fn update<F: FnOnce(&mut Json)>(&self, key: &ObjectKey, f: F) -> ClientResult<()> {
        let mut st = self.lock();
        let mut raw = st.objects.get(key).cloned().ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        f(&mut raw);
        st.store(key, raw);
        Ok(())
    }

    pub fn get_raw(&self, key: &ObjectKey) -> Option<Json> { self.lock().objects.get(key).cloned() }

    pub fn contains(&self, key: &ObjectKey) -> bool { self.lock().objects.contains_key(key) }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }

    /// The next `n` writes to `key` fail with a conflict.
    pub fn inject_conflicts(&self, key: &ObjectKey, n: u32) {
        self.lock().conflicts.insert(key.clone(), n);
    }

    /// The next call of any kind fails with `err`. Queued failures are consumed in order.
    pub fn inject_failure(&self, err: ClientError) { self.inject_failure_after(0, err) }

    /// Let `calls` more calls through, then fail the one after with `err`.
    pub fn inject_failure_after(&self, calls: usize, err: ClientError) {
        let mut st = self.lock();
        st.failures.extend(std::iter::repeat_with(|| None).take(calls));
        st.failures.push_back(Some(err));
    }

    pub fn events(&self) -> Vec<EventRecord> { self.lock().events.clone() }

    pub fn writes(&self) -> Vec<WriteRecord> { self.lock().writes.clone() }

    pub fn writes_for(&self, key: &ObjectKey) -> Vec<WriteRecord> {
        self.lock().writes.iter().filter(|w| &w.key == key).cloned().collect()
    }

    pub fn lease(&self, node: &str) -> Option<LeaseRecord> { self.lock().leases.get(node).cloned() }

    /// Highest number of calls observed in flight for a single object.
    pub fn max_inflight_per_object(&self) -> usize { self.lock().max_inflight }

    async fn enter(&self, key: &ObjectKey) -> ClientResult<()> {
        {
            let mut st = self.lock();
            let n = st.inflight.entry(key.clone()).or_insert(0);
            *n += 1;
            let n = *n;
            st.max_inflight = st.max_inflight.max(n);
        }
        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }
        let mut st = self.lock();
        match st.failures.pop_front().flatten() {
            Some(err) => {
                leave(&mut st, key);
                Err(err)
            }
            None => Ok(()),
        }
    }
}

fn leave(st: &mut State, key: &ObjectKey) {
    if let Some(n) = st.inflight.get_mut(key) {
        *n = n.saturating_sub(1);
        if *n == 0 {
            st.inflight.remove(key);
        }
    }
}

fn patch_locked(st: &mut State, key: &ObjectKey, req: &PatchRequest) -> ClientResult<ManagedResource> {
    let current = st.objects.get(key).cloned().ok_or_else(|| ClientError::NotFound(key.to_string()))?;
    if let Some(left) = st.conflicts.get_mut(key) {
        if *left > 0 {
            *left -= 1;
            return Err(ClientError::Conflict(format!("{key}: injected conflict")));
        }
    }
    let current_rv = current.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).unwrap_or("").to_string();
    if let Some(rv) = req.body.version_guard() {
        if rv != current_rv {
            return Err(ClientError::Conflict(format!("{key}: resourceVersion {rv} is stale (now {current_rv})")));
        }
    }
    let mut next = current.clone();
    match &req.body {
        PatchBody::Merge(v) | PatchBody::Strategic(v) => json_patch::merge(&mut next, v),
        PatchBody::Json(ops) => {
            let p = json_ops(ops).map_err(|e| ClientError::Invalid(format!("{key}: {e}")))?;
            json_patch::patch(&mut next, &p.0).map_err(|e| ClientError::Invalid(format!("{key}: {e}")))?;
        }
    }
    if req.subresource.as_deref() == Some("status") {
        let status = next.get("status").cloned();
        next = current;
        if let Some(obj) = next.as_object_mut() {
            match status {
                Some(s) => obj.insert("status".into(), s),
                None => obj.remove("status"),
            };
        }
    }
    st.writes.push(WriteRecord {
        key: key.clone(),
        op: "patch",
        subresource: req.subresource.clone(),
        identity: req.identity.clone(),
    });
    let stored = st.store(key, next);
    ManagedResource::from_raw(stored).map_err(|e| ClientError::Invalid(e.to_string()))
}

fn delete_locked(st: &mut State, key: &ObjectKey, resource_version: Option<&str>) -> ClientResult<()> {
    let current = st.objects.get(key).cloned().ok_or_else(|| ClientError::NotFound(key.to_string()))?;
    let current_rv = current.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).unwrap_or("");
    if let Some(rv) = resource_version {
        if rv != current_rv {
            return Err(ClientError::Conflict(format!("{key}: precondition {rv} failed (now {current_rv})")));
        }
    }
    st.writes.push(WriteRecord { key: key.clone(), op: "delete", subresource: None, identity: None });
    let has_finalizers =
        current.pointer("/metadata/finalizers").and_then(|f| f.as_array()).map(|a| !a.is_empty()).unwrap_or(false);
    if has_finalizers {
        if current.pointer("/metadata/deletionTimestamp").is_none() {
            let mut next = current;
            json_patch::merge(
                &mut next,
                &json!({"metadata": {"deletionTimestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)}}),
            );
            st.store(key, next);
        }
    } else {
        st.objects.remove(key);
        st.publish(DeltaKind::Deleted, key, &current);
    }
    Ok(())
}

#[async_trait::async_trait]
impl ResourceClient for MemoryCluster {
    async fn get(&self, key: &ObjectKey) -> ClientResult<ManagedResource> {
        self.enter(key).await?;
        let mut st = self.lock();
        let out = st
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(key.to_string()))
            .and_then(|raw| ManagedResource::from_raw(raw).map_err(|e| ClientError::Invalid(e.to_string())));
        leave(&mut st, key);
        out
    }

    async fn patch(&self, key: &ObjectKey, req: &PatchRequest) -> ClientResult<ManagedResource> {
        self.enter(key).await?;
        let mut st = self.lock();
        let out = patch_locked(&mut st, key, req);
        leave(&mut st, key);
        out
    }

    async fn delete(&self, key: &ObjectKey, resource_version: Option<&str>) -> ClientResult<()> {
        self.enter(key).await?;
        let mut st = self.lock();
        let out = delete_locked(&mut st, key, resource_version);
        leave(&mut st, key);
        out
    }
}

#[async_trait::async_trait]
impl EventSink for MemoryCluster {
    async fn emit(&self, event: EventRecord) -> ClientResult<()> {
        self.lock().events.push(event);
        Ok(())
    }
}

#[async_trait::async_trait]
impl LeaseClient for MemoryCluster {
    async fn renew(&self, node: &str, holder: &str, duration_secs: i32) -> ClientResult<()> {
        let mut st = self.lock();
        if let Some(err) = st.failures.pop_front().flatten() {
            return Err(err);
        }
        let renew_time = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let entry = st.leases.entry(node.to_string()).or_insert_with(|| LeaseRecord {
            holder: holder.to_string(),
            duration_secs,
            renewals: 0,
            renew_time: renew_time.clone(),
        });
        entry.holder = holder.to_string();
        entry.duration_secs = duration_secs;
        entry.renewals += 1;
        entry.renew_time = renew_time;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::TypeRef;

    fn pod(name: &str) -> Json {
        json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name, "namespace": "default"}, "status": {"phase": "Pending"}})
    }

    fn key(name: &str) -> ObjectKey { ObjectKey::new(TypeRef::new("", "v1", "Pod"), Some("default"), name) }

    fn merge(v: Json) -> PatchRequest { PatchRequest { subresource: None, body: PatchBody::Merge(v), identity: None } }

    #[tokio::test]
    async fn stale_guard_conflicts() {
        let c = MemoryCluster::new();
        let r = c.upsert(pod("a")).unwrap();
        let ok = c
            .patch(&key("a"), &merge(json!({"metadata": {"resourceVersion": r.resource_version.clone(), "labels": {"x": "1"}}})))
            .await
            .unwrap();
        assert_ne!(ok.resource_version, r.resource_version);
        let err = c
            .patch(&key("a"), &merge(json!({"metadata": {"resourceVersion": r.resource_version.clone(), "labels": {"x": "2"}}})))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Conflict(_)));
    }

    #[tokio::test]
    async fn status_subresource_only_touches_status() {
        let c = MemoryCluster::new();
        c.upsert(pod("a")).unwrap();
        let req = PatchRequest {
            subresource: Some("status".into()),
            body: PatchBody::Merge(json!({"status": {"phase": "Running"}, "metadata": {"labels": {"x": "1"}}})),
            identity: Some("system:node:n1".into()),
        };
        let r = c.patch(&key("a"), &req).await.unwrap();
        assert_eq!(r.raw["status"]["phase"], json!("Running"));
        assert!(r.labels.is_empty());
        assert_eq!(c.writes()[0].identity.as_deref(), Some("system:node:n1"));
    }

    #[tokio::test]
    async fn delete_waits_for_finalizers() {
        let c = MemoryCluster::new();
        let mut raw = pod("a");
        raw["metadata"]["finalizers"] = json!(["f"]);
        c.upsert(raw).unwrap();
        let mut rx = c.subscribe();
        c.delete(&key("a"), None).await.unwrap();
        assert!(c.contains(&key("a")));
        assert_eq!(rx.recv().await.unwrap().kind, DeltaKind::Applied);
        let clear = PatchRequest {
            subresource: None,
            body: PatchBody::Json(json!([{"op": "remove", "path": "/metadata/finalizers"}])),
            identity: None,
        };
        c.patch(&key("a"), &clear).await.unwrap();
        assert!(!c.contains(&key("a")));
        assert_eq!(rx.recv().await.unwrap().kind, DeltaKind::Deleted);
    }

    #[tokio::test]
    async fn injected_failures_and_conflicts() {
        let c = MemoryCluster::new();
        c.upsert(pod("a")).unwrap();
        c.inject_failure(ClientError::Timeout("slow".into()));
        assert!(matches!(c.get(&key("a")).await, Err(ClientError::Timeout(_))));
        c.inject_conflicts(&key("a"), 1);
        assert!(matches!(c.patch(&key("a"), &merge(json!({"a": 1}))).await, Err(ClientError::Conflict(_))));
        assert!(c.patch(&key("a"), &merge(json!({"a": 1}))).await.is_ok());
        assert!(matches!(c.get(&key("missing")).await, Err(ClientError::NotFound(_))));
        assert_eq!(c.max_inflight_per_object(), 1);
    }

    #[tokio::test]
    async fn scripted_failure_skips_earlier_calls() {
        let c = MemoryCluster::new();
        c.upsert(pod("a")).unwrap();
        c.inject_failure_after(2, ClientError::Forbidden("rbac".into()));
        assert!(c.get(&key("a")).await.is_ok());
        assert!(c.patch(&key("a"), &merge(json!({"a": 1}))).await.is_ok());
        assert!(matches!(c.patch(&key("a"), &merge(json!({"a": 2}))).await, Err(ClientError::Forbidden(_))));
        assert!(c.get(&key("a")).await.is_ok());
        assert_eq!(c.writes().len(), 1);
    }

    #[tokio::test]
    async fn json_patch_guard_and_bad_ops() {
        let c = MemoryCluster::new();
        c.upsert(pod("a")).unwrap();
        let json_patch = |ops: Json| PatchRequest { subresource: None, body: PatchBody::Json(ops), identity: None };
        let stale = json_patch(json!([
            {"op": "test", "path": "/metadata/resourceVersion", "value": "0"},
            {"op": "add", "path": "/metadata/labels", "value": {"x": "1"}}
        ]));
        assert!(matches!(c.patch(&key("a"), &stale).await, Err(ClientError::Conflict(_))));
        let missing = json_patch(json!([{"op": "remove", "path": "/metadata/finalizers/0"}]));
        assert!(matches!(c.patch(&key("a"), &missing).await, Err(ClientError::Invalid(_))));
        let rv = c.get_raw(&key("a")).unwrap()["metadata"]["resourceVersion"].clone();
        let fresh = json_patch(json!([
            {"op": "test", "path": "/metadata/resourceVersion", "value": rv},
            {"op": "add", "path": "/metadata/labels", "value": {"x": "1"}}
        ]));
        let r = c.patch(&key("a"), &fresh).await.unwrap();
        assert_eq!(r.labels.get("x").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn leases_record_renewals() {
        let c = MemoryCluster::new();
        c.renew("n1", "stagehand", 40).await.unwrap();
        c.renew("n1", "stagehand", 40).await.unwrap();
        let l = c.lease("n1").unwrap();
        assert_eq!(l.renewals, 2);
        assert_eq!(l.duration_secs, 40);
    }
}
