//! Stagehand kubehub: kube-rs implementations of the engine's client traits and
//! the list+watch feed.

#![forbid(unsafe_code)]

use std::sync::{Mutex, RwLock};

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, Preconditions},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{pinned_kind, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use rustc_hash::FxHashMap;
use stagehand_core::{
    ClientError, ClientResult, Delta, DeltaKind, ManagedResource, ObjectKey, PatchBody, PatchRequest, ResourceClient,
    TypeRef,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod events;
mod lease;

pub use events::KubeEventSink;
pub use lease::KubeLeaseClient;

pub const FIELD_MANAGER: &str = "stagehand";

/// Build a client from the ambient kubeconfig or in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("creating kube client")
}

/// Map an API status code and message onto the engine's error classes.
pub fn classify(code: u16, message: &str) -> ClientError {
    let msg = message.to_string();
    match code {
        409 => ClientError::Conflict(msg),
        404 => ClientError::NotFound(msg),
        401 | 403 => ClientError::Forbidden(msg),
        400 | 405 | 415 | 422 => ClientError::Invalid(msg),
        408 | 504 => ClientError::Timeout(msg),
        429 | 500..=599 => ClientError::Transport(msg),
        _ => ClientError::Other(msg),
    }
}

pub fn map_kube_error(err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(resp) => classify(resp.code, &format!("{} ({})", resp.message, resp.reason)),
        kube::Error::HyperError(e) => ClientError::Transport(e.to_string()),
        kube::Error::Service(e) => {
            let s = e.to_string();
            if s.contains("timed out") || s.contains("deadline") { ClientError::Timeout(s) } else { ClientError::Transport(s) }
        }
        kube::Error::SerdeError(e) => ClientError::Invalid(e.to_string()),
        other => ClientError::Other(other.to_string()),
    }
}

/// The apiserver reports a failed JSON-patch `test` as a generic 422, with the
/// detail only in the status causes. Given the object's current resourceVersion,
/// turn such an error into a conflict when the write's guard has gone stale.
fn refine_patch_error(err: ClientError, body: &PatchBody, current_rv: Option<&str>) -> ClientError {
    if !matches!((&err, body), (ClientError::Invalid(_), PatchBody::Json(_))) {
        return err;
    }
    match body.version_guard() {
        Some(guard) if current_rv != Some(guard) => {
            ClientError::Conflict(format!("{err}; resourceVersion {guard} is stale (now {})", current_rv.unwrap_or("?")))
        }
        _ => err,
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

fn to_raw(obj: &DynamicObject) -> ClientResult<serde_json::Value> {
    let mut raw = serde_json::to_value(obj).map_err(|e| ClientError::Invalid(e.to_string()))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn gvk_of(tr: &TypeRef) -> GroupVersionKind {
    GroupVersionKind { group: tr.group.clone(), version: tr.version.clone(), kind: tr.kind.clone() }
}

/// kube-backed [`ResourceClient`]. API resources are discovered once per type;
/// impersonating clients are built once per user name.
pub struct KubeClient {
    client: Client,
    config: kube::Config,
    resources: RwLock<FxHashMap<TypeRef, (ApiResource, bool)>>,
    impersonated: Mutex<FxHashMap<String, Client>>,
}

impl KubeClient {
    pub async fn try_default() -> Result<Self> {
        let config = kube::Config::infer().await.context("inferring kube config")?;
        Self::from_config(config)
    }

    pub fn from_config(config: kube::Config) -> Result<Self> {
        let client = Client::try_from(config.clone()).context("creating kube client")?;
        Ok(Self { client, config, resources: RwLock::new(FxHashMap::default()), impersonated: Mutex::new(FxHashMap::default()) })
    }

    pub fn client(&self) -> Client { self.client.clone() }

    async fn resource(&self, tr: &TypeRef) -> ClientResult<(ApiResource, bool)> {
        if let Some(hit) = self.resources.read().ok().and_then(|m| m.get(tr).cloned()) {
            return Ok(hit);
        }
        let (ar, caps) = pinned_kind(&self.client, &gvk_of(tr)).await.map_err(map_kube_error)?;
        let entry = (ar, matches!(caps.scope, Scope::Namespaced));
        if let Ok(mut m) = self.resources.write() {
            m.insert(tr.clone(), entry.clone());
        }
        debug!(type_ref = %tr, plural = %entry.0.plural, namespaced = entry.1, "resolved api resource");
        Ok(entry)
    }

    fn client_for(&self, identity: Option<&str>) -> ClientResult<Client> {
        let Some(user) = identity else { return Ok(self.client.clone()) };
        let mut cache = self.impersonated.lock().map_err(|_| ClientError::Other("impersonation cache poisoned".into()))?;
        if let Some(c) = cache.get(user) {
            return Ok(c.clone());
        }
        let mut cfg = self.config.clone();
        cfg.auth_info.impersonate = Some(user.to_string());
        let c = Client::try_from(cfg).map_err(map_kube_error)?;
        cache.insert(user.to_string(), c.clone());
        Ok(c)
    }

    async fn api(&self, key: &ObjectKey, identity: Option<&str>) -> ClientResult<Api<DynamicObject>> {
        let (ar, namespaced) = self.resource(&key.type_ref).await?;
        let client = self.client_for(identity)?;
        Ok(match (&key.namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        })
    }
}

fn kube_patch(body: &PatchBody) -> ClientResult<Patch<serde_json::Value>> {
    Ok(match body {
        PatchBody::Merge(v) => Patch::Merge(v.clone()),
        PatchBody::Strategic(v) => Patch::Strategic(v.clone()),
        PatchBody::Json(ops) => {
            let p: json_patch::Patch =
                serde_json::from_value(ops.clone()).map_err(|e| ClientError::Invalid(format!("json patch: {e}")))?;
            Patch::Json(p)
        }
    })
}

#[async_trait::async_trait]
impl ResourceClient for KubeClient {
    async fn get(&self, key: &ObjectKey) -> ClientResult<ManagedResource> {
        let api = self.api(key, None).await?;
        let obj = api.get(&key.name).await.map_err(map_kube_error)?;
        ManagedResource::from_raw(to_raw(&obj)?).map_err(|e| ClientError::Invalid(e.to_string()))
    }

    async fn patch(&self, key: &ObjectKey, req: &PatchRequest) -> ClientResult<ManagedResource> {
        let api = self.api(key, req.identity.as_deref()).await?;
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        let patch = kube_patch(&req.body)?;
        let res = match req.subresource.as_deref() {
            Some(sub) => api.patch_subresource(sub, &key.name, &pp, &patch).await,
            None => api.patch(&key.name, &pp, &patch).await,
        };
        let obj = match res {
            Ok(obj) => obj,
            Err(e) => {
                let err = map_kube_error(e);
                if !matches!((&err, &req.body), (ClientError::Invalid(_), PatchBody::Json(_))) {
                    return Err(err);
                }
                let current = self.api(key, None).await?.get(&key.name).await.map_err(map_kube_error)?;
                return Err(refine_patch_error(err, &req.body, current.metadata.resource_version.as_deref()));
            }
        };
        metrics::counter!("kube_writes_total", 1u64, "op" => req.body.kind());
        ManagedResource::from_raw(to_raw(&obj)?).map_err(|e| ClientError::Invalid(e.to_string()))
    }

    async fn delete(&self, key: &ObjectKey, resource_version: Option<&str>) -> ClientResult<()> {
        let api = self.api(key, None).await?;
        let dp = DeleteParams {
            preconditions: resource_version
                .map(|rv| Preconditions { resource_version: Some(rv.to_string()), uid: None }),
            ..Default::default()
        };
        api.delete(&key.name, &dp).await.map_err(map_kube_error)?;
        metrics::counter!("kube_writes_total", 1u64, "op" => "delete");
        Ok(())
    }
}

/// List+watch one type and forward every change as a [`Delta`]. Objects outside
/// `label_selector` are filtered server-side. Runs until the receiver is dropped.
pub async fn start_watcher(
    client: Client,
    type_ref: &TypeRef,
    label_selector: Option<&str>,
    delta_tx: mpsc::Sender<Delta>,
) -> Result<()> {
    let (ar, _caps) = pinned_kind(&client, &gvk_of(type_ref)).await.with_context(|| format!("discovering {type_ref}"))?;
    let api: Api<DynamicObject> = Api::all_with(client, &ar);
    let mut cfg = watcher::Config::default();
    if let Some(sel) = label_selector.filter(|s| !s.trim().is_empty()) {
        cfg = cfg.labels(sel);
    }
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(type_ref = %type_ref, selector = ?label_selector, "watcher started");
    while let Some(ev) = stream.next().await {
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                warn!(type_ref = %type_ref, error = %e, "watch error; backing off");
                metrics::counter!("watch_errors_total", 1u64);
                continue;
            }
        };
        let batch: Vec<(DeltaKind, DynamicObject)> = match ev {
            Event::Applied(o) => vec![(DeltaKind::Applied, o)],
            Event::Deleted(o) => vec![(DeltaKind::Deleted, o)],
            Event::Restarted(list) => {
                debug!(type_ref = %type_ref, count = list.len(), "watch restart");
                list.into_iter().map(|o| (DeltaKind::Applied, o)).collect()
            }
        };
        for (kind, obj) in batch {
            let delta = match to_raw(&obj).map_err(anyhow::Error::from).and_then(|raw| Ok(Delta::from_raw(kind, raw)?)) {
                Ok(d) => d,
                Err(e) => {
                    warn!(type_ref = %type_ref, error = %e, "skipping undecodable object");
                    continue;
                }
            };
            if delta_tx.send(delta).await.is_err() {
                info!(type_ref = %type_ref, "delta receiver closed; watcher exiting");
                return Ok(());
            }
        }
    }
    warn!(type_ref = %type_ref, "watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_error_classes() {
        assert!(matches!(classify(409, "the object has been modified"), ClientError::Conflict(_)));
        assert!(matches!(classify(404, "not found"), ClientError::NotFound(_)));
        assert!(matches!(classify(403, "forbidden"), ClientError::Forbidden(_)));
        assert!(matches!(classify(422, "testing value /metadata/resourceVersion failed"), ClientError::Invalid(_)));
        assert!(matches!(classify(422, "spec.containers: Required value"), ClientError::Invalid(_)));
        assert!(matches!(classify(503, "unavailable"), ClientError::Transport(_)));
        assert!(matches!(classify(504, "gateway timeout"), ClientError::Timeout(_)));
        assert!(classify(429, "slow down").is_retryable());
        assert!(!classify(400, "bad").is_retryable());
    }

    #[test]
    fn stale_guard_on_a_json_patch_is_a_conflict() {
        let guarded = PatchBody::Json(serde_json::json!([
            {"op": "test", "path": "/metadata/resourceVersion", "value": "5"},
            {"op": "remove", "path": "/metadata/finalizers/0"}
        ]));
        let invalid = || ClientError::Invalid("the server rejected our request".into());
        assert!(matches!(refine_patch_error(invalid(), &guarded, Some("6")), ClientError::Conflict(_)));
        assert!(matches!(refine_patch_error(invalid(), &guarded, Some("5")), ClientError::Invalid(_)));
        let merge = PatchBody::Merge(serde_json::json!({"metadata": {"resourceVersion": "5"}}));
        assert!(matches!(refine_patch_error(invalid(), &merge, Some("6")), ClientError::Invalid(_)));
        let forbidden = ClientError::Forbidden("no".into());
        assert!(matches!(refine_patch_error(forbidden, &guarded, Some("6")), ClientError::Forbidden(_)));
    }

    #[test]
    fn json_patch_bodies_convert() {
        let ops = serde_json::json!([
            {"op": "test", "path": "/metadata/resourceVersion", "value": "5"},
            {"op": "add", "path": "/metadata/finalizers/-", "value": "f"}
        ]);
        assert!(matches!(kube_patch(&PatchBody::Json(ops)), Ok(Patch::Json(_))));
        assert!(kube_patch(&PatchBody::Json(serde_json::json!({"not": "ops"}))).is_err());
    }

    #[test]
    fn managed_fields_are_stripped() {
        let mut v = serde_json::json!({"metadata": {"name": "a", "managedFields": [{}]}});
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
    }
}
