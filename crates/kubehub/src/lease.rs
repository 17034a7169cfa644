use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::{
    api::{Api, PostParams},
    Client,
};
use stagehand_core::{ClientResult, LeaseClient};
use tracing::debug;

use crate::map_kube_error;

/// Maintains `coordination.k8s.io/v1` Leases named after each node.
#[derive(Clone)]
pub struct KubeLeaseClient {
    api: Api<Lease>,
}

impl KubeLeaseClient {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self { api: Api::namespaced(client, namespace) }
    }
}

/// Refresh holder, duration and renew time; keeps metadata (and its resourceVersion).
pub(crate) fn renewed(existing: Option<Lease>, node: &str, holder: &str, duration_secs: i32) -> Lease {
    let now = MicroTime(Utc::now());
    let mut lease = existing.unwrap_or_else(|| Lease {
        metadata: ObjectMeta { name: Some(node.to_string()), ..Default::default() },
        spec: None,
    });
    let mut spec = lease.spec.take().unwrap_or_default();
    if spec.holder_identity.as_deref() != Some(holder) || spec.acquire_time.is_none() {
        spec.acquire_time = Some(now.clone());
    }
    spec.holder_identity = Some(holder.to_string());
    spec.lease_duration_seconds = Some(duration_secs);
    spec.renew_time = Some(now);
    lease.spec = Some(spec);
    lease
}

#[async_trait::async_trait]
impl LeaseClient for KubeLeaseClient {
    async fn renew(&self, node: &str, holder: &str, duration_secs: i32) -> ClientResult<()> {
        let pp = PostParams::default();
        match self.api.get_opt(node).await.map_err(map_kube_error)? {
            Some(existing) => {
                let lease = renewed(Some(existing), node, holder, duration_secs);
                self.api.replace(node, &pp, &lease).await.map_err(map_kube_error)?;
            }
            None => {
                debug!(node, "creating lease");
                let lease = renewed(None, node, holder, duration_secs);
                self.api.create(&pp, &lease).await.map_err(map_kube_error)?;
            }
        }
        Ok(())
    }
}
