use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{
    api::{Api, PostParams},
    Client,
};
use stagehand_core::{ClientResult, EventRecord, EventSink};

use crate::map_kube_error;

/// Writes `core/v1` Events attached to the subject object.
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
    component: String,
}

impl KubeEventSink {
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        Self { client, component: component.into() }
    }
}

pub(crate) fn build_event(rec: &EventRecord, component: &str) -> Event {
    let now = Time(Utc::now());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    Event {
        metadata: ObjectMeta {
            name: Some(format!("{}.{}", rec.subject.name, &suffix[..16])),
            namespace: Some(rec.subject.namespace.clone().unwrap_or_else(|| "default".to_string())),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some(rec.subject.type_ref.api_version()),
            kind: Some(rec.subject.type_ref.kind.clone()),
            name: Some(rec.subject.name.clone()),
            namespace: rec.subject.namespace.clone(),
            uid: rec.subject_uid.clone(),
            ..Default::default()
        },
        reason: Some(rec.reason.clone()),
        message: Some(rec.message.clone()),
        type_: Some(rec.event_type.clone()),
        count: Some(1),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        source: Some(EventSource { component: Some(component.to_string()), host: None }),
        reporting_component: Some(component.to_string()),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl EventSink for KubeEventSink {
    async fn emit(&self, event: EventRecord) -> ClientResult<()> {
        let ev = build_event(&event, &self.component);
        let ns = ev.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let api: Api<Event> = Api::namespaced(self.client.clone(), &ns);
        api.create(&PostParams::default(), &ev).await.map_err(map_kube_error)?;
        Ok(())
    }
}
