use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{DeleteParams, PostParams, PropagationPolicy},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client, ResourceExt,
};
use tracing::debug;

use super::{DeleteOptions, EventSeverity, Propagation, ResourceStore, StoreObject, WorkloadEvent};
use crate::error::{Error, Result};

pub const CONTROLLER_NAME: &str = "orbit-statefulpod-controller";

/// Store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    recorder: Recorder,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: CONTROLLER_NAME.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        );

        Self { client, recorder }
    }
}

enum Write {
    Create,
    Update,
}

fn map_api_error<K: StoreObject>(err: kube::Error, name: &str, write: Option<Write>) -> Error {
    match (&err, write) {
        (kube::Error::Api(ae), _) if ae.code == 404 => Error::not_found(K::kind_name(), name),
        (kube::Error::Api(ae), Some(Write::Create)) if ae.code == 409 => {
            Error::already_exists(K::kind_name(), name)
        }
        (kube::Error::Api(ae), Some(Write::Update)) if ae.code == 409 => {
            Error::conflict(K::kind_name(), name)
        }
        _ => Error::Kube(err),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        K::api(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_api_error::<K>(e, name, None))
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        debug!("Creating {} {}", K::kind_name(), name);
        K::api(self.client.clone(), obj.namespace().as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_api_error::<K>(e, &name, Some(Write::Create)))
    }

    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        K::api(self.client.clone(), obj.namespace().as_deref())
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_api_error::<K>(e, &name, Some(Write::Update)))
    }

    async fn replace_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let data = serde_json::to_vec(obj)?;
        K::api(self.client.clone(), obj.namespace().as_deref())
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| map_api_error::<K>(e, &name, Some(Write::Update)))
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: options.grace_period_seconds,
            propagation_policy: options.propagation.map(|p| match p {
                Propagation::Foreground => PropagationPolicy::Foreground,
                Propagation::Background => PropagationPolicy::Background,
                Propagation::Orphan => PropagationPolicy::Orphan,
            }),
            ..DeleteParams::default()
        };

        debug!("Deleting {} {} ({:?})", K::kind_name(), name, options);
        K::api(self.client.clone(), namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| map_api_error::<K>(e, name, None))
    }

    async fn publish_event(
        &self,
        regarding: &ObjectReference,
        event: WorkloadEvent,
    ) -> Result<()> {
        let type_ = match event.severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };

        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason,
                    note: Some(event.note),
                    action: event.action,
                    secondary: None,
                },
                regarding,
            )
            .await
            .map_err(Error::Kube)
    }
}
