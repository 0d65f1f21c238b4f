//! Cluster resource store.
//!
//! Every controller talks to the cluster through [`ResourceStore`], which keeps
//! the reconciliation core independent of the client library and lets the
//! test-suite run it against [`MemoryStore`].

mod cluster;
mod memory;

pub use self::cluster::KubeStore;
pub use self::memory::{MemoryStore, Operation, Verb};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, ObjectReference, PersistentVolume, PersistentVolumeClaim, Pod, Service,
};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::crd::StatefulPod;
use crate::error::Result;

/// A resource kind the store can read and write.
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
    /// Typed API handle; cluster-scoped kinds ignore the namespace.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;

    fn kind_name() -> String {
        Self::kind(&()).to_string()
    }
}

macro_rules! namespaced_objects {
    ($($kind:ty),* $(,)?) => {
        $(
            impl StoreObject for $kind {
                fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::default_namespaced(client),
                    }
                }
            }
        )*
    };
}

macro_rules! cluster_objects {
    ($($kind:ty),* $(,)?) => {
        $(
            impl StoreObject for $kind {
                fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

namespaced_objects!(StatefulPod, Pod, PersistentVolumeClaim, Service);
cluster_objects!(Node, PersistentVolume);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Propagation {
    Foreground,
    Background,
    Orphan,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub grace_period_seconds: Option<u32>,
    pub propagation: Option<Propagation>,
}

impl DeleteOptions {
    /// Immediate removal, bypassing graceful termination.
    pub fn force() -> Self {
        Self {
            grace_period_seconds: Some(0),
            propagation: Some(Propagation::Background),
        }
    }

    pub fn is_force(&self) -> bool {
        self.grace_period_seconds == Some(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// A user-facing event attached to a workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadEvent {
    pub severity: EventSeverity,
    pub reason: String,
    pub note: String,
    pub action: String,
}

impl WorkloadEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Normal,
            reason: reason.to_string(),
            note: note.into(),
            action: action.to_string(),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Warning,
            reason: reason.to_string(),
            note: note.into(),
            action: action.to_string(),
        }
    }
}

/// Cluster resource store abstraction for testability.
///
/// `create`, `replace` and `replace_status` take the namespace from the
/// object's own metadata. `replace` and `replace_status` are conditional
/// writes: when the submitted object carries a resource version that no longer
/// matches the stored one they fail with [`crate::Error::Conflict`].
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K>;

    async fn replace<K: StoreObject>(&self, obj: &K) -> Result<K>;

    async fn replace_status<K: StoreObject>(&self, obj: &K) -> Result<K>;

    async fn delete<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<()>;

    async fn publish_event(&self, regarding: &ObjectReference, event: WorkloadEvent)
        -> Result<()>;
}
