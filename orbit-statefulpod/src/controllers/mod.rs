//! Per-resource lifecycle controllers driven by the [`crate::Reconciler`].

pub mod claim;
pub mod endpoint;
pub mod node;
pub mod replica;
pub mod volume;

pub use claim::ClaimController;
pub use endpoint::EndpointController;
pub use node::NodeOracle;
pub use replica::ReplicaController;
pub use volume::{
    AnnotationExemption, RetentionExemption, RetentionProgress, StaticBinding, VolumeController,
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::warn;

use crate::crd::{StatefulPod, GROUP_VERSION, INDEX_ANNOTATION, PARENT_NAME_ANNOTATION};
use crate::error::{Error, Result};
use crate::store::{ResourceStore, WorkloadEvent};

/// Annotations linking an owned object back to its workload.
pub fn owner_annotations(sp: &StatefulPod, index: Option<usize>) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(GROUP_VERSION.to_string(), "true".to_string());
    annotations.insert(PARENT_NAME_ANNOTATION.to_string(), sp.name_any());
    if let Some(index) = index {
        annotations.insert(INDEX_ANNOTATION.to_string(), index.to_string());
    }
    annotations
}

/// Metadata for an object owned by `sp`, garbage-collected with it.
pub(crate) fn owned_metadata(
    sp: &StatefulPod,
    name: String,
    index: Option<usize>,
) -> Result<ObjectMeta> {
    let owner = sp
        .controller_owner_ref(&())
        .ok_or(Error::MissingField("metadata.uid"))?;

    Ok(ObjectMeta {
        name: Some(name),
        namespace: sp.namespace(),
        annotations: Some(owner_annotations(sp, index)),
        owner_references: Some(vec![owner]),
        ..Default::default()
    })
}

pub(crate) fn is_terminating(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// Publishes an event on the workload; a failed publish never fails the pass.
pub(crate) async fn record_event<S: ResourceStore>(
    store: &S,
    sp: &StatefulPod,
    event: WorkloadEvent,
) {
    let reason = event.reason.clone();
    if let Err(e) = store.publish_event(&sp.object_ref(&()), event).await {
        warn!(workload = %sp.name_any(), %reason, "Failed to publish event: {}", e);
    }
}
