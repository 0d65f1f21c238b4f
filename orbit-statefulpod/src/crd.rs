use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PodSpec, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Annotation key marking every replica and claim owned by a StatefulPod.
pub const GROUP_VERSION: &str = "orbit.turingworks.com/v1";

/// Back-reference from an owned replica or claim to its StatefulPod.
pub const PARENT_NAME_ANNOTATION: &str = "parentName";

/// Ordinal of an owned replica or claim, string-encoded.
pub const INDEX_ANNOTATION: &str = "index";

/// Terminal-deletion marker placed on the StatefulPod itself.
pub const STATEFULPOD_FINALIZER: &str = "statefulpod.orbit.turingworks.com/finalizer";

/// Protective marker placed on the discovery endpoint.
pub const ENDPOINT_FINALIZER: &str = "orbit.turingworks.com/statefulpod-protection";

/// Node a pre-provisioned volume lives on.
pub const PROVISION_ON_NODE_ANNOTATION: &str = "kubevirt.io/provisionOnNode";

/// Claim name recorded for ordinals of a workload without a claim template.
pub const NONE_CLAIM: &str = "none";

/// Claim volume name used when the pod template does not name one.
pub const DEFAULT_VOLUME_NAME: &str = "data";

/// StatefulPod runs an ordered set of replicas, each optionally paired with its
/// own storage claim, behind an optional shared discovery endpoint.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "orbit.turingworks.com",
    version = "v1",
    kind = "StatefulPod",
    plural = "statefulpods",
    namespaced
)]
#[kube(status = "StatefulPodStatus")]
#[kube(shortname = "sp")]
#[serde(rename_all = "camelCase")]
pub struct StatefulPodSpec {
    /// Desired number of replicas
    #[schemars(range(min = 0))]
    pub size: i32,

    /// Labels copied onto every replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// What happens to bound volumes when the StatefulPod is deleted
    #[serde(default)]
    pub pv_recycle_policy: ReclaimPolicy,

    /// Discovery endpoint shared by all replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_template: Option<ServiceSpec>,

    /// Replica pod spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodSpec>,

    /// Per-replica storage claim spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_template: Option<PersistentVolumeClaimSpec>,

    /// Pre-existing volumes to bind statically, index-aligned with replicas
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pv_names: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ReclaimPolicy {
    Retain,
    #[default]
    Delete,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatefulPodStatus {
    /// One entry per replica ordinal
    #[serde(default)]
    pub pod_status: Vec<ReplicaStatus>,

    /// One entry per claim ordinal, index-aligned with `pod_status`
    #[serde(default)]
    pub pvc_status: Vec<StorageStatus>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ReplicaCondition {
    Preparing,
    Running,
    Deleting,
    #[serde(rename = "CreateTimeOut")]
    CreateTimeout,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    pub pod_name: String,
    pub status: ReplicaCondition,
    pub index: usize,
    #[serde(default)]
    pub node_name: String,
}

impl ReplicaStatus {
    pub fn preparing(pod_name: impl Into<String>, index: usize) -> Self {
        Self {
            pod_name: pod_name.into(),
            status: ReplicaCondition::Preparing,
            index,
            node_name: String::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ClaimCondition {
    Pending,
    Bound,
    Deleting,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub index: usize,
    pub pvc_name: String,
    /// Empty for ordinals without a claim
    #[serde(default)]
    pub status: Option<ClaimCondition>,
    #[serde(default)]
    pub capacity: String,
    #[serde(default)]
    pub access_modes: Vec<String>,
    #[serde(default)]
    pub storage_class: String,
    #[serde(default)]
    pub pv_name: String,
    /// Set during teardown when the bound volume belongs to another lifecycle
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retention_exempt: bool,
}

impl StorageStatus {
    /// Placeholder keeping `pvc_status` aligned when no claim template exists.
    pub fn none(index: usize) -> Self {
        Self {
            index,
            pvc_name: NONE_CLAIM.to_string(),
            status: None,
            capacity: String::new(),
            access_modes: vec![NONE_CLAIM.to_string()],
            storage_class: String::new(),
            pv_name: String::new(),
            retention_exempt: false,
        }
    }

    pub fn is_none_claim(&self) -> bool {
        self.pvc_name == NONE_CLAIM
    }
}

impl StatefulPodStatus {
    pub fn len(&self) -> usize {
        self.pod_status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pod_status.is_empty()
    }

    pub fn is_aligned(&self) -> bool {
        self.pod_status.len() == self.pvc_status.len()
    }

    /// True while the trailing ordinal is still being created.
    pub fn tail_in_flight(&self) -> bool {
        let replica = self
            .pod_status
            .last()
            .map(|s| s.status == ReplicaCondition::Preparing)
            .unwrap_or(false);
        let claim = self
            .pvc_status
            .last()
            .map(|s| s.status == Some(ClaimCondition::Pending))
            .unwrap_or(false);
        replica || claim
    }

    pub fn truncate(&mut self, len: usize) {
        self.pod_status.truncate(len);
        self.pvc_status.truncate(len);
    }

    pub fn check_aligned(&self) -> Result<()> {
        if self.is_aligned() {
            Ok(())
        } else {
            Err(Error::StatusMisaligned {
                replicas: self.pod_status.len(),
                claims: self.pvc_status.len(),
            })
        }
    }

    /// Records both entries of ordinal `index`, appending when it is the next
    /// ordinal. Returns whether anything changed.
    pub fn set(
        &mut self,
        index: usize,
        replica: ReplicaStatus,
        claim: StorageStatus,
    ) -> Result<bool> {
        self.check_aligned()?;
        let len = self.len();
        if index > len {
            return Err(Error::IndexOutOfRange { index, len });
        }
        if index == len {
            self.pod_status.push(replica);
            self.pvc_status.push(claim);
            return Ok(true);
        }

        let changed = self.pod_status[index] != replica || self.pvc_status[index] != claim;
        self.pod_status[index] = replica;
        self.pvc_status[index] = claim;
        Ok(changed)
    }
}

impl StatefulPod {
    pub fn desired_size(&self) -> usize {
        self.spec.size.max(0) as usize
    }

    pub fn tracked(&self) -> &[ReplicaStatus] {
        self.status
            .as_ref()
            .map(|s| s.pod_status.as_slice())
            .unwrap_or_default()
    }

    pub fn tracked_claims(&self) -> &[StorageStatus] {
        self.status
            .as_ref()
            .map(|s| s.pvc_status.as_slice())
            .unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut StatefulPodStatus {
        self.status.get_or_insert_with(StatefulPodStatus::default)
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == STATEFULPOD_FINALIZER)
    }

    pub fn wants_claims(&self) -> bool {
        self.spec.pvc_template.is_some()
    }

    pub fn retains_volumes(&self) -> bool {
        self.spec.pv_recycle_policy == ReclaimPolicy::Retain
    }

    /// Replica name for ordinal `index`.
    pub fn replica_name(&self, index: usize) -> String {
        format!("{}{}", self.name_any(), index)
    }

    /// Name of the claim volume declared by the pod template, `data` when unset.
    pub fn claim_volume_name(&self) -> String {
        self.spec
            .pod_template
            .as_ref()
            .and_then(|spec| spec.volumes.as_ref())
            .and_then(|volumes| {
                volumes
                    .iter()
                    .find_map(|v| v.persistent_volume_claim.as_ref())
            })
            .map(|source| source.claim_name.clone())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_VOLUME_NAME.to_string())
    }

    /// Claim name for ordinal `index`, `none` when there is no claim template.
    pub fn claim_name(&self, index: usize) -> String {
        if !self.wants_claims() {
            return NONE_CLAIM.to_string();
        }
        format!("{}-{}-{}", self.claim_volume_name(), self.name_any(), index)
    }

    pub fn endpoint_name(&self) -> String {
        format!("{}-service", self.name_any())
    }
}
