use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::{is_terminating, owned_metadata, StaticBinding};
use crate::crd::{ClaimCondition, ReplicaCondition, StatefulPod, StorageStatus};
use crate::error::{Error, IgnoreNotFound, Result};
use crate::status::StatusEdit;
use crate::store::{DeleteOptions, ResourceStore};

/// Creates, inspects and deletes the storage claim of each ordinal. Workloads
/// without a claim template get the `none` placeholder instead.
pub struct ClaimController<S> {
    store: Arc<S>,
}

fn is_bound(claim: &PersistentVolumeClaim) -> bool {
    claim.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound")
}

fn requested_storage(claim: &PersistentVolumeClaim) -> String {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| q.0.clone())
        .unwrap_or_default()
}

/// Status of a claim as it stands in the cluster.
fn observed_status(index: usize, claim: &PersistentVolumeClaim) -> StorageStatus {
    let spec = claim.spec.clone().unwrap_or_default();
    let bound = is_bound(claim);
    StorageStatus {
        index,
        pvc_name: claim.name_any(),
        status: Some(if bound {
            ClaimCondition::Bound
        } else {
            ClaimCondition::Pending
        }),
        capacity: if bound {
            requested_storage(claim)
        } else {
            String::new()
        },
        access_modes: spec.access_modes.unwrap_or_default(),
        storage_class: spec.storage_class_name.unwrap_or_default(),
        pv_name: if bound {
            spec.volume_name.unwrap_or_default()
        } else {
            String::new()
        },
        retention_exempt: false,
    }
}

impl<S: ResourceStore> ClaimController<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn get(&self, sp: &StatefulPod, index: usize) -> Result<Option<PersistentVolumeClaim>> {
        if !sp.wants_claims() {
            return Ok(None);
        }
        self.store
            .get(sp.namespace().as_deref(), &sp.claim_name(index))
            .await
    }

    pub fn template(
        &self,
        sp: &StatefulPod,
        index: usize,
        binding: Option<&StaticBinding>,
    ) -> Result<PersistentVolumeClaim> {
        let mut spec = sp
            .spec
            .pvc_template
            .clone()
            .ok_or(Error::MissingField("spec.pvcTemplate"))?;
        if let Some(binding) = binding {
            spec.storage_class_name = Some(String::new());
            spec.volume_name = Some(binding.volume_name.clone());
        }

        Ok(PersistentVolumeClaim {
            metadata: owned_metadata(sp, sp.claim_name(index), Some(index))?,
            spec: Some(spec),
            ..Default::default()
        })
    }

    /// Ensures the claim of `index` exists. Returns `None` while a previous
    /// incarnation is still terminating.
    #[instrument(skip(self, sp, binding), fields(workload = %sp.name_any()))]
    pub async fn expand(
        &self,
        sp: &StatefulPod,
        index: usize,
        binding: Option<&StaticBinding>,
    ) -> Result<Option<StorageStatus>> {
        if !sp.wants_claims() {
            return Ok(Some(StorageStatus::none(index)));
        }

        let name = sp.claim_name(index);
        match self.get(sp, index).await? {
            Some(claim) if is_terminating(&claim.metadata) => {
                debug!(claim = %name, "Previous claim still terminating");
                Ok(None)
            }
            Some(claim) => Ok(Some(match sp.tracked_claims().get(index) {
                Some(tracked)
                    if tracked.pvc_name == name
                        && matches!(
                            tracked.status,
                            Some(ClaimCondition::Pending) | Some(ClaimCondition::Bound)
                        ) =>
                {
                    tracked.clone()
                }
                _ => observed_status(index, &claim),
            })),
            None => {
                let claim = self.template(sp, index, binding)?;
                let created = match self.store.create(&claim).await {
                    Ok(created) => {
                        info!(claim = %name, "Created claim");
                        created
                    }
                    Err(e) if e.is_already_exists() => {
                        debug!(claim = %name, "Claim created concurrently");
                        claim
                    }
                    Err(e) => return Err(e),
                };
                let mut status = observed_status(index, &created);
                status.status = Some(ClaimCondition::Pending);
                Ok(Some(status))
            }
        }
    }

    /// Deletes the claim of `index`; true once it is gone.
    #[instrument(skip(self, sp), fields(workload = %sp.name_any()))]
    pub async fn shrink(&self, sp: &StatefulPod, index: usize) -> Result<bool> {
        match self.get(sp, index).await? {
            None => return Ok(true),
            Some(claim) if is_terminating(&claim.metadata) => return Ok(false),
            Some(_) => {
                info!(claim = %sp.claim_name(index), "Deleting claim");
                self.delete(sp, index, &DeleteOptions::default()).await?;
            }
        }
        Ok(self.get(sp, index).await?.is_none())
    }

    pub async fn delete(
        &self,
        sp: &StatefulPod,
        index: usize,
        options: &DeleteOptions,
    ) -> Result<()> {
        if !sp.wants_claims() {
            return Ok(());
        }
        self.store
            .delete::<PersistentVolumeClaim>(
                sp.namespace().as_deref(),
                &sp.claim_name(index),
                options,
            )
            .await
            .ignore_not_found()
    }

    /// Deletes every tracked claim; true once none is left.
    pub async fn delete_all(&self, sp: &StatefulPod) -> Result<bool> {
        let namespace = sp.namespace();
        let mut complete = true;
        for tracked in sp.tracked_claims() {
            if tracked.is_none_claim() {
                continue;
            }
            match self
                .store
                .get::<PersistentVolumeClaim>(namespace.as_deref(), &tracked.pvc_name)
                .await?
            {
                None => {}
                Some(claim) if is_terminating(&claim.metadata) => complete = false,
                Some(_) => {
                    self.store
                        .delete::<PersistentVolumeClaim>(
                            namespace.as_deref(),
                            &tracked.pvc_name,
                            &DeleteOptions::default(),
                        )
                        .await
                        .ignore_not_found()?;
                    complete = false;
                }
            }
        }
        Ok(complete)
    }

    /// Classifies an observed claim into the tracked status of `index`.
    #[instrument(skip(self, sp, claim), fields(workload = %sp.name_any(), claim = %claim.name_any()))]
    pub async fn monitor_condition(
        &self,
        sp: &mut StatefulPod,
        claim: &PersistentVolumeClaim,
        index: usize,
    ) -> Result<Option<StatusEdit>> {
        let len = sp.tracked_claims().len();
        if index >= len {
            debug!(len, "Claim not tracked yet");
            return Ok(None);
        }
        sp.status_mut().check_aligned()?;

        let replica = sp.tracked()[index].status;
        let entry = &mut sp.status_mut().pvc_status[index];

        if is_terminating(&claim.metadata) {
            if entry.status == Some(ClaimCondition::Deleting)
                || replica == ReplicaCondition::CreateTimeout
            {
                return Ok(None);
            }
            entry.status = Some(ClaimCondition::Deleting);
            return Ok(Some(StatusEdit::Set(index)));
        }

        if is_bound(claim) {
            if entry.status == Some(ClaimCondition::Bound) {
                return Ok(None);
            }
            let observed = observed_status(index, claim);
            entry.status = Some(ClaimCondition::Bound);
            entry.capacity = observed.capacity;
            entry.pv_name = observed.pv_name;
            info!(volume = %entry.pv_name, "Claim bound");
            return Ok(Some(StatusEdit::Set(index)));
        }

        Ok(None)
    }
}
