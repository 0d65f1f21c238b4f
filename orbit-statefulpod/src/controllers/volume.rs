use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::NodeOracle;
use crate::crd::{StatefulPod, StorageStatus, PROVISION_ON_NODE_ANNOTATION};
use crate::error::Result;
use crate::store::ResourceStore;

const PHASE_AVAILABLE: &str = "Available";
const RECLAIM_RETAIN: &str = "Retain";

/// Decides whether a bound volume is retained by some other lifecycle and must
/// be left alone during teardown.
pub trait RetentionExemption: Send + Sync {
    fn is_exempt(&self, replica: Option<&Pod>, volume: &PersistentVolume) -> bool;
}

/// Exempts volumes whose replica, or the volume itself, carries an annotation.
#[derive(Clone, Debug)]
pub struct AnnotationExemption {
    key: String,
}

impl AnnotationExemption {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl RetentionExemption for AnnotationExemption {
    fn is_exempt(&self, replica: Option<&Pod>, volume: &PersistentVolume) -> bool {
        replica.is_some_and(|pod| pod.annotations().contains_key(&self.key))
            || volume.annotations().contains_key(&self.key)
    }
}

/// A pre-provisioned volume an ordinal is pinned to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticBinding {
    pub volume_name: String,
    pub node_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionProgress {
    pub complete: bool,
    /// Ordinals whose claim status changed (volume recorded or exemption
    /// flagged); their status needs persisting before claims go away.
    pub updated: Vec<usize>,
}

pub struct VolumeController<S> {
    store: Arc<S>,
    nodes: NodeOracle<S>,
    exemption: Arc<dyn RetentionExemption>,
}

fn is_available(pv: &PersistentVolume) -> bool {
    pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some(PHASE_AVAILABLE)
}

impl<S: ResourceStore> VolumeController<S> {
    pub fn new(
        store: Arc<S>,
        nodes: NodeOracle<S>,
        exemption: Arc<dyn RetentionExemption>,
    ) -> Self {
        Self {
            store,
            nodes,
            exemption,
        }
    }

    /// Volume bound to a tracked claim. The binding may never have made it
    /// into the status, so the live claim is consulted when it is missing.
    async fn bound_volume(&self, sp: &StatefulPod, claim: &StorageStatus) -> Result<Option<String>> {
        if !claim.pv_name.is_empty() {
            return Ok(Some(claim.pv_name.clone()));
        }
        let live: Option<PersistentVolumeClaim> = self
            .store
            .get(sp.namespace().as_deref(), &claim.pvc_name)
            .await?;
        Ok(live
            .and_then(|c| c.spec)
            .and_then(|s| s.volume_name)
            .filter(|name| !name.is_empty()))
    }

    /// The volume listed for ordinal `index`, if it is free and its node is
    /// healthy.
    pub async fn static_binding(
        &self,
        sp: &StatefulPod,
        index: usize,
    ) -> Result<Option<StaticBinding>> {
        let Some(volume_name) = sp.spec.pv_names.get(index).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let Some(pv) = self
            .store
            .get::<PersistentVolume>(None, volume_name)
            .await?
        else {
            debug!(volume = %volume_name, "Static volume not found, provisioning dynamically");
            return Ok(None);
        };
        if !is_available(&pv) {
            debug!(volume = %volume_name, "Static volume not available");
            return Ok(None);
        }
        let Some(node_name) = pv.annotations().get(PROVISION_ON_NODE_ANNOTATION).cloned() else {
            return Ok(None);
        };
        if !self.nodes.is_ready(&node_name).await {
            return Ok(None);
        }

        Ok(Some(StaticBinding {
            volume_name: volume_name.clone(),
            node_name,
        }))
    }

    /// Switches every tracked, non-exempt volume to the `Retain` reclaim
    /// policy. Exemption decisions and volumes found only on the live claim
    /// are written into `sp`'s claim status.
    #[instrument(skip(self, sp), fields(workload = %sp.name_any()))]
    pub async fn set_retain_all(&self, sp: &mut StatefulPod) -> Result<RetentionProgress> {
        let mut progress = RetentionProgress {
            complete: true,
            updated: Vec::new(),
        };
        if !sp.retains_volumes() {
            return Ok(progress);
        }

        let namespace = sp.namespace();
        let claims = sp.tracked_claims().to_vec();
        for (i, claim) in claims.iter().enumerate() {
            if claim.is_none_claim() || claim.retention_exempt {
                continue;
            }
            let Some(volume) = self.bound_volume(sp, claim).await? else {
                continue;
            };
            if claim.pv_name.is_empty() {
                debug!(volume = %volume, ordinal = i, "Recording volume of live claim");
                sp.status_mut().pvc_status[i].pv_name = volume.clone();
                progress.updated.push(i);
            }
            let Some(mut pv) = self.store.get::<PersistentVolume>(None, &volume).await? else {
                continue;
            };

            let replica: Option<Pod> = self
                .store
                .get(namespace.as_deref(), &sp.replica_name(i))
                .await?;
            if self.exemption.is_exempt(replica.as_ref(), &pv) {
                info!(volume = %volume, ordinal = i, "Volume exempt from retention");
                sp.status_mut().pvc_status[i].retention_exempt = true;
                if !progress.updated.contains(&i) {
                    progress.updated.push(i);
                }
                continue;
            }

            let spec = pv.spec.get_or_insert_with(Default::default);
            if spec.persistent_volume_reclaim_policy.as_deref() == Some(RECLAIM_RETAIN) {
                continue;
            }
            spec.persistent_volume_reclaim_policy = Some(RECLAIM_RETAIN.to_string());
            spec.storage_class_name = Some(String::new());

            match self.store.replace(&pv).await {
                Ok(_) => info!(volume = %volume, "Volume set to Retain"),
                Err(e) if e.is_conflict() => {
                    debug!(volume = %volume, "Volume changed underneath, retrying later");
                    progress.complete = false;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(progress)
    }

    /// Releases every tracked, non-exempt volume so it can be bound again.
    /// Returns true once all of them are observed `Available`.
    #[instrument(skip(self, sp), fields(workload = %sp.name_any()))]
    pub async fn set_available_all(&self, sp: &StatefulPod) -> Result<bool> {
        if !sp.retains_volumes() {
            return Ok(true);
        }

        let mut complete = true;
        for claim in sp.tracked_claims() {
            if claim.is_none_claim() || claim.retention_exempt {
                continue;
            }
            let Some(volume) = self.bound_volume(sp, claim).await? else {
                continue;
            };
            let Some(mut pv) = self.store.get::<PersistentVolume>(None, &volume).await? else {
                continue;
            };
            if is_available(&pv) {
                continue;
            }

            complete = false;
            pv.metadata.finalizers = None;
            if let Some(spec) = pv.spec.as_mut() {
                spec.claim_ref = None;
            }
            let mut released = match self.store.replace(&pv).await {
                Ok(released) => released,
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            };
            released.status.get_or_insert_with(Default::default).phase =
                Some(PHASE_AVAILABLE.to_string());
            match self.store.replace_status(&released).await {
                Ok(_) => info!(volume = %volume, "Volume released"),
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    warn!(volume = %volume, "Volume release raced: {}", e)
                }
                Err(e) => return Err(e),
            }
        }

        Ok(complete)
    }
}
