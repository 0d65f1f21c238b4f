use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume,
};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{is_terminating, owned_metadata, record_event, NodeOracle, StaticBinding};
use crate::crd::{ClaimCondition, ReplicaCondition, ReplicaStatus, StatefulPod, DEFAULT_VOLUME_NAME};
use crate::error::{Error, IgnoreNotFound, Result};
use crate::status::StatusEdit;
use crate::store::{DeleteOptions, ResourceStore, WorkloadEvent};

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Creates, inspects and deletes the replica of each ordinal.
pub struct ReplicaController<S> {
    store: Arc<S>,
    nodes: NodeOracle<S>,
    creation_timeout: Duration,
}

/// Running, with every readiness condition true.
pub fn is_running_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .filter(|c| c.type_ == "Ready")
        .all(|c| c.status == "True")
}

fn has_exited(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Failed") | Some("Succeeded")
    )
}

fn age(pod: &Pod) -> Duration {
    pod.metadata
        .creation_timestamp
        .as_ref()
        .and_then(|created| (Utc::now() - created.0).to_std().ok())
        .unwrap_or_default()
}

/// Points the template's claim-backed volume at `claim_name`, adding one when
/// the template declares none.
fn bind_claim(spec: &mut PodSpec, claim_name: String) {
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    if let Some(source) = volumes
        .iter_mut()
        .find_map(|v| v.persistent_volume_claim.as_mut())
    {
        source.claim_name = claim_name;
        return;
    }
    volumes.push(Volume {
        name: DEFAULT_VOLUME_NAME.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name,
            ..Default::default()
        }),
        ..Default::default()
    });
}

fn pin_to_node(spec: &mut PodSpec, node_name: &str) {
    let affinity = spec.affinity.get_or_insert_with(Affinity::default);
    affinity.node_affinity = Some(NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: HOSTNAME_LABEL.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![node_name.to_string()]),
                }]),
                ..Default::default()
            }],
        }),
        ..Default::default()
    });
}

impl<S: ResourceStore> ReplicaController<S> {
    pub fn new(store: Arc<S>, nodes: NodeOracle<S>, creation_timeout: Duration) -> Self {
        Self {
            store,
            nodes,
            creation_timeout,
        }
    }

    pub async fn get(&self, sp: &StatefulPod, index: usize) -> Result<Option<Pod>> {
        self.store
            .get(sp.namespace().as_deref(), &sp.replica_name(index))
            .await
    }

    pub fn template(
        &self,
        sp: &StatefulPod,
        index: usize,
        binding: Option<&StaticBinding>,
    ) -> Result<Pod> {
        let name = sp.replica_name(index);
        let mut spec = sp.spec.pod_template.clone().unwrap_or_default();
        spec.hostname = Some(name.clone());

        let mut labels = BTreeMap::new();
        if let Some(service) = &sp.spec.service_template {
            spec.subdomain = Some(sp.endpoint_name());
            for (k, v) in service.selector.iter().flatten() {
                labels.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        if let Some(selector) = &sp.spec.selector {
            for (k, v) in selector.match_labels.iter().flatten() {
                labels.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        if sp.wants_claims() {
            bind_claim(&mut spec, sp.claim_name(index));
        }
        if let Some(binding) = binding {
            pin_to_node(&mut spec, &binding.node_name);
        }

        let mut metadata = owned_metadata(sp, name, Some(index))?;
        metadata.labels = Some(labels);

        Ok(Pod {
            metadata,
            spec: Some(spec),
            ..Default::default()
        })
    }

    /// Ensures the replica of `index` exists. Returns `None` while a previous
    /// incarnation is still terminating.
    #[instrument(skip(self, sp, binding), fields(workload = %sp.name_any()))]
    pub async fn expand(
        &self,
        sp: &StatefulPod,
        index: usize,
        binding: Option<&StaticBinding>,
    ) -> Result<Option<ReplicaStatus>> {
        let name = sp.replica_name(index);
        match self.get(sp, index).await? {
            Some(pod) if is_terminating(&pod.metadata) => {
                debug!(replica = %name, "Previous replica still terminating");
                Ok(None)
            }
            Some(_) => Ok(Some(match sp.tracked().get(index) {
                Some(tracked)
                    if matches!(
                        tracked.status,
                        ReplicaCondition::Preparing | ReplicaCondition::Running
                    ) =>
                {
                    tracked.clone()
                }
                _ => ReplicaStatus::preparing(name, index),
            })),
            None => {
                let pod = self.template(sp, index, binding)?;
                match self.store.create(&pod).await {
                    Ok(_) => info!(replica = %name, "Created replica"),
                    Err(e) if e.is_already_exists() => {
                        debug!(replica = %name, "Replica created concurrently")
                    }
                    Err(e) => return Err(e),
                }
                Ok(Some(ReplicaStatus::preparing(name, index)))
            }
        }
    }

    /// True when the replica of `index` is still being prepared and has not
    /// become ready within the creation timeout.
    pub async fn is_creation_timed_out(&self, sp: &StatefulPod, index: usize) -> Result<bool> {
        if let Some(tracked) = sp.tracked().get(index) {
            if tracked.status != ReplicaCondition::Preparing {
                return Ok(false);
            }
        }
        let Some(pod) = self.get(sp, index).await? else {
            return Ok(false);
        };
        if is_terminating(&pod.metadata) || is_running_ready(&pod) {
            return Ok(false);
        }
        Ok(age(&pod) >= self.creation_timeout)
    }

    /// Deletes the replica of `index`; true once it is gone.
    #[instrument(skip(self, sp), fields(workload = %sp.name_any()))]
    pub async fn shrink(&self, sp: &StatefulPod, index: usize) -> Result<bool> {
        match self.get(sp, index).await? {
            None => return Ok(true),
            Some(pod) if is_terminating(&pod.metadata) => return Ok(false),
            Some(_) => {
                info!(replica = %sp.replica_name(index), "Deleting replica");
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
        self.store
            .delete::<Pod>(sp.namespace().as_deref(), &sp.replica_name(index), options)
            .await
            .ignore_not_found()
    }

    async fn delete_claim(
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

    /// Deletes every tracked replica; true once none is left.
    pub async fn delete_all(&self, sp: &StatefulPod) -> Result<bool> {
        let ordinals = sp.tracked().len().max(sp.tracked_claims().len());
        let mut absent = 0;
        for index in 0..ordinals {
            match self.get(sp, index).await? {
                None => absent += 1,
                Some(pod) if is_terminating(&pod.metadata) => {}
                Some(_) => self.delete(sp, index, &DeleteOptions::default()).await?,
            }
        }
        debug!(workload = %sp.name_any(), absent, ordinals, "Replica teardown progress");
        Ok(absent == ordinals)
    }

    /// First tracked ordinal whose replica needs re-creating.
    pub async fn maintain_scan(&self, sp: &StatefulPod) -> Result<Option<usize>> {
        for (index, tracked) in sp.tracked().iter().enumerate() {
            match self.get(sp, index).await? {
                None => return Ok(Some(index)),
                Some(pod)
                    if !is_terminating(&pod.metadata)
                        && matches!(
                            tracked.status,
                            ReplicaCondition::Deleting | ReplicaCondition::CreateTimeout
                        ) =>
                {
                    return Ok(Some(index))
                }
                Some(_) => {}
            }
        }
        Ok(None)
    }

    /// Classifies an observed replica into the tracked status of `index`,
    /// acting on failed nodes, exited replicas and creation timeouts.
    #[instrument(skip(self, sp, pod), fields(workload = %sp.name_any(), replica = %pod.name_any()))]
    pub async fn monitor_condition(
        &self,
        sp: &mut StatefulPod,
        pod: &Pod,
        index: usize,
    ) -> Result<Option<StatusEdit>> {
        let len = sp.tracked().len();
        if index >= len {
            debug!(len, "Replica not tracked yet");
            return Ok(None);
        }
        sp.status_mut().check_aligned()?;
        let current = sp.tracked()[index].status;

        if is_terminating(&pod.metadata) {
            if matches!(
                current,
                ReplicaCondition::Deleting | ReplicaCondition::CreateTimeout
            ) {
                return Ok(None);
            }
            sp.status_mut().pod_status[index].status = ReplicaCondition::Deleting;
            return Ok(Some(StatusEdit::Set(index)));
        }

        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();
        if !self.nodes.is_ready(&node_name).await {
            warn!(node = %node_name, "Node unhealthy, force-deleting replica");
            self.delete(sp, index, &DeleteOptions::force()).await?;
            self.delete_claim(sp, index, &DeleteOptions::force()).await?;
            self.mark_deleting(sp, index, ReplicaCondition::Deleting);
            record_event(
                self.store.as_ref(),
                sp,
                WorkloadEvent::warning(
                    "NodeUnhealthy",
                    "Evicting",
                    format!("Replica {} evicted from node {}", pod.name_any(), node_name),
                ),
            )
            .await;
            return Ok(Some(StatusEdit::Set(index)));
        }

        if has_exited(pod) {
            info!("Replica exited, deleting for re-creation");
            self.delete(sp, index, &DeleteOptions::default()).await?;
            if current == ReplicaCondition::Deleting {
                return Ok(None);
            }
            sp.status_mut().pod_status[index].status = ReplicaCondition::Deleting;
            return Ok(Some(StatusEdit::Set(index)));
        }

        if is_running_ready(pod) {
            if current == ReplicaCondition::Running {
                return Ok(None);
            }
            let entry = &mut sp.status_mut().pod_status[index];
            entry.pod_name = pod.name_any();
            entry.status = ReplicaCondition::Running;
            entry.node_name = node_name;
            info!("Replica running");
            return Ok(Some(StatusEdit::Set(index)));
        }

        if current == ReplicaCondition::Preparing && age(pod) >= self.creation_timeout {
            return self.abandon(sp, index).await.map(Some);
        }

        Ok(None)
    }

    /// Gives up on a replica that never became ready: deletes it and its
    /// claim, and either drops the ordinal (tail) or flags it for re-creation.
    pub async fn abandon(&self, sp: &mut StatefulPod, index: usize) -> Result<StatusEdit> {
        let len = sp.tracked().len();
        if index >= len {
            return Err(Error::IndexOutOfRange { index, len });
        }

        warn!(
            workload = %sp.name_any(),
            ordinal = index,
            timeout_secs = self.creation_timeout.as_secs(),
            "Replica creation timed out"
        );
        self.delete(sp, index, &DeleteOptions::default()).await?;
        self.delete_claim(sp, index, &DeleteOptions::default())
            .await?;
        record_event(
            self.store.as_ref(),
            sp,
            WorkloadEvent::warning(
                "CreateTimeout",
                "Recreating",
                format!(
                    "Replica {} not ready after {}s",
                    sp.replica_name(index),
                    self.creation_timeout.as_secs()
                ),
            ),
        )
        .await;

        if index + 1 == len {
            sp.status_mut().truncate(index);
            Ok(StatusEdit::Truncate(index))
        } else {
            self.mark_deleting(sp, index, ReplicaCondition::CreateTimeout);
            Ok(StatusEdit::Set(index))
        }
    }

    fn mark_deleting(&self, sp: &mut StatefulPod, index: usize, condition: ReplicaCondition) {
        let wants_claims = sp.wants_claims();
        let status = sp.status_mut();
        status.pod_status[index].status = condition;
        if wants_claims {
            status.pvc_status[index].status = Some(ClaimCondition::Deleting);
        }
    }
}
