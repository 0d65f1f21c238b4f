//! Top-level convergence for StatefulPod workloads.
//!
//! A pass first folds the observed state of every tracked replica and claim
//! into the status, then compares the tracked length with the desired size and
//! takes exactly one of expand, shrink or maintain. Deleted workloads go
//! through [`Reconciler::cleanup`] instead. Nothing in a pass blocks on the
//! cluster: work that cannot finish yet returns [`Outcome::RecheckAfter`].

use futures::FutureExt;
use kube::ResourceExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use crate::config::OperatorConfig;
use crate::controllers::{
    record_event, AnnotationExemption, ClaimController, EndpointController, NodeOracle,
    ReplicaController, RetentionExemption, VolumeController,
};
use crate::crd::{ReplicaCondition, StatefulPod, STATEFULPOD_FINALIZER};
use crate::dispatcher::ObjectKey;
use crate::error::{Error, Result};
use crate::status::{StatusEdit, StatusWriter};
use crate::store::{ResourceStore, WorkloadEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do until the next change or periodic resync.
    Converged,
    /// Work is in flight; look again after the delay.
    RecheckAfter(Duration),
    /// The workload no longer exists.
    Removed,
}

pub struct Reconciler<S> {
    store: Arc<S>,
    config: Arc<OperatorConfig>,
    replicas: ReplicaController<S>,
    claims: ClaimController<S>,
    volumes: VolumeController<S>,
    endpoints: EndpointController<S>,
    status: StatusWriter<S>,
}

impl<S: ResourceStore> Reconciler<S> {
    pub fn new(store: Arc<S>, config: Arc<OperatorConfig>) -> Self {
        let exemption = Arc::new(AnnotationExemption::new(
            config.retention.exempt_annotation.clone(),
        ));
        Self::with_exemption(store, config, exemption)
    }

    pub fn with_exemption(
        store: Arc<S>,
        config: Arc<OperatorConfig>,
        exemption: Arc<dyn RetentionExemption>,
    ) -> Self {
        let nodes = NodeOracle::new(Arc::clone(&store), config.node_grace());
        Self {
            replicas: ReplicaController::new(
                Arc::clone(&store),
                nodes.clone(),
                config.creation_timeout(),
            ),
            claims: ClaimController::new(Arc::clone(&store)),
            volumes: VolumeController::new(Arc::clone(&store), nodes, exemption),
            endpoints: EndpointController::new(Arc::clone(&store)),
            status: StatusWriter::new(Arc::clone(&store), config.reconcile.max_status_retries),
            store,
            config,
        }
    }

    fn recheck(&self) -> Outcome {
        Outcome::RecheckAfter(self.config.requeue())
    }

    async fn fetch(&self, key: &ObjectKey) -> Result<Option<StatefulPod>> {
        self.store.get(Some(&key.namespace), &key.name).await
    }

    async fn persist(&self, sp: &StatefulPod, edit: StatusEdit) -> Result<StatefulPod> {
        self.status.persist(sp, edit).await
    }

    /// Lost write races become a recheck; structural errors are reported and
    /// passed on.
    fn settle(&self, result: Result<Outcome>) -> Result<Outcome> {
        match result {
            Err(e) if e.is_conflict() => {
                debug!("Lost a write race, rechecking: {}", e);
                Ok(self.recheck())
            }
            Err(e) if e.is_structural() => {
                error!("Status arrays inconsistent: {}", e);
                Err(e)
            }
            other => other,
        }
    }

    /// One pass of the workload named by `key`, read from the store. The
    /// workload finalizer is added before the first convergence pass and
    /// removed once cleanup completes.
    #[instrument(skip(self, key), fields(workload = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        let Some(sp) = self.fetch(key).await? else {
            debug!("Workload gone");
            return Ok(Outcome::Removed);
        };

        if sp.is_terminating() {
            if !sp.has_finalizer() {
                return Ok(Outcome::Converged);
            }
            let outcome = self.cleanup(&sp).await?;
            if outcome != Outcome::Converged {
                return Ok(outcome);
            }
            return self.settle(self.set_finalizer(key, false).await.map(|_| outcome));
        }

        let sp = if sp.has_finalizer() {
            sp
        } else {
            match self.set_finalizer(key, true).await {
                Ok(Some(sp)) => sp,
                Ok(None) => return Ok(Outcome::Removed),
                Err(e) => return self.settle(Err(e)),
            }
        };
        self.apply(&sp).await
    }

    /// Converges a live workload towards its desired size.
    #[instrument(skip(self, sp), fields(workload = %sp.name_any()))]
    pub async fn apply(&self, sp: &StatefulPod) -> Result<Outcome> {
        self.settle(self.converge(sp.clone()).await)
    }

    /// Tears down a deleted workload. `Converged` means everything it owned is
    /// gone or released and the finalizer may be removed.
    #[instrument(skip(self, sp), fields(workload = %sp.name_any()))]
    pub async fn cleanup(&self, sp: &StatefulPod) -> Result<Outcome> {
        self.settle(self.teardown(sp.clone()).await)
    }

    async fn converge(&self, sp: StatefulPod) -> Result<Outcome> {
        sp.status.clone().unwrap_or_default().check_aligned()?;
        let sp = self.observe(sp).await?;

        let status = sp.status.clone().unwrap_or_default();
        let tracked = status.len();
        let desired = sp.desired_size();
        // Scale-down always works on the true tail, even one still in flight.
        if tracked > desired {
            return self.shrink(sp, tracked).await;
        }

        let counted = tracked - usize::from(status.tail_in_flight());
        if counted < desired {
            return self.expand(sp, counted).await;
        }
        self.maintain(sp).await
    }

    /// Folds the observed state of every tracked replica and claim into the
    /// status, persisting each change. Returns the stored workload.
    async fn observe(&self, mut sp: StatefulPod) -> Result<StatefulPod> {
        let mut index = 0;
        while index < sp.tracked().len() {
            if let Some(pod) = self.replicas.get(&sp, index).await? {
                if let Some(edit) = self.replicas.monitor_condition(&mut sp, &pod, index).await? {
                    sp = self.persist(&sp, edit).await?;
                }
            }
            if let Some(claim) = self.claims.get(&sp, index).await? {
                if let Some(edit) = self.claims.monitor_condition(&mut sp, &claim, index).await? {
                    sp = self.persist(&sp, edit).await?;
                }
            }
            index += 1;
        }
        Ok(sp)
    }

    /// Expands ordinal `index`, absorbing unexpected faults into a delayed
    /// retry.
    async fn expand(&self, sp: StatefulPod, index: usize) -> Result<Outcome> {
        match AssertUnwindSafe(self.expand_ordinal(sp, index))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(ordinal = index, "Expansion panicked, retrying later");
                Ok(Outcome::RecheckAfter(self.config.error_backoff()))
            }
        }
    }

    async fn expand_ordinal(&self, mut sp: StatefulPod, index: usize) -> Result<Outcome> {
        let len = sp.tracked().len();
        if index > len {
            return Err(Error::IndexOutOfRange { index, len });
        }

        if index == 0
            && sp.spec.service_template.is_some()
            && !self.endpoints.ensure_created(&sp).await?
        {
            info!(endpoint = %sp.endpoint_name(), "Endpoint created, deferring replicas");
            return Ok(self.recheck());
        }

        let binding = self.volumes.static_binding(&sp, index).await?;
        let Some(replica) = self.replicas.expand(&sp, index, binding.as_ref()).await? else {
            return Ok(self.recheck());
        };

        if self.replicas.is_creation_timed_out(&sp, index).await? {
            if index < len {
                let edit = self.replicas.abandon(&mut sp, index).await?;
                self.persist(&sp, edit).await?;
            } else {
                self.replicas
                    .delete(&sp, index, &Default::default())
                    .await?;
                self.claims.delete(&sp, index, &Default::default()).await?;
            }
            return Ok(self.recheck());
        }

        let Some(claim) = self.claims.expand(&sp, index, binding.as_ref()).await? else {
            return Ok(self.recheck());
        };

        if sp.status_mut().set(index, replica, claim)? {
            info!(ordinal = index, "Tracking ordinal");
            self.persist(&sp, StatusEdit::Set(index)).await?;
        }
        Ok(self.recheck())
    }

    /// Removes the highest ordinal: replica first, then its claim, then the
    /// status entries.
    async fn shrink(&self, mut sp: StatefulPod, tracked: usize) -> Result<Outcome> {
        let index = tracked - 1;
        if !self.replicas.shrink(&sp, index).await? {
            debug!(ordinal = index, "Waiting for replica removal");
            return Ok(self.recheck());
        }
        if !self.claims.shrink(&sp, index).await? {
            debug!(ordinal = index, "Waiting for claim removal");
            return Ok(self.recheck());
        }

        sp.status_mut().truncate(index);
        self.persist(&sp, StatusEdit::Truncate(index)).await?;
        info!(ordinal = index, "Scaled down");
        Ok(self.recheck())
    }

    async fn maintain(&self, sp: StatefulPod) -> Result<Outcome> {
        if let Some(index) = self.replicas.maintain_scan(&sp).await? {
            info!(ordinal = index, "Replica missing, re-creating");
            return self.expand(sp, index).await;
        }

        let healing = sp.tracked().iter().any(|s| {
            matches!(
                s.status,
                ReplicaCondition::Deleting | ReplicaCondition::CreateTimeout
            )
        });
        if healing {
            return Ok(self.recheck());
        }
        debug!("Converged");
        Ok(Outcome::Converged)
    }

    /// Deletion path: retain volumes, remove replicas, remove claims, release
    /// volumes and the endpoint.
    async fn teardown(&self, mut sp: StatefulPod) -> Result<Outcome> {
        let progress = self.volumes.set_retain_all(&mut sp).await?;
        let edited = sp.status.clone().unwrap_or_default();
        for (n, index) in progress.updated.iter().enumerate() {
            let mut stored = self.persist(&sp, StatusEdit::Set(*index)).await?;
            for pending in &progress.updated[n + 1..] {
                StatusEdit::Set(*pending).replay(&edited, stored.status_mut())?;
            }
            sp = stored;
        }
        if !progress.complete {
            return Ok(self.recheck());
        }

        if !self.replicas.delete_all(&sp).await? {
            debug!("Waiting for replicas to terminate");
            return Ok(self.recheck());
        }
        if !self.claims.delete_all(&sp).await? {
            debug!("Waiting for claims to terminate");
            return Ok(self.recheck());
        }
        if !self.volumes.set_available_all(&sp).await? {
            debug!("Waiting for volumes to become available");
            return Ok(self.recheck());
        }

        if sp.spec.service_template.is_some() {
            self.endpoints.remove_protective_marker(&sp).await?;
        }
        record_event(
            self.store.as_ref(),
            &sp,
            WorkloadEvent::normal("Deleted", "Finalizing", "All replicas and claims removed"),
        )
        .await;
        info!("Teardown complete");
        Ok(Outcome::Converged)
    }

    /// Adds or removes the workload finalizer on the latest stored copy.
    /// Returns `None` once the workload is gone.
    async fn set_finalizer(&self, key: &ObjectKey, present: bool) -> Result<Option<StatefulPod>> {
        let Some(mut sp) = self.fetch(key).await? else {
            return Ok(None);
        };
        if sp.has_finalizer() == present {
            return Ok(Some(sp));
        }
        if present {
            sp.finalizers_mut().push(STATEFULPOD_FINALIZER.to_string());
        } else {
            sp.finalizers_mut().retain(|f| f != STATEFULPOD_FINALIZER);
        }
        let stored = self.store.replace(&sp).await?;
        debug!(present, "Updated workload finalizer");
        Ok(Some(stored))
    }
}
