//! Optimistic status persistence.
//!
//! A pass edits its local copy of the workload and then describes the edit as
//! a [`StatusEdit`]. When the write loses a race, only that edit is replayed on
//! the freshly fetched object, so entries of other ordinals written
//! concurrently survive.

use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::crd::{StatefulPod, StatefulPodStatus};
use crate::error::{Error, Result};
use crate::store::ResourceStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusEdit {
    /// Overwrite, or append, both entries of one ordinal.
    Set(usize),
    /// Drop every ordinal at or above the given length.
    Truncate(usize),
}

impl StatusEdit {
    /// Re-applies this edit, taking the entries from `source`.
    pub fn replay(&self, source: &StatefulPodStatus, target: &mut StatefulPodStatus) -> Result<()> {
        match *self {
            StatusEdit::Set(index) => {
                let (Some(replica), Some(claim)) = (
                    source.pod_status.get(index),
                    source.pvc_status.get(index),
                ) else {
                    return Err(Error::IndexOutOfRange {
                        index,
                        len: source.len(),
                    });
                };
                target.set(index, replica.clone(), claim.clone())?;
            }
            StatusEdit::Truncate(len) => {
                target.check_aligned()?;
                target.truncate(len);
            }
        }
        Ok(())
    }
}

pub struct StatusWriter<S> {
    store: Arc<S>,
    max_attempts: u32,
}

impl<S: ResourceStore> StatusWriter<S> {
    pub fn new(store: Arc<S>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Writes `local`'s status, which already carries `edit`, and returns the
    /// stored object.
    pub async fn persist(&self, local: &StatefulPod, edit: StatusEdit) -> Result<StatefulPod> {
        let name = local.name_any();
        let namespace = local.namespace();
        let source = local.status.clone().unwrap_or_default();
        let mut candidate = local.clone();

        for attempt in 1..=self.max_attempts {
            match self.store.replace_status(&candidate).await {
                Ok(stored) => {
                    debug!(workload = %name, ?edit, attempt, "Persisted status");
                    return Ok(stored);
                }
                Err(e) if e.is_conflict() => {
                    debug!(workload = %name, ?edit, attempt, "Status write conflicted, replaying on latest");
                    let latest: StatefulPod = self
                        .store
                        .get(namespace.as_deref(), &name)
                        .await?
                        .ok_or_else(|| Error::not_found("StatefulPod", &name))?;
                    candidate = latest;
                    edit.replay(&source, candidate.status_mut())?;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            workload = %name,
            ?edit,
            attempts = self.max_attempts,
            "Giving up on status write for this pass"
        );
        Err(Error::conflict("StatefulPod", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ReplicaCondition, ReplicaStatus, StorageStatus};

    fn status(len: usize) -> StatefulPodStatus {
        let mut status = StatefulPodStatus::default();
        for i in 0..len {
            status.pod_status.push(ReplicaStatus::preparing(format!("web{}", i), i));
            status.pvc_status.push(StorageStatus::none(i));
        }
        status
    }

    #[test]
    fn test_replay_set_touches_only_its_ordinal() {
        let mut source = status(3);
        source.pod_status[1].status = ReplicaCondition::Running;

        let mut target = status(3);
        target.pod_status[2].status = ReplicaCondition::Deleting;

        StatusEdit::Set(1).replay(&source, &mut target).unwrap();
        assert_eq!(target.pod_status[1].status, ReplicaCondition::Running);
        assert_eq!(target.pod_status[2].status, ReplicaCondition::Deleting);
    }

    #[test]
    fn test_replay_set_appends_next_ordinal() {
        let source = status(2);
        let mut target = status(1);
        StatusEdit::Set(1).replay(&source, &mut target).unwrap();
        assert_eq!(target.len(), 2);
    }

    #[test]
    fn test_replay_rejects_gap() {
        let source = status(3);
        let mut target = status(1);
        let err = StatusEdit::Set(2).replay(&source, &mut target).unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_replay_truncate() {
        let mut target = status(4);
        StatusEdit::Truncate(2)
            .replay(&StatefulPodStatus::default(), &mut target)
            .unwrap();
        assert_eq!(target.len(), 2);
        assert!(target.is_aligned());
    }
}
