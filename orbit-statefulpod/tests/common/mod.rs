#![allow(dead_code)]

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, Node, NodeCondition, NodeStatus, ObjectReference, PersistentVolume,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
    PersistentVolumeSpec, PersistentVolumeStatus, Pod, PodCondition, PodSpec, PodStatus,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;

use orbit_statefulpod::config::OperatorConfig;
use orbit_statefulpod::controllers::replica::is_running_ready;
use orbit_statefulpod::controllers::{NodeOracle, ReplicaController};
use orbit_statefulpod::crd::{
    ClaimCondition, ReclaimPolicy, ReplicaCondition, StatefulPod, StatefulPodSpec,
};
use orbit_statefulpod::dispatcher::{Notification, ObjectKey};
use orbit_statefulpod::store::{MemoryStore, ResourceStore};
use orbit_statefulpod::{Outcome, Reconciler};

pub const NS: &str = "default";
pub const NODE: &str = "node-a";

pub fn workload(name: &str, size: i32) -> StatefulPod {
    let mut sp = StatefulPod::new(
        name,
        StatefulPodSpec {
            size,
            selector: None,
            pv_recycle_policy: ReclaimPolicy::Delete,
            service_template: None,
            pod_template: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    image: Some("nginx:1.27".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            pvc_template: None,
            pv_names: vec![],
        },
    );
    sp.metadata.namespace = Some(NS.to_string());
    sp
}

pub fn claim_template() -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
        storage_class_name: Some("fast".to_string()),
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity("10Gi".to_string()),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn with_claims(mut sp: StatefulPod) -> StatefulPod {
    sp.spec.pvc_template = Some(claim_template());
    sp
}

pub fn node(name: &str, ready: bool, since: DateTime<Utc>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                last_transition_time: Some(Time(since)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NS, name)
}

/// A reconciler wired to an in-memory cluster with one healthy node.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub config: Arc<OperatorConfig>,
    pub reconciler: Reconciler<MemoryStore>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_store(MemoryStore::new()).await
    }

    /// Deletions leave objects terminating until completed explicitly.
    pub async fn graceful() -> Self {
        Self::with_store(MemoryStore::graceful()).await
    }

    async fn with_store(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        store.insert(node(NODE, true, Utc::now())).await.unwrap();
        let config = Arc::new(OperatorConfig::default());
        let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&config));
        Self {
            store,
            config,
            reconciler,
        }
    }

    pub fn replicas(&self) -> ReplicaController<MemoryStore> {
        ReplicaController::new(
            Arc::clone(&self.store),
            NodeOracle::new(Arc::clone(&self.store), self.config.node_grace()),
            self.config.creation_timeout(),
        )
    }

    pub async fn apply(&self, sp: StatefulPod) -> StatefulPod {
        self.store.insert(sp).await.unwrap()
    }

    pub async fn workload(&self, name: &str) -> StatefulPod {
        self.store
            .get(Some(NS), name)
            .await
            .unwrap()
            .expect("workload exists")
    }

    pub async fn pod(&self, name: &str) -> Option<Pod> {
        self.store.get(Some(NS), name).await.unwrap()
    }

    pub async fn claim(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.store.get(Some(NS), name).await.unwrap()
    }

    pub async fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.store.get(None, name).await.unwrap()
    }

    pub async fn reconcile(&self, name: &str) -> Outcome {
        self.reconciler.reconcile(&key(name)).await.unwrap()
    }

    /// Runs the pass a change notification would trigger.
    pub async fn handle(&self, notification: Notification) -> Outcome {
        self.reconciler
            .reconcile(notification.workload())
            .await
            .unwrap()
    }

    pub async fn resize(&self, name: &str, size: i32) {
        self.store
            .mutate::<StatefulPod, _>(Some(NS), name, |sp| sp.spec.size = size)
            .await
            .unwrap();
    }

    /// Acts as the kubelet: the replica is scheduled on `node` and ready.
    pub async fn run_replica(&self, pod_name: &str, node: &str) {
        let node = node.to_string();
        self.store
            .mutate::<Pod, _>(Some(NS), pod_name, move |pod| {
                pod.spec.get_or_insert_with(Default::default).node_name = Some(node);
                pod.status = Some(PodStatus {
                    phase: Some("Running".to_string()),
                    conditions: Some(vec![PodCondition {
                        type_: "Ready".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                });
            })
            .await
            .unwrap();
    }

    /// Acts as the volume binder: provisions `pv-<claim>` and binds the claim
    /// to it.
    pub async fn bind(&self, claim_name: &str) -> String {
        let pv_name = format!("pv-{}", claim_name);
        self.store
            .insert(PersistentVolume {
                metadata: ObjectMeta {
                    name: Some(pv_name.clone()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeSpec {
                    persistent_volume_reclaim_policy: Some("Delete".to_string()),
                    storage_class_name: Some("fast".to_string()),
                    claim_ref: Some(ObjectReference {
                        name: Some(claim_name.to_string()),
                        namespace: Some(NS.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                status: Some(PersistentVolumeStatus {
                    phase: Some("Bound".to_string()),
                    ..Default::default()
                }),
            })
            .await
            .unwrap();

        let volume = pv_name.clone();
        self.store
            .mutate::<PersistentVolumeClaim, _>(Some(NS), claim_name, move |claim| {
                claim.spec.get_or_insert_with(Default::default).volume_name = Some(volume);
                claim.status = Some(PersistentVolumeClaimStatus {
                    phase: Some("Bound".to_string()),
                    ..Default::default()
                });
            })
            .await
            .unwrap();
        pv_name
    }

    /// Lets the cluster catch up with the tracked workload: replicas being
    /// prepared start running and pending claims bind, each followed by the
    /// notification the watch would deliver.
    pub async fn progress(&self, name: &str) {
        let sp = self.workload(name).await;
        let workload = key(name);

        for (index, tracked) in sp.tracked().iter().enumerate() {
            if tracked.status != ReplicaCondition::Preparing {
                continue;
            }
            let Some(pod) = self.pod(&tracked.pod_name).await else {
                continue;
            };
            if pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            if !is_running_ready(&pod) {
                self.run_replica(&pod.name_any(), NODE).await;
            }
            self.handle(Notification::Replica {
                workload: workload.clone(),
                name: pod.name_any(),
                index,
            })
            .await;
        }

        for (index, tracked) in sp.tracked_claims().iter().enumerate() {
            if tracked.status != Some(ClaimCondition::Pending) {
                continue;
            }
            let Some(claim) = self.claim(&tracked.pvc_name).await else {
                continue;
            };
            let bound = claim.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound");
            if !bound {
                self.bind(&tracked.pvc_name).await;
            }
            self.handle(Notification::StorageClaim {
                workload: workload.clone(),
                name: tracked.pvc_name.clone(),
                index,
            })
            .await;
        }
    }

    /// Reconciles until the workload converges, returning the distance to the
    /// desired size observed before every pass.
    pub async fn converge(&self, name: &str) -> Vec<usize> {
        let mut gaps = Vec::new();
        for _ in 0..64 {
            let sp = self.workload(name).await;
            let tracked = sp.tracked().len();
            gaps.push(sp.desired_size().abs_diff(tracked));

            if self.reconcile(name).await == Outcome::Converged {
                return gaps;
            }
            self.progress(name).await;
        }
        panic!("workload {} did not converge", name);
    }
}
