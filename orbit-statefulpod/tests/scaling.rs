mod common;

use common::*;
use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec, PersistentVolumeStatus, Pod,
    ServiceSpec, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;

use orbit_statefulpod::crd::{
    ClaimCondition, ReplicaCondition, ReplicaStatus, StatefulPodStatus, ENDPOINT_FINALIZER,
    NONE_CLAIM, PROVISION_ON_NODE_ANNOTATION,
};
use orbit_statefulpod::store::{Operation, ResourceStore, Verb};
use orbit_statefulpod::Outcome;

fn created(ops: &[Operation], kind: &str) -> Vec<String> {
    ops.iter()
        .filter(|op| op.verb == Verb::Create && op.kind == kind)
        .map(|op| op.name.clone())
        .collect()
}

#[tokio::test]
async fn test_scale_up_without_storage() {
    let h = Harness::new().await;
    h.apply(workload("web", 0)).await;
    assert_eq!(h.reconcile("web").await, Outcome::Converged);

    h.resize("web", 3).await;
    let gaps = h.converge("web").await;

    let status = h.workload("web").await.status.unwrap();
    assert_eq!(status.len(), 3);
    assert!(status.is_aligned());
    for (i, replica) in status.pod_status.iter().enumerate() {
        assert_eq!(replica.index, i);
        assert_eq!(replica.pod_name, format!("web{}", i));
        assert_eq!(replica.status, ReplicaCondition::Running);
        assert_eq!(replica.node_name, NODE);
    }
    for claim in &status.pvc_status {
        assert_eq!(claim.pvc_name, NONE_CLAIM);
        assert!(claim.status.is_none());
    }

    let ops = h.store.operations().await;
    assert_eq!(created(&ops, "Pod"), vec!["web0", "web1", "web2"]);
    assert!(created(&ops, "PersistentVolumeClaim").is_empty());

    // Never moves away from the desired size, and settles on it.
    assert!(gaps.windows(2).all(|w| w[1] <= w[0]));
    assert_eq!(gaps.last(), Some(&0));
}

#[tokio::test]
async fn test_converged_workload_is_left_alone() {
    let h = Harness::new().await;
    h.apply(workload("web", 2)).await;
    h.converge("web").await;

    let writes = h.store.operations().await.len();
    assert_eq!(h.reconcile("web").await, Outcome::Converged);
    assert_eq!(h.reconcile("web").await, Outcome::Converged);
    assert_eq!(h.store.operations().await.len(), writes);
}

#[tokio::test]
async fn test_scale_up_with_storage_claims() {
    let h = Harness::new().await;
    h.apply(with_claims(workload("db", 3))).await;
    h.converge("db").await;
    let before = h.store.operations().await.len();

    h.resize("db", 5).await;
    h.converge("db").await;

    let ops = h.store.operations().await;
    assert_eq!(
        created(&ops[before..], "PersistentVolumeClaim"),
        vec!["data-db-3", "data-db-4"]
    );

    let sp = h.workload("db").await;
    assert_eq!(sp.tracked().len(), 5);
    for index in [3, 4] {
        let claim = &sp.tracked_claims()[index];
        assert_eq!(claim.pvc_name, format!("data-db-{}", index));
        assert_eq!(claim.status, Some(ClaimCondition::Bound));
        assert_eq!(claim.capacity, "10Gi");
        assert_eq!(claim.pv_name, format!("pv-data-db-{}", index));
        assert_eq!(claim.storage_class, "fast");
    }

    let pod = h.pod("db4").await.unwrap();
    let volumes = pod.spec.unwrap().volumes.unwrap();
    assert_eq!(
        volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
        "data-db-4"
    );
}

#[tokio::test]
async fn test_scale_down_removes_highest_ordinal_first() {
    let h = Harness::graceful().await;
    h.apply(with_claims(workload("db", 5))).await;
    h.converge("db").await;
    let before = h.store.operations().await.len();

    h.resize("db", 2).await;

    // The claim is left alone until the replica is confirmed gone.
    assert!(matches!(h.reconcile("db").await, Outcome::RecheckAfter(_)));
    assert!(h.pod("db4").await.unwrap().metadata.deletion_timestamp.is_some());
    assert!(h.claim("data-db-4").await.unwrap().metadata.deletion_timestamp.is_none());
    assert!(matches!(h.reconcile("db").await, Outcome::RecheckAfter(_)));
    assert!(h.claim("data-db-4").await.unwrap().metadata.deletion_timestamp.is_none());

    h.store.complete_terminations::<Pod>().await;
    h.reconcile("db").await;
    assert!(h.claim("data-db-4").await.unwrap().metadata.deletion_timestamp.is_some());
    assert_eq!(h.workload("db").await.tracked().len(), 5);

    h.store.complete_terminations::<PersistentVolumeClaim>().await;
    h.reconcile("db").await;
    assert_eq!(h.workload("db").await.tracked().len(), 4);

    let mut converged = false;
    for _ in 0..32 {
        if h.reconcile("db").await == Outcome::Converged {
            converged = true;
            break;
        }
        h.store.complete_terminations::<Pod>().await;
        h.store.complete_terminations::<PersistentVolumeClaim>().await;
    }
    assert!(converged);

    let deletes: Vec<(String, String)> = h.store.operations().await[before..]
        .iter()
        .filter(|op| op.verb == Verb::Delete)
        .map(|op| (op.kind.clone(), op.name.clone()))
        .collect();
    let expected: Vec<(String, String)> = [
        ("Pod", "db4"),
        ("PersistentVolumeClaim", "data-db-4"),
        ("Pod", "db3"),
        ("PersistentVolumeClaim", "data-db-3"),
        ("Pod", "db2"),
        ("PersistentVolumeClaim", "data-db-2"),
    ]
    .iter()
    .map(|(kind, name)| (kind.to_string(), name.to_string()))
    .collect();
    assert_eq!(deletes, expected);

    let status = h.workload("db").await.status.unwrap();
    assert_eq!(status.len(), 2);
    assert!(status.is_aligned());
    assert!(h.pod("db1").await.is_some());
    assert!(h.pod("db2").await.is_none());
}

#[tokio::test]
async fn test_scale_down_removes_tail_still_in_flight() {
    let h = Harness::new().await;
    h.apply(with_claims(workload("db", 2))).await;
    h.reconcile("db").await;
    h.run_replica("db0", NODE).await;
    h.bind("data-db-0").await;
    h.reconcile("db").await;

    let status = h.workload("db").await.status.unwrap();
    assert_eq!(status.len(), 2);
    assert!(status.tail_in_flight());

    h.resize("db", 1).await;
    let mut converged = false;
    for _ in 0..8 {
        if h.reconcile("db").await == Outcome::Converged {
            converged = true;
            break;
        }
    }
    assert!(converged);

    let status = h.workload("db").await.status.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status.pod_status[0].status, ReplicaCondition::Running);
    assert!(h.pod("db0").await.is_some());
    assert!(h.claim("data-db-0").await.is_some());
    assert!(h.pod("db1").await.is_none());
    assert!(h.claim("data-db-1").await.is_none());
}

#[tokio::test]
async fn test_repeated_expand_is_idempotent() {
    let h = Harness::new().await;
    h.apply(with_claims(workload("web", 1))).await;

    assert!(matches!(h.reconcile("web").await, Outcome::RecheckAfter(_)));
    let first = h.workload("web").await.status.unwrap();
    assert!(matches!(h.reconcile("web").await, Outcome::RecheckAfter(_)));
    let second = h.workload("web").await.status.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert_eq!(first.pod_status[0].status, ReplicaCondition::Preparing);
    assert_eq!(first.pvc_status[0].status, Some(ClaimCondition::Pending));
    assert_eq!(h.store.list::<Pod>(Some(NS)).await.unwrap().len(), 1);
    assert_eq!(
        h.store
            .list::<PersistentVolumeClaim>(Some(NS))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_endpoint_precedes_first_replica() {
    let h = Harness::new().await;
    let mut sp = workload("web", 1);
    sp.spec.service_template = Some(ServiceSpec {
        cluster_ip: Some("None".to_string()),
        selector: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
        ..Default::default()
    });
    h.apply(sp).await;

    assert!(matches!(h.reconcile("web").await, Outcome::RecheckAfter(_)));
    assert!(h.pod("web0").await.is_none());
    let service: Service = h.store.get(Some(NS), "web-service").await.unwrap().unwrap();
    assert!(service.finalizers().is_empty());

    h.reconcile("web").await;
    let service: Service = h.store.get(Some(NS), "web-service").await.unwrap().unwrap();
    assert_eq!(service.finalizers(), &[ENDPOINT_FINALIZER.to_string()]);

    let pod = h.pod("web0").await.unwrap();
    assert_eq!(pod.labels()["app"], "web");
    let spec = pod.spec.unwrap();
    assert_eq!(spec.hostname.as_deref(), Some("web0"));
    assert_eq!(spec.subdomain.as_deref(), Some("web-service"));
}

#[tokio::test]
async fn test_static_volume_pins_claim_and_replica() {
    let h = Harness::new().await;
    h.store
        .insert(PersistentVolume {
            metadata: ObjectMeta {
                name: Some("local-0".to_string()),
                annotations: Some(BTreeMap::from([(
                    PROVISION_ON_NODE_ANNOTATION.to_string(),
                    NODE.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec::default()),
            status: Some(PersistentVolumeStatus {
                phase: Some("Available".to_string()),
                ..Default::default()
            }),
        })
        .await
        .unwrap();

    let mut sp = with_claims(workload("db", 1));
    sp.spec.pv_names = vec!["local-0".to_string()];
    h.apply(sp).await;
    h.reconcile("db").await;

    let claim = h.claim("data-db-0").await.unwrap().spec.unwrap();
    assert_eq!(claim.volume_name.as_deref(), Some("local-0"));
    assert_eq!(claim.storage_class_name.as_deref(), Some(""));

    let affinity = h
        .pod("db0")
        .await
        .unwrap()
        .spec
        .unwrap()
        .affinity
        .unwrap()
        .node_affinity
        .unwrap()
        .required_during_scheduling_ignored_during_execution
        .unwrap();
    let requirement = &affinity.node_selector_terms[0]
        .match_expressions
        .as_ref()
        .unwrap()[0];
    assert_eq!(requirement.key, "kubernetes.io/hostname");
    assert_eq!(requirement.values.as_deref(), Some(&[NODE.to_string()][..]));
}

#[tokio::test]
async fn test_misaligned_status_is_reported() {
    let h = Harness::new().await;
    let mut sp = workload("web", 2);
    sp.status = Some(StatefulPodStatus {
        pod_status: vec![ReplicaStatus::preparing("web0", 0)],
        pvc_status: vec![],
    });
    h.apply(sp).await;

    let err = h.reconciler.reconcile(&key("web")).await.unwrap_err();
    assert!(err.is_structural());
    assert!(h.pod("web0").await.is_none());
}
