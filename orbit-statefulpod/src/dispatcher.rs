//! Change notifications and the controller that turns them into
//! reconciliation passes.

use dashmap::DashMap;
use futures::{future, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as Finalizer};
use kube::runtime::reflector::{self, reflector, ObjectRef};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{
    ClaimCondition, ReplicaCondition, StatefulPod, GROUP_VERSION, INDEX_ANNOTATION,
    PARENT_NAME_ANNOTATION, STATEFULPOD_FINALIZER,
};
use crate::error::{Error, Result};
use crate::reconciler::{Outcome, Reconciler};
use crate::store::KubeStore;

/// Namespace and name of a workload.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Replica {
        workload: ObjectKey,
        name: String,
        index: usize,
    },
    StorageClaim {
        workload: ObjectKey,
        name: String,
        index: usize,
    },
}

/// Workload key and ordinal of an object created for a workload.
fn owner_of(meta: &ObjectMeta) -> Option<(ObjectKey, usize)> {
    let annotations = meta.annotations.as_ref()?;
    if annotations.get(GROUP_VERSION).map(String::as_str) != Some("true") {
        return None;
    }
    let parent = annotations.get(PARENT_NAME_ANNOTATION)?;
    let index = annotations.get(INDEX_ANNOTATION)?.parse().ok()?;
    let namespace = meta.namespace.clone().unwrap_or_default();
    Some((ObjectKey::new(namespace, parent), index))
}

impl Notification {
    pub fn workload(&self) -> &ObjectKey {
        match self {
            Notification::Replica { workload, .. } | Notification::StorageClaim { workload, .. } => {
                workload
            }
        }
    }

    pub fn from_replica(pod: &Pod) -> Option<Self> {
        let (workload, index) = owner_of(&pod.metadata)?;
        Some(Notification::Replica {
            workload,
            name: pod.name_any(),
            index,
        })
    }

    pub fn from_claim(claim: &PersistentVolumeClaim) -> Option<Self> {
        let (workload, index) = owner_of(&claim.metadata)?;
        Some(Notification::StorageClaim {
            workload,
            name: claim.name_any(),
            index,
        })
    }
}

/// Drops workload updates that only echo our own status writes while the
/// newest ordinal is still being created.
#[derive(Default)]
pub struct UpdateFilter {
    templates: DashMap<ObjectKey, Option<PodSpec>>,
}

impl UpdateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `sp` and returns whether it warrants a reconciliation pass.
    pub fn admit(&self, sp: &StatefulPod) -> bool {
        let key = ObjectKey::new(sp.namespace().unwrap_or_default(), sp.name_any());
        let template = sp.spec.pod_template.clone();
        let previous = self.templates.insert(key, template.clone());

        let Some(previous) = previous else {
            return true;
        };
        if sp.is_terminating() || previous != template {
            return true;
        }

        let creating = sp.tracked().last().map(|s| s.status) == Some(ReplicaCondition::Preparing)
            && sp.tracked_claims().last().and_then(|s| s.status) == Some(ClaimCondition::Pending);
        !creating
    }

    pub fn forget(&self, key: &ObjectKey) {
        self.templates.remove(key);
    }
}

/// Drives the StatefulPod controller. Workload changes, and changes to the
/// replicas and claims created for a workload, trigger a pass of that
/// workload; the controller runs at most one pass per workload at a time.
pub struct Dispatcher {
    client: Client,
    reconciler: Reconciler<KubeStore>,
    config: Arc<OperatorConfig>,
    filter: UpdateFilter,
}

fn workload_ref(key: &ObjectKey) -> ObjectRef<StatefulPod> {
    ObjectRef::new(&key.name).within(&key.namespace)
}

/// Follow-up for a pass that finished.
fn next_action(outcome: Outcome, config: &OperatorConfig) -> Action {
    match outcome {
        Outcome::Converged => Action::requeue(config.resync()),
        Outcome::RecheckAfter(delay) => Action::requeue(delay),
        Outcome::Removed => Action::await_change(),
    }
}

/// Follow-up for a pass that failed.
fn backoff(workload: &str, error: &FinalizerError<Error>, config: &OperatorConfig) -> Action {
    match error {
        FinalizerError::CleanupFailed(Error::TeardownPending { retry_after }) => {
            debug!(workload, "Teardown in progress");
            Action::requeue(*retry_after)
        }
        FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) if e.is_structural() => {
            Action::await_change()
        }
        other => {
            warn!(workload, "Reconciliation failed, backing off: {}", other);
            Action::requeue(config.error_backoff())
        }
    }
}

async fn apply(sp: Arc<StatefulPod>, ctx: &Dispatcher) -> Result<Action> {
    let outcome = ctx.reconciler.apply(&sp).await?;
    Ok(next_action(outcome, &ctx.config))
}

async fn cleanup(sp: Arc<StatefulPod>, ctx: &Dispatcher) -> Result<Action> {
    match ctx.reconciler.cleanup(&sp).await? {
        Outcome::RecheckAfter(retry_after) => Err(Error::TeardownPending { retry_after }),
        _ => {
            ctx.filter
                .forget(&ObjectKey::new(sp.namespace().unwrap_or_default(), sp.name_any()));
            Ok(Action::await_change())
        }
    }
}

async fn reconcile(
    sp: Arc<StatefulPod>,
    ctx: Arc<Dispatcher>,
) -> std::result::Result<Action, FinalizerError<Error>> {
    let namespace = sp.namespace().unwrap_or_default();
    let workloads: Api<StatefulPod> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&workloads, STATEFULPOD_FINALIZER, sp, |event| async {
        match event {
            Finalizer::Apply(sp) => apply(sp, &ctx).await,
            Finalizer::Cleanup(sp) => cleanup(sp, &ctx).await,
        }
    })
    .await
}

fn error_policy(sp: Arc<StatefulPod>, error: &FinalizerError<Error>, ctx: Arc<Dispatcher>) -> Action {
    backoff(&sp.name_any(), error, &ctx.config)
}

impl Dispatcher {
    pub fn new(client: Client, reconciler: Reconciler<KubeStore>, config: Arc<OperatorConfig>) -> Self {
        Self {
            client,
            reconciler,
            config,
            filter: UpdateFilter::new(),
        }
    }

    /// Watches workloads, replicas and claims and reconciles until the
    /// watches end or a shutdown signal arrives.
    pub async fn run(self, namespace: Option<String>) {
        let (workloads, pods, claims): (
            Api<StatefulPod>,
            Api<Pod>,
            Api<PersistentVolumeClaim>,
        ) = match namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(self.client.clone(), ns),
                Api::namespaced(self.client.clone(), ns),
                Api::namespaced(self.client.clone(), ns),
            ),
            None => (
                Api::all(self.client.clone()),
                Api::all(self.client.clone()),
                Api::all(self.client.clone()),
            ),
        };
        let concurrency = u16::try_from(self.config.reconcile.concurrency).unwrap_or(u16::MAX);
        let context = Arc::new(self);

        // Workload changes pass the update filter before they trigger a pass.
        let (reader, writer) = reflector::store();
        let admitting = Arc::clone(&context);
        let triggers = reflector(writer, watcher(workloads, watcher::Config::default()))
            .default_backoff()
            .touched_objects()
            .try_filter(move |sp| {
                let admitted = admitting.filter.admit(sp);
                if !admitted {
                    debug!(workload = %sp.name_any(), "Suppressed status echo");
                }
                future::ready(admitted)
            });

        info!(concurrency, "Starting StatefulPod controller");
        Controller::for_stream(triggers, reader)
            .with_config(controller::Config::default().concurrency(concurrency))
            .watches(pods, watcher::Config::default(), |pod: Pod| {
                Notification::from_replica(&pod).map(|n| workload_ref(n.workload()))
            })
            .watches(claims, watcher::Config::default(), |claim: PersistentVolumeClaim| {
                Notification::from_claim(&claim).map(|n| workload_ref(n.workload()))
            })
            .shutdown_on_signal()
            .run(reconcile, error_policy, context)
            .for_each(|result| {
                match result {
                    Ok((workload, _)) => debug!(workload = %workload.name, "Reconciled"),
                    Err(e) => debug!("Reconcile trigger failed: {}", e),
                }
                future::ready(())
            })
            .await;
        warn!("StatefulPod controller stopped");
    }
}
