use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::store::ResourceStore;

/// Answers whether a node is healthy enough to keep replicas on it.
pub struct NodeOracle<S> {
    store: Arc<S>,
    grace: Duration,
}

impl<S> Clone for NodeOracle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            grace: self.grace,
        }
    }
}

impl<S: ResourceStore> NodeOracle<S> {
    pub fn new(store: Arc<S>, grace: Duration) -> Self {
        Self { store, grace }
    }

    /// An unscheduled replica (empty node name) is never a failure. A node that
    /// cannot be read counts as unhealthy. A not-ready node only counts once it
    /// has stayed that way for the grace period.
    pub async fn is_ready(&self, node_name: &str) -> bool {
        if node_name.is_empty() {
            return true;
        }

        let node = match self.store.get::<Node>(None, node_name).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                warn!(node = %node_name, "Node not found, treating as unhealthy");
                return false;
            }
            Err(e) => {
                warn!(node = %node_name, "Failed to read node, treating as unhealthy: {}", e);
                return false;
            }
        };

        let conditions = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default();
        let Some(condition) = conditions
            .iter()
            .find(|c| c.type_ == "Ready")
            .or_else(|| conditions.last())
        else {
            return true;
        };

        if condition.status == "True" {
            return true;
        }

        let Some(since) = condition.last_transition_time.as_ref() else {
            warn!(node = %node_name, "Node not ready with no transition time");
            return false;
        };
        let elapsed = (Utc::now() - since.0).to_std().unwrap_or_default();
        if elapsed >= self.grace {
            warn!(
                node = %node_name,
                elapsed_secs = elapsed.as_secs(),
                "Node not ready beyond grace period"
            );
            false
        } else {
            debug!(node = %node_name, elapsed_secs = elapsed.as_secs(), "Node not ready, within grace period");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn node(name: &str, status: &str, since_secs: i64) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![
                    NodeCondition {
                        type_: "Ready".to_string(),
                        status: status.to_string(),
                        last_transition_time: Some(Time(
                            Utc::now() - chrono::Duration::seconds(since_secs),
                        )),
                        ..Default::default()
                    },
                    NodeCondition {
                        type_: "MemoryPressure".to_string(),
                        status: "False".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn oracle(nodes: Vec<Node>) -> NodeOracle<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for n in nodes {
            store.insert(n).await.unwrap();
        }
        NodeOracle::new(store, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_unscheduled_replica_is_healthy() {
        assert!(oracle(vec![]).await.is_ready("").await);
    }

    #[tokio::test]
    async fn test_missing_node_is_unhealthy() {
        assert!(!oracle(vec![]).await.is_ready("node-a").await);
    }

    #[tokio::test]
    async fn test_not_ready_node_is_debounced() {
        let oracle = oracle(vec![
            node("ready", "True", 3600),
            node("flapping", "False", 10),
            node("lost", "Unknown", 120),
        ])
        .await;

        assert!(oracle.is_ready("ready").await);
        assert!(oracle.is_ready("flapping").await);
        assert!(!oracle.is_ready("lost").await);
    }

    #[tokio::test]
    async fn test_node_without_conditions_is_healthy() {
        let bare = Node {
            metadata: ObjectMeta {
                name: Some("bare".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(oracle(vec![bare]).await.is_ready("bare").await);
    }
}
