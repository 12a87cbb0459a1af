//! The filter and bind decision endpoints
//!
//! `filter_nodes` prunes a candidate node list with a dry-run of the
//! planner; `bind_node` runs the plan for real, records the decision as pod
//! annotations and commits the consumption to the cache. Feasibility
//! failures surface to the orchestrator as `"will not fit"` per node; only
//! errors that prevent a decision at all become top-level errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use gas_common::labels::{CARD_ANNOTATION, TILE_ANNOTATION, TS_ANNOTATION};
use gas_common::resources::per_gpu_capacity;
use gas_common::{Error, ResourceMap, Result};

use crate::annotations::{card_annotation, tile_annotation};
use crate::cache::{CacheApi, PodPatcher};
use crate::planner::{container_requests, plan_pod, total_tile_request, NodeView};
use crate::policy::Policy;

/// Arguments of a filter request, as sent by the orchestrator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderArgs {
    /// The pod being scheduled
    #[serde(rename = "Pod", default)]
    pub pod: Option<Pod>,
    /// Candidate node names
    #[serde(rename = "NodeNames", default)]
    pub node_names: Option<Vec<String>>,
}

/// Result of a filter request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderFilterResult {
    /// Nodes that can host the pod
    #[serde(rename = "NodeNames", skip_serializing_if = "Option::is_none", default)]
    pub node_names: Option<Vec<String>>,
    /// Rejected nodes with the reason for each
    #[serde(rename = "FailedNodes", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub failed_nodes: BTreeMap<String, String>,
    /// Set when no decision could be made at all
    #[serde(rename = "Error", skip_serializing_if = "String::is_empty", default)]
    pub error: String,
}

/// Arguments of a bind request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderBindingArgs {
    /// Name of the pod to bind
    #[serde(rename = "PodName", default)]
    pub pod_name: String,
    /// Namespace of the pod
    #[serde(rename = "PodNamespace", default)]
    pub pod_namespace: String,
    /// UID of the pod
    #[serde(rename = "PodUID", default)]
    pub pod_uid: String,
    /// Node the orchestrator selected
    #[serde(rename = "Node", default)]
    pub node: String,
}

/// Result of a bind request; an empty error means success
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderBindingResult {
    /// Set when binding failed
    #[serde(rename = "Error", skip_serializing_if = "String::is_empty", default)]
    pub error: String,
}

/// Constructor parameters for the extender
#[derive(Debug, Clone)]
pub struct ExtenderConfig {
    /// Resource name (without the vendor prefix) to balance card selection
    /// by; empty disables balancing
    pub balanced_resource: String,
    /// Whether a pod that already carries a card assignment may be bound
    /// again (the new assignment overwrites the old)
    pub allow_duplicates: bool,
    /// Namespace this extender runs in; used when binding args omit the
    /// pod namespace
    pub own_namespace: String,
}

impl Default for ExtenderConfig {
    fn default() -> Self {
        Self {
            balanced_resource: String::new(),
            allow_duplicates: true,
            own_namespace: "default".to_string(),
        }
    }
}

/// The GPU-aware scheduling extender
pub struct GasExtender {
    cache: Arc<dyn CacheApi>,
    patcher: Arc<dyn PodPatcher>,
    config: ExtenderConfig,
}

impl GasExtender {
    /// Create an extender over the given cache and patcher
    pub fn new(
        cache: Arc<dyn CacheApi>,
        patcher: Arc<dyn PodPatcher>,
        config: ExtenderConfig,
    ) -> Self {
        Self {
            cache,
            patcher,
            config,
        }
    }

    /// Reduce a candidate node list to the nodes that can host the pod
    ///
    /// Nodes that cannot be fetched are dropped without a reason so the
    /// orchestrator retries them; infeasible nodes land in `failed_nodes`.
    pub async fn filter_nodes(&self, args: &ExtenderArgs) -> ExtenderFilterResult {
        let Some(node_names) = &args.node_names else {
            return ExtenderFilterResult {
                error: "no nodes to filter".to_string(),
                ..Default::default()
            };
        };
        let Some(pod) = &args.pod else {
            return ExtenderFilterResult {
                error: "no pod in filter request".to_string(),
                ..Default::default()
            };
        };

        let requests = match container_requests(pod) {
            Ok(requests) => requests,
            Err(e) => {
                return ExtenderFilterResult {
                    error: e.to_string(),
                    ..Default::default()
                };
            }
        };
        let want_tiles = total_tile_request(&requests) > 0;

        let mut feasible = Vec::new();
        let mut failed_nodes = BTreeMap::new();

        for name in node_names {
            match self.dry_run_node(name, pod, &requests, want_tiles).await {
                Ok(()) => feasible.push(name.clone()),
                Err(e) if e.is_feasibility() => {
                    debug!(node = %name, "node rejected: {e}");
                    failed_nodes.insert(name.clone(), e.to_string());
                }
                Err(e) => {
                    // Dropped without a reason so the orchestrator retries
                    warn!(node = %name, error = %e, "skipping node");
                }
            }
        }

        ExtenderFilterResult {
            node_names: Some(feasible),
            failed_nodes,
            error: String::new(),
        }
    }

    /// Bind a pod to a node, picking its cards and tiles
    pub async fn bind_node(&self, args: &ExtenderBindingArgs) -> ExtenderBindingResult {
        match self.run_bind(args).await {
            Ok(()) => ExtenderBindingResult::default(),
            Err(e) => {
                warn!(
                    pod = %args.pod_name,
                    node = %args.node,
                    error = %e,
                    "bind failed"
                );
                ExtenderBindingResult {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn run_bind(&self, args: &ExtenderBindingArgs) -> Result<()> {
        let namespace = if args.pod_namespace.is_empty() {
            self.config.own_namespace.as_str()
        } else {
            args.pod_namespace.as_str()
        };

        let pod = self.cache.fetch_pod(namespace, &args.pod_name).await?;
        validate_pod_uid(&pod)?;

        if !self.config.allow_duplicates && has_card_annotation(&pod) {
            return Err(Error::invalid_pod(
                "pod already carries a card assignment",
            ));
        }

        let requests = container_requests(&pod)?;
        let want_tiles = total_tile_request(&requests) > 0;

        let node = self.cache.fetch_node(&args.node).await?;
        let view = self.node_view(&args.node, &node, &pod, want_tiles).await?;
        let plan = plan_pod(&requests, &view, &self.config.balanced_resource)?;

        let cards = card_annotation(&plan);
        let tiles = tile_annotation(&plan);

        let mut annotations = BTreeMap::new();
        annotations.insert(TS_ANNOTATION.to_string(), timestamp_annotation());
        annotations.insert(CARD_ANNOTATION.to_string(), cards.clone());
        if let Some(tiles) = &tiles {
            annotations.insert(TILE_ANNOTATION.to_string(), tiles.clone());
        }

        // Patch first, then charge: a failed patch must leave no charge,
        // while a failed charge still leaves a correctly-annotated pod.
        self.patcher
            .apply_pod_annotations(namespace, &args.pod_name, &pod, &annotations)
            .await?;
        self.cache
            .adjust_pod_resources(
                &pod,
                &args.node,
                &cards,
                tiles.as_deref().unwrap_or_default(),
                &plan.used_delta,
            )
            .await?;

        info!(
            pod = %args.pod_name,
            node = %args.node,
            cards = %cards,
            preferred = plan.preferred_used,
            "pod bound"
        );

        Ok(())
    }

    async fn dry_run_node(
        &self,
        node_name: &str,
        pod: &Pod,
        requests: &[ResourceMap],
        want_tiles: bool,
    ) -> Result<()> {
        let node = self.cache.fetch_node(node_name).await?;
        let view = self.node_view(node_name, &node, pod, want_tiles).await?;
        plan_pod(requests, &view, &self.config.balanced_resource)?;
        Ok(())
    }

    /// Assemble the planner's view of one node from cache snapshots
    async fn node_view(
        &self,
        node_name: &str,
        node: &Node,
        pod: &Pod,
        want_tiles: bool,
    ) -> Result<NodeView> {
        let empty_labels = BTreeMap::new();
        let empty_annotations = BTreeMap::new();
        let policy = Policy::decode(
            node.metadata.labels.as_ref().unwrap_or(&empty_labels),
            pod.metadata
                .annotations
                .as_ref()
                .unwrap_or(&empty_annotations),
        );

        let empty_allocatable = BTreeMap::new();
        let per_gpu = per_gpu_capacity(
            node.status
                .as_ref()
                .and_then(|status| status.allocatable.as_ref())
                .unwrap_or(&empty_allocatable),
            policy.cards.len() as u64,
        )?;

        let committed_resources = self.cache.get_node_resource_status(node_name).await?;
        let committed_tiles = if want_tiles {
            self.cache.get_node_tile_status(node_name).await?
        } else {
            Default::default()
        };

        Ok(NodeView {
            policy,
            per_gpu_capacity: per_gpu,
            committed_resources,
            committed_tiles,
        })
    }
}

/// A UID must parse as a UUID when present; pods created by test tooling
/// may legitimately carry none.
fn validate_pod_uid(pod: &Pod) -> Result<()> {
    if let Some(uid) = pod.metadata.uid.as_deref() {
        if !uid.is_empty() && Uuid::parse_str(uid).is_err() {
            return Err(Error::invalid_pod(format!("pod UID {uid} is not a UUID")));
        }
    }
    Ok(())
}

fn has_card_annotation(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .map(|annotations| annotations.contains_key(CARD_ANNOTATION))
        .unwrap_or(false)
}

/// Decimal nanoseconds since epoch; non-decreasing on any sane clock
fn timestamp_annotation() -> String {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_string()
}
