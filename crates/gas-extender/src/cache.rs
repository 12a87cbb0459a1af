//! The cache capability set and its Kubernetes implementation
//!
//! The planner consumes the cache through [`CacheApi`], an explicit
//! constructor dependency; tests substitute a mock without touching global
//! state. The production [`KubeCache`] reconstructs a node's committed
//! usage from the assignment annotations of the pods bound to it, merged
//! with a ledger of this extender's own recent binds that the API view has
//! not caught up with yet.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use gas_common::labels::{CARD_ANNOTATION, TILE_ANNOTATION, TILE_RESOURCE};
use gas_common::resources::{per_gpu_capacity, NodeResources, NodeTiles};
use gas_common::{Error, ResourceMap, Result};

use crate::annotations::{annotation_patch, parse_card_annotation, parse_tile_annotation};
use crate::planner::container_requests;
use crate::policy::Policy;

/// The capability set the placement core consumes
///
/// `adjust_pod_resources` is the lock-holding commit: it serializes
/// concurrent binds for one node behind a per-node mutex, rechecks capacity
/// under the lock and only then records the consumption.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CacheApi: Send + Sync {
    /// Fetch a node by name
    async fn fetch_node(&self, name: &str) -> Result<Node>;

    /// Fetch a pod by namespace and name
    async fn fetch_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Committed per-card resource usage on a node
    async fn get_node_resource_status(&self, node_name: &str) -> Result<NodeResources>;

    /// Committed in-use tile indices on a node
    async fn get_node_tile_status(&self, node_name: &str) -> Result<NodeTiles>;

    /// Commit a bind decision so subsequent cycles see it
    async fn adjust_pod_resources(
        &self,
        pod: &Pod,
        node_name: &str,
        cards: &str,
        tiles: &str,
        delta: &NodeResources,
    ) -> Result<()>;
}

/// Applies assignment annotations to a pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodPatcher: Send + Sync {
    /// Apply the given annotations to the pod as a JSON patch
    async fn apply_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        pod: &Pod,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// One committed bind the API view may not reflect yet
#[derive(Debug, Clone)]
struct LedgerEntry {
    node: String,
    resources: NodeResources,
    tiles: NodeTiles,
}

/// Production cache backed by the Kubernetes API
pub struct KubeCache {
    client: Client,
    node_locks: DashMap<String, Arc<Mutex<()>>>,
    ledger: RwLock<HashMap<String, LedgerEntry>>,
}

impl KubeCache {
    /// Create a cache over the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            node_locks: DashMap::new(),
            ledger: RwLock::new(HashMap::new()),
        }
    }

    fn node_lock(&self, node_name: &str) -> Arc<Mutex<()>> {
        self.node_locks
            .entry(node_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Usage view of one node: annotated pods plus unflushed ledger entries
    ///
    /// `exclude_uid` removes one pod from the view; the commit path uses it
    /// so a freshly-patched pod is not counted against its own recheck.
    async fn node_status(
        &self,
        node_name: &str,
        exclude_uid: Option<&str>,
    ) -> Result<(NodeResources, NodeTiles)> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let fields =
            format!("spec.nodeName={node_name},status.phase!=Failed,status.phase!=Succeeded");
        let list = pods
            .list(&ListParams::default().fields(&fields))
            .await
            .map_err(|e| Error::cache(format!("failed to list pods on {node_name}: {e}")))?;

        let mut resources = NodeResources::new();
        let mut tiles = NodeTiles::new();
        let mut listed: BTreeSet<String> = BTreeSet::new();

        for pod in &list.items {
            let uid = pod.metadata.uid.as_deref().unwrap_or_default();
            if !uid.is_empty() {
                listed.insert(uid.to_string());
            }
            if exclude_uid == Some(uid) {
                continue;
            }
            let (pod_resources, pod_tiles) = pod_committed_usage(pod);
            merge_resources(&mut resources, &pod_resources);
            merge_tiles(&mut tiles, &pod_tiles);
        }

        let mut ledger = self.ledger.write().await;
        // Pods now visible through the API carry their own annotations
        ledger.retain(|uid, entry| entry.node != node_name || !listed.contains(uid));
        for (uid, entry) in ledger.iter() {
            if entry.node == node_name && exclude_uid != Some(uid.as_str()) {
                merge_resources(&mut resources, &entry.resources);
                merge_tiles(&mut tiles, &entry.tiles);
            }
        }

        Ok((resources, tiles))
    }
}

#[async_trait]
impl CacheApi for KubeCache {
    async fn fetch_node(&self, name: &str) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.get(name).await?)
    }

    async fn fetch_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get(name).await?)
    }

    async fn get_node_resource_status(&self, node_name: &str) -> Result<NodeResources> {
        Ok(self.node_status(node_name, None).await?.0)
    }

    async fn get_node_tile_status(&self, node_name: &str) -> Result<NodeTiles> {
        Ok(self.node_status(node_name, None).await?.1)
    }

    async fn adjust_pod_resources(
        &self,
        pod: &Pod,
        node_name: &str,
        cards: &str,
        tiles: &str,
        delta: &NodeResources,
    ) -> Result<()> {
        let lock = self.node_lock(node_name);
        let _guard = lock.lock().await;

        let node = self.fetch_node(node_name).await?;
        let empty_labels = BTreeMap::new();
        let policy = Policy::decode(
            node.metadata.labels.as_ref().unwrap_or(&empty_labels),
            &BTreeMap::new(),
        );
        let empty_allocatable = BTreeMap::new();
        let capacity = per_gpu_capacity(
            node.status
                .as_ref()
                .and_then(|status| status.allocatable.as_ref())
                .unwrap_or(&empty_allocatable),
            policy.cards.len() as u64,
        )?;

        let uid = pod_key(pod);
        let (current, current_tiles) = self.node_status(node_name, Some(&uid)).await?;

        // Recheck under the lock: a concurrent bind may have taken the room
        // this plan was computed against.
        let no_usage = ResourceMap::new();
        for (card, card_delta) in delta {
            let used = current.get(card).unwrap_or(&no_usage);
            if !card_delta.fits(&capacity, used) {
                warn!(node = %node_name, card = %card, "capacity recheck failed, rejecting bind");
                return Err(Error::WillNotFit);
            }
        }

        let mut committed_tiles = NodeTiles::new();
        for group in parse_tile_annotation(tiles) {
            for (card, indices) in group {
                if let Some(in_use) = current_tiles.get(&card) {
                    if indices.iter().any(|index| in_use.contains(index)) {
                        warn!(node = %node_name, card = %card, "tile recheck failed, rejecting bind");
                        return Err(Error::WillNotFit);
                    }
                }
                committed_tiles.entry(card).or_default().extend(indices);
            }
        }

        debug!(node = %node_name, pod = %uid, cards, "committing bind");
        self.ledger.write().await.insert(
            uid,
            LedgerEntry {
                node: node_name.to_string(),
                resources: delta.clone(),
                tiles: committed_tiles,
            },
        );

        Ok(())
    }
}

/// JSON-patching pod annotator backed by the Kubernetes API
pub struct KubePodPatcher {
    client: Client,
}

impl KubePodPatcher {
    /// Create a patcher over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodPatcher for KubePodPatcher {
    async fn apply_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        pod: &Pod,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = annotation_patch(pod, annotations);
        pods.patch(name, &PatchParams::default(), &Patch::<()>::Json(patch))
            .await
            .map_err(|e| Error::patch(format!("failed to annotate pod {namespace}/{name}: {e}")))?;
        Ok(())
    }
}

fn pod_key(pod: &Pod) -> String {
    match pod.metadata.uid.as_deref() {
        Some(uid) if !uid.is_empty() => uid.to_string(),
        _ => format!(
            "{}/{}",
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default()
        ),
    }
}

/// Reconstruct one pod's committed usage from its assignment annotations
///
/// The card annotation aligns positionally with the pod's containers; each
/// assigned card carries the per-card share of the container request, with
/// the tile count taken from the tile annotation when present. A pod whose
/// requests fail to parse is skipped; accounting stays best-effort.
fn pod_committed_usage(pod: &Pod) -> (NodeResources, NodeTiles) {
    let mut resources = NodeResources::new();
    let mut tiles = NodeTiles::new();

    let Some(annotations) = pod.metadata.annotations.as_ref() else {
        return (resources, tiles);
    };
    let Some(cards_value) = annotations.get(CARD_ANNOTATION) else {
        return (resources, tiles);
    };

    let requests = container_requests(pod).unwrap_or_default();
    let card_groups = parse_card_annotation(cards_value);
    let tile_groups = annotations
        .get(TILE_ANNOTATION)
        .map(|value| parse_tile_annotation(value))
        .unwrap_or_default();

    for (index, cards) in card_groups.iter().enumerate() {
        if cards.is_empty() {
            continue;
        }
        let request = requests.get(index).cloned().unwrap_or_default();
        let per_card = request.divide_ceil(cards.len() as u64);
        let container_tiles = tile_groups.get(index);

        for card in cards {
            let mut delta = per_card.clone();
            let picked = container_tiles
                .and_then(|group| group.iter().find(|(c, _)| c == card))
                .map(|(_, indices)| indices);
            if let Some(indices) = picked {
                delta.set(TILE_RESOURCE, indices.len() as u64);
                tiles
                    .entry(card.clone())
                    .or_default()
                    .extend(indices.iter().copied());
            }
            merge_card(&mut resources, card, &delta);
        }
    }

    (resources, tiles)
}

fn merge_card(into: &mut NodeResources, card: &str, delta: &ResourceMap) {
    into.entry(card.to_string()).or_default().add(delta);
}

fn merge_resources(into: &mut NodeResources, from: &NodeResources) {
    for (card, delta) in from {
        merge_card(into, card, delta);
    }
}

fn merge_tiles(into: &mut NodeTiles, from: &NodeTiles) {
    for (card, indices) in from {
        into.entry(card.clone())
            .or_default()
            .extend(indices.iter().copied());
    }
}
