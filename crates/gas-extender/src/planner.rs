//! Per-pod placement planning
//!
//! Walks the pod's containers in declaration order against a scratch copy of
//! the node's committed usage, so one container's cards and tiles are charged
//! before the next container is placed. The planner has no side effects; the
//! caller decides whether the resulting plan is committed (bind) or thrown
//! away (filter dry-run).

use gas_common::labels::{GPU_PLUGIN_RESOURCE, GPU_RESOURCE_PREFIX, TILE_RESOURCE};
use gas_common::resources::{add_card_usage, quantity_value, NodeResources, NodeTiles};
use gas_common::{Error, ResourceMap, Result};
use k8s_openapi::api::core::v1::Pod;

use crate::cards::select_cards;
use crate::policy::Policy;
use crate::tiles::pick_tiles;

/// Everything the planner needs to know about one node
#[derive(Debug, Clone, Default)]
pub struct NodeView {
    /// Decoded node/pod policy
    pub policy: Policy,
    /// Per-card resource capacity
    pub per_gpu_capacity: ResourceMap,
    /// Committed per-card usage from the cache
    pub committed_resources: NodeResources,
    /// Committed in-use tile indices from the cache
    pub committed_tiles: NodeTiles,
}

/// Cards and tiles assigned to one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerAssignment {
    /// Selected cards, in assignment order; empty for containers without a
    /// GPU request
    pub cards: Vec<String>,
    /// Tile indices per selected card, in card order
    pub tiles: Vec<(String, Vec<u32>)>,
}

/// A feasible placement of a whole pod on one node
#[derive(Debug, Clone, Default)]
pub struct PlacementPlan {
    /// Per-container assignments, in container declaration order
    pub containers: Vec<ContainerAssignment>,
    /// Per-card resource delta this plan consumes
    pub used_delta: NodeResources,
    /// Tile indices this plan consumes, per card
    pub tiles_delta: NodeTiles,
    /// Whether any container landed on the node's preferred card
    pub preferred_used: bool,
}

/// Extract each container's vendor GPU request, in declaration order
///
/// Containers without GPU requests yield an empty map so positions stay
/// aligned with the pod spec. Fractional quantities are rejected.
pub fn container_requests(pod: &Pod) -> Result<Vec<ResourceMap>> {
    let containers = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default();

    containers
        .iter()
        .map(|container| {
            let mut request = ResourceMap::new();
            if let Some(requests) = container
                .resources
                .as_ref()
                .and_then(|resources| resources.requests.as_ref())
            {
                for (name, quantity) in requests {
                    if name.starts_with(GPU_RESOURCE_PREFIX) {
                        request.set(name.clone(), quantity_value(name, quantity)?);
                    }
                }
            }
            Ok(request)
        })
        .collect()
}

/// Total tile count a pod asks for across all containers
pub fn total_tile_request(requests: &[ResourceMap]) -> u64 {
    requests.iter().map(|r| r.get(TILE_RESOURCE)).sum()
}

/// Plan the whole pod onto one node, or fail with the first obstacle
pub fn plan_pod(
    requests: &[ResourceMap],
    view: &NodeView,
    balanced_resource: &str,
) -> Result<PlacementPlan> {
    if view.policy.cards.is_empty() {
        return Err(Error::InfeasibleNode);
    }

    // Scratch copies; the cache-owned snapshots are never mutated
    let mut in_cycle_used = view.committed_resources.clone();
    let mut in_cycle_tiles = view.committed_tiles.clone();

    let tile_capacity = view.per_gpu_capacity.get(TILE_RESOURCE);
    let mut plan = PlacementPlan::default();

    for request in requests {
        if request.get(GPU_PLUGIN_RESOURCE) == 0 {
            plan.containers.push(ContainerAssignment::default());
            continue;
        }

        let selection = select_cards(
            request,
            &view.per_gpu_capacity,
            &view.policy,
            &in_cycle_used,
            balanced_resource,
        )?;
        plan.preferred_used |= selection.preferred_used;

        let mut assignment = ContainerAssignment {
            cards: selection.cards.clone(),
            tiles: Vec::new(),
        };

        // As-even-as-possible tile split; earlier cards take the larger share
        let mut remaining_tiles = request.get(TILE_RESOURCE);
        let card_count = selection.cards.len() as u64;

        for (index, card) in selection.cards.iter().enumerate() {
            let share = remaining_tiles.div_ceil(card_count - index as u64);
            let chosen = pick_tiles(card, share, tile_capacity, &mut in_cycle_tiles, &view.policy)?;
            remaining_tiles -= share;

            let mut delta = selection.per_card_request.clone();
            if request.get(TILE_RESOURCE) > 0 {
                delta.set(TILE_RESOURCE, share);
            }
            add_card_usage(&mut in_cycle_used, card, &delta);
            add_card_usage(&mut plan.used_delta, card, &delta);

            if !chosen.is_empty() {
                plan.tiles_delta
                    .entry(card.clone())
                    .or_default()
                    .extend(chosen.iter().copied());
                assignment.tiles.push((card.clone(), chosen));
            }
        }

        plan.containers.push(assignment);
    }

    Ok(plan)
}
