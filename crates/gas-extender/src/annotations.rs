//! Assignment annotation composition and parsing
//!
//! The bind decision is recorded on the pod as `gas-container-cards` and
//! `gas-container-tiles`. Per-container groups are joined by `|`, cards
//! within a group by `,`, tiles within a card entry by `+` as `gt<index>`.
//! The cache parses the same annotations back when reconstructing a node's
//! committed usage from its pods.

use std::collections::BTreeMap;

use gas_common::labels::{
    CARD_SEPARATOR, CONTAINER_SEPARATOR, TILE_PREFIX, TILE_SEPARATOR,
};
use json_patch::{AddOperation, Patch, PatchOperation};
use jsonptr::Pointer;
use k8s_openapi::api::core::v1::Pod;

use crate::planner::PlacementPlan;

/// Compose the card annotation: `card0|card0,card1|...`
pub fn card_annotation(plan: &PlacementPlan) -> String {
    plan.containers
        .iter()
        .map(|assignment| assignment.cards.join(CARD_SEPARATOR))
        .collect::<Vec<_>>()
        .join(CONTAINER_SEPARATOR)
}

/// Compose the tile annotation: `card0:gt0+gt1,card1:gt0|...`
///
/// Returns `None` when no container was assigned any tiles; the annotation
/// is omitted entirely in that case.
pub fn tile_annotation(plan: &PlacementPlan) -> Option<String> {
    if plan.containers.iter().all(|a| a.tiles.is_empty()) {
        return None;
    }

    let groups: Vec<String> = plan
        .containers
        .iter()
        .map(|assignment| {
            assignment
                .tiles
                .iter()
                .map(|(card, tiles)| {
                    let list = tiles
                        .iter()
                        .map(|index| format!("{TILE_PREFIX}{index}"))
                        .collect::<Vec<_>>()
                        .join(TILE_SEPARATOR);
                    format!("{card}:{list}")
                })
                .collect::<Vec<_>>()
                .join(CARD_SEPARATOR)
        })
        .collect();

    Some(groups.join(CONTAINER_SEPARATOR))
}

/// Parse a card annotation back into per-container card groups
pub fn parse_card_annotation(value: &str) -> Vec<Vec<String>> {
    value
        .split(CONTAINER_SEPARATOR)
        .map(|group| {
            group
                .split(CARD_SEPARATOR)
                .filter(|card| !card.is_empty())
                .map(str::to_string)
                .collect()
        })
        .collect()
}

/// Parse a tile annotation back into per-container `(card, tiles)` groups
///
/// Malformed entries are skipped; annotation damage must not take the
/// whole node's accounting down with it.
pub fn parse_tile_annotation(value: &str) -> Vec<Vec<(String, Vec<u32>)>> {
    value
        .split(CONTAINER_SEPARATOR)
        .map(|group| {
            group
                .split(CARD_SEPARATOR)
                .filter_map(|entry| {
                    let (card, tiles) = entry.split_once(':')?;
                    if card.is_empty() {
                        return None;
                    }
                    let indices: Vec<u32> = tiles
                        .split(TILE_SEPARATOR)
                        .filter_map(|token| token.strip_prefix(TILE_PREFIX)?.parse().ok())
                        .collect();
                    Some((card.to_string(), indices))
                })
                .collect()
        })
        .collect()
}

/// Build the JSON patch that applies `annotations` to a pod
///
/// When the pod has no annotations object yet, the patch creates it first;
/// a bare `add` on a child of a missing object would fail.
pub fn annotation_patch(pod: &Pod, annotations: &BTreeMap<String, String>) -> Patch {
    let mut operations = Vec::with_capacity(annotations.len() + 1);

    if pod
        .metadata
        .annotations
        .as_ref()
        .map(BTreeMap::is_empty)
        .unwrap_or(true)
    {
        operations.push(PatchOperation::Add(AddOperation {
            path: Pointer::new(["metadata", "annotations"]),
            value: serde_json::json!({}),
        }));
    }

    for (key, value) in annotations {
        operations.push(PatchOperation::Add(AddOperation {
            path: Pointer::new(["metadata", "annotations", key.as_str()]),
            value: serde_json::Value::String(value.clone()),
        }));
    }

    Patch(operations)
}
