//! Card selection for one container request
//!
//! Applies the deny/disable/allow policy, drops cards without room, orders
//! what is left (balanced-resource ascending or policy order, preferred card
//! in front) and takes as many cards as the container asks for.

use gas_common::labels::{GPU_PLUGIN_RESOURCE, GPU_RESOURCE_PREFIX};
use gas_common::resources::NodeResources;
use gas_common::{Error, ResourceMap, Result};
use tracing::debug;

use crate::policy::Policy;

/// The outcome of card selection for one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardSelection {
    /// Selected card names, in assignment order
    pub cards: Vec<String>,
    /// The share of the container request each selected card carries
    pub per_card_request: ResourceMap,
    /// Whether the node's preferred card ended up selected
    pub preferred_used: bool,
}

/// Choose cards for one container request
///
/// `used` is the cycle's current view: committed usage plus everything
/// already handed out to earlier containers of the same pod. A container
/// requesting `i915 > 1` gets that many distinct cards, each carrying the
/// ceiling share of the request.
pub fn select_cards(
    container_request: &ResourceMap,
    per_gpu_capacity: &ResourceMap,
    policy: &Policy,
    used: &NodeResources,
    balanced_resource: &str,
) -> Result<CardSelection> {
    let num_cards = container_request.get(GPU_PLUGIN_RESOURCE);
    if num_cards == 0 {
        return Ok(CardSelection::default());
    }

    let per_card_request = container_request.divide_ceil(num_cards);
    let empty = ResourceMap::new();

    let mut candidates: Vec<&String> = policy
        .cards
        .iter()
        .filter(|card| policy.is_card_usable(card))
        .filter(|card| {
            let card_used = used.get(*card).unwrap_or(&empty);
            per_card_request.fits(per_gpu_capacity, card_used)
        })
        .collect();

    if candidates.is_empty() {
        debug!(request = ?container_request, "no usable card fits the request");
        return Err(Error::WillNotFit);
    }

    if !balanced_resource.is_empty() {
        let resource = format!("{GPU_RESOURCE_PREFIX}{balanced_resource}");
        if container_request.get(&resource) > 0 {
            // Stable sort keeps policy order between equally-loaded cards
            candidates.sort_by_key(|card| used.get(*card).map(|u| u.get(&resource)).unwrap_or(0));
        }
    }

    let mut preferred_used = false;
    if let Some(preferred) = &policy.preferred_card {
        if let Some(position) = candidates.iter().position(|card| *card == preferred) {
            let card = candidates.remove(position);
            candidates.insert(0, card);
            preferred_used = true;
        }
    }

    if (candidates.len() as u64) < num_cards {
        return Err(Error::WillNotFit);
    }

    Ok(CardSelection {
        cards: candidates
            .into_iter()
            .take(num_cards as usize)
            .cloned()
            .collect(),
        per_card_request,
        preferred_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn policy_for(node: &[(&str, &str)], pod: &[(&str, &str)]) -> Policy {
        let to_map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        Policy::decode(&to_map(node), &to_map(pod))
    }

    fn three_card_policy() -> Policy {
        policy_for(&[("gpu.intel.com/cards", "card0,card1,card2")], &[])
    }

    fn rm(pairs: &[(&str, u64)]) -> ResourceMap {
        pairs
            .iter()
            .map(|(name, quantity)| (name.to_string(), *quantity))
            .collect()
    }

    fn used_for(pairs: &[(&str, ResourceMap)]) -> NodeResources {
        pairs
            .iter()
            .map(|(card, usage)| (card.to_string(), usage.clone()))
            .collect()
    }

    #[test]
    fn test_first_card_wins_without_preference() {
        let request = rm(&[("gpu.intel.com/i915", 1)]);
        let capacity = rm(&[("gpu.intel.com/i915", 1)]);

        let selection = select_cards(
            &request,
            &capacity,
            &three_card_policy(),
            &NodeResources::new(),
            "",
        )
        .unwrap();

        assert_eq!(selection.cards, ["card0"]);
        assert!(!selection.preferred_used);
    }

    #[test]
    fn test_preferred_card_wins_when_feasible() {
        let policy = policy_for(
            &[
                ("gpu.intel.com/cards", "card0,card1,card2"),
                ("telemetry.aware.scheduling.policy/gas-prefer-gpu", "card2"),
            ],
            &[],
        );
        let request = rm(&[("gpu.intel.com/i915", 1)]);
        let capacity = rm(&[("gpu.intel.com/i915", 1)]);

        let selection =
            select_cards(&request, &capacity, &policy, &NodeResources::new(), "").unwrap();

        assert_eq!(selection.cards, ["card2"]);
        assert!(selection.preferred_used);
    }

    #[test]
    fn test_infeasible_preferred_card_falls_back() {
        let policy = policy_for(
            &[
                ("gpu.intel.com/cards", "card0,card1"),
                ("telemetry.aware.scheduling.policy/gas-prefer-gpu", "card1"),
                ("telemetry.aware.scheduling.policy/gpu-disable-card1", "true"),
            ],
            &[],
        );
        let request = rm(&[("gpu.intel.com/i915", 1)]);
        let capacity = rm(&[("gpu.intel.com/i915", 1)]);

        let selection =
            select_cards(&request, &capacity, &policy, &NodeResources::new(), "").unwrap();

        assert_eq!(selection.cards, ["card0"]);
        assert!(!selection.preferred_used);
    }

    /// The balanced resource steers towards the least-consumed card.
    #[test]
    fn test_balanced_resource_picks_least_used() {
        let request = rm(&[("gpu.intel.com/i915", 1), ("gpu.intel.com/foo", 1)]);
        let capacity = rm(&[("gpu.intel.com/i915", 1), ("gpu.intel.com/foo", 4)]);
        let used = used_for(&[
            ("card0", rm(&[("gpu.intel.com/foo", 1)])),
            ("card1", rm(&[("gpu.intel.com/foo", 2)])),
            ("card2", rm(&[])),
        ]);

        let selection =
            select_cards(&request, &capacity, &three_card_policy(), &used, "foo").unwrap();

        assert_eq!(selection.cards, ["card2"]);
        assert!(!selection.preferred_used);
    }

    #[test]
    fn test_balanced_resource_ignored_when_not_requested() {
        let request = rm(&[("gpu.intel.com/i915", 1)]);
        let capacity = rm(&[("gpu.intel.com/i915", 2), ("gpu.intel.com/foo", 4)]);
        let used = used_for(&[
            ("card0", rm(&[("gpu.intel.com/foo", 3)])),
            ("card1", rm(&[])),
        ]);
        let policy = policy_for(&[("gpu.intel.com/cards", "card0,card1")], &[]);

        let selection = select_cards(&request, &capacity, &policy, &used, "foo").unwrap();

        // Policy order stands because the request doesn't mention foo
        assert_eq!(selection.cards, ["card0"]);
    }

    #[test]
    fn test_denied_only_card_will_not_fit() {
        let policy = policy_for(&[("gpu.intel.com/cards", "card0")], &[("gas-deny", "card0")]);
        let request = rm(&[("gpu.intel.com/i915", 1)]);
        let capacity = rm(&[("gpu.intel.com/i915", 1)]);

        let err = select_cards(&request, &capacity, &policy, &NodeResources::new(), "")
            .unwrap_err();
        assert!(matches!(err, Error::WillNotFit));
    }

    #[test]
    fn test_allowlist_restricts_selection() {
        let policy = policy_for(
            &[("gpu.intel.com/cards", "card0,card1")],
            &[("gas-allow", "card1")],
        );
        let request = rm(&[("gpu.intel.com/i915", 1)]);
        let capacity = rm(&[("gpu.intel.com/i915", 1)]);

        let selection =
            select_cards(&request, &capacity, &policy, &NodeResources::new(), "").unwrap();
        assert_eq!(selection.cards, ["card1"]);
    }

    #[test]
    fn test_full_card_is_skipped() {
        let request = rm(&[("gpu.intel.com/i915", 1)]);
        let capacity = rm(&[("gpu.intel.com/i915", 1)]);
        let used = used_for(&[("card0", rm(&[("gpu.intel.com/i915", 1)]))]);

        let selection =
            select_cards(&request, &capacity, &three_card_policy(), &used, "").unwrap();
        assert_eq!(selection.cards, ["card1"]);
    }

    #[test]
    fn test_multi_card_request_takes_distinct_cards() {
        let request = rm(&[("gpu.intel.com/i915", 2), ("gpu.intel.com/tiles", 3)]);
        let capacity = rm(&[("gpu.intel.com/i915", 1), ("gpu.intel.com/tiles", 4)]);

        let selection = select_cards(
            &request,
            &capacity,
            &three_card_policy(),
            &NodeResources::new(),
            "",
        )
        .unwrap();

        assert_eq!(selection.cards, ["card0", "card1"]);
        // Each card carries the ceiling share
        assert_eq!(selection.per_card_request.get("gpu.intel.com/i915"), 1);
        assert_eq!(selection.per_card_request.get("gpu.intel.com/tiles"), 2);
    }

    #[test]
    fn test_too_few_cards_will_not_fit() {
        let policy = policy_for(&[("gpu.intel.com/cards", "card0")], &[]);
        let request = rm(&[("gpu.intel.com/i915", 2)]);
        let capacity = rm(&[("gpu.intel.com/i915", 1)]);

        let err = select_cards(&request, &capacity, &policy, &NodeResources::new(), "")
            .unwrap_err();
        assert!(matches!(err, Error::WillNotFit));
    }

    #[test]
    fn test_empty_request_selects_nothing() {
        let selection = select_cards(
            &ResourceMap::new(),
            &ResourceMap::new(),
            &three_card_policy(),
            &NodeResources::new(),
            "",
        )
        .unwrap();
        assert!(selection.cards.is_empty());
    }
}
