//! Node label and pod annotation decoding
//!
//! Operators steer placement with labels in the telemetry policy namespace
//! and with `gas-allow`/`gas-deny` pod annotations. This module decodes both
//! into a [`Policy`] record; it never fails — malformed labels are ignored
//! so a bad label can degrade placement but not break scheduling.

use std::collections::{BTreeMap, BTreeSet};

use gas_common::labels::{
    ALLOWLIST_ANNOTATION, CARDS_LABEL, DENYLIST_ANNOTATION, GPU_DISABLE_PREFIX, GPU_NUMBERS_LABEL,
    PCI_GROUP_LABEL, PCI_GROUP_VALUE, POLICY_PREFIX, PREFERRED_GPU_LABEL, TILE_DESCHEDULE_PREFIX,
    TILE_PREFERENCE_PREFIX, TILE_PREFIX, TRUE_VALUE,
};

/// Decoded placement policy for one node/pod pair
///
/// Field order is stable: the card list preserves label order, sets are
/// ordered lexicographically by card name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    /// Ordered list of card names on the node
    pub cards: Vec<String>,
    /// Cards removed from scheduling, PCI-group expansion included
    pub disabled_cards: BTreeSet<String>,
    /// Tiles removed from scheduling, keyed by `(card, index)`
    pub disabled_tiles: BTreeSet<(String, u32)>,
    /// Tiles being drained; equivalent to disabled for new placement
    pub descheduled_tiles: BTreeSet<(String, u32)>,
    /// Card to place on when feasible
    pub preferred_card: Option<String>,
    /// Tiles to pick first per card, in label order
    pub preferred_tiles: BTreeMap<String, Vec<u32>>,
    /// PCI group members per card (cards sharing a PCI domain)
    pub pci_groups: BTreeMap<String, Vec<String>>,
    /// Cards the pod may use; empty means "no restriction"
    pub allowlist: BTreeSet<String>,
    /// Cards the pod must not use; wins over the allowlist
    pub denylist: BTreeSet<String>,
}

impl Policy {
    /// Decode node labels and pod annotations into a policy
    pub fn decode(
        node_labels: &BTreeMap<String, String>,
        pod_annotations: &BTreeMap<String, String>,
    ) -> Policy {
        let mut policy = Policy {
            cards: parse_card_list(node_labels),
            pci_groups: parse_pci_groups(node_labels),
            ..Policy::default()
        };

        for (key, value) in node_labels {
            let Some(rest) = key.strip_prefix(POLICY_PREFIX) else {
                continue;
            };

            if rest == PREFERRED_GPU_LABEL {
                if !value.is_empty() {
                    policy.preferred_card = Some(value.clone());
                }
            } else if let Some(tail) = rest.strip_prefix(GPU_DISABLE_PREFIX) {
                policy.parse_disable(tail, value);
            } else if let Some(tail) = rest.strip_prefix(TILE_DESCHEDULE_PREFIX) {
                if value == TRUE_VALUE {
                    if let Some(tile) = split_tile_ref(tail) {
                        policy.descheduled_tiles.insert(tile);
                    }
                }
            } else if let Some(card) = rest.strip_prefix(TILE_PREFERENCE_PREFIX) {
                let tiles = parse_tile_list(value);
                if !tiles.is_empty() {
                    policy.preferred_tiles.insert(card.to_string(), tiles);
                }
            }
        }

        policy.allowlist = parse_card_set(pod_annotations.get(ALLOWLIST_ANNOTATION));
        policy.denylist = parse_card_set(pod_annotations.get(DENYLIST_ANNOTATION));

        policy
    }

    /// One `gpu-disable-` label: either a whole card or a single tile
    fn parse_disable(&mut self, tail: &str, value: &str) {
        if let Some(tile) = split_tile_ref(tail) {
            if value == TRUE_VALUE {
                self.disabled_tiles.insert(tile);
            }
            return;
        }

        match value {
            TRUE_VALUE => {
                self.disabled_cards.insert(tail.to_string());
            }
            PCI_GROUP_VALUE => {
                // Disabling one card takes its whole PCI group with it
                self.disabled_cards.insert(tail.to_string());
                if let Some(members) = self.pci_groups.get(tail) {
                    self.disabled_cards.extend(members.iter().cloned());
                }
            }
            _ => {}
        }
    }

    /// Can this pod use this card at all?
    ///
    /// Disabled wins over everything, then the denylist wins over the
    /// allowlist.
    pub fn is_card_usable(&self, card: &str) -> bool {
        if self.disabled_cards.contains(card) {
            return false;
        }
        if !self.allowlist.is_empty() && !self.allowlist.contains(card) {
            return false;
        }
        !self.denylist.contains(card)
    }

    /// Is this tile removed from new placement?
    pub fn is_tile_blocked(&self, card: &str, index: u32) -> bool {
        let key = (card.to_string(), index);
        self.disabled_tiles.contains(&key) || self.descheduled_tiles.contains(&key)
    }

    /// Tiles to try first on a card, in label order
    pub fn preferred_tiles_for(&self, card: &str) -> &[u32] {
        self.preferred_tiles
            .get(card)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Ordered card list from the cards label and the gpu-numbers label family
///
/// The cards label accepts `.` or `,` separators; gpu-numbers labels carry
/// dot-separated card numbers and concatenate in label-key sorted order.
fn parse_card_list(labels: &BTreeMap<String, String>) -> Vec<String> {
    let mut cards = Vec::new();

    if let Some(value) = labels.get(CARDS_LABEL) {
        for name in value.split(['.', ',']).filter(|s| !s.is_empty()) {
            push_unique(&mut cards, name.to_string());
        }
    }

    // BTreeMap iteration gives label-key sorted order for the numbered variants
    for (key, value) in labels {
        if !key.starts_with(GPU_NUMBERS_LABEL) {
            continue;
        }
        for number in value.split('.').filter(|s| !s.is_empty()) {
            if number.chars().all(|c| c.is_ascii_digit()) {
                push_unique(&mut cards, format!("card{number}"));
            }
        }
    }

    cards
}

fn push_unique(cards: &mut Vec<String>, name: String) {
    if !cards.iter().any(|c| *c == name) {
        cards.push(name);
    }
}

/// PCI groups: `_`-separated groups of `.`-separated card numbers
///
/// `0.1_2.3` puts card0 and card1 in one group, card2 and card3 in another.
fn parse_pci_groups(labels: &BTreeMap<String, String>) -> BTreeMap<String, Vec<String>> {
    let mut groups = BTreeMap::new();

    let Some(value) = labels.get(PCI_GROUP_LABEL) else {
        return groups;
    };

    for group in value.split('_') {
        let members: Vec<String> = group
            .split('.')
            .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
            .map(|number| format!("card{number}"))
            .collect();
        for member in &members {
            groups.insert(member.clone(), members.clone());
        }
    }

    groups
}

/// `card0_gt3` → `("card0", 3)`
fn split_tile_ref(name: &str) -> Option<(String, u32)> {
    let (card, index) = name.rsplit_once("_gt")?;
    let index = index.parse().ok()?;
    if card.is_empty() {
        return None;
    }
    Some((card.to_string(), index))
}

/// `gt3+gt1` → `[3, 1]`, bad tokens skipped
fn parse_tile_list(value: &str) -> Vec<u32> {
    value
        .split('+')
        .filter_map(|token| token.strip_prefix(TILE_PREFIX)?.parse().ok())
        .collect()
}

/// Comma-separated card names from an allow/deny annotation
fn parse_card_set(value: Option<&String>) -> BTreeSet<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn decode(node: &[(&str, &str)], pod: &[(&str, &str)]) -> Policy {
        Policy::decode(&labels(node), &labels(pod))
    }

    #[test]
    fn test_card_list_accepts_both_separators() {
        let policy = decode(&[("gpu.intel.com/cards", "card0,card1,card2")], &[]);
        assert_eq!(policy.cards, ["card0", "card1", "card2"]);

        let policy = decode(&[("gpu.intel.com/cards", "card0.card1")], &[]);
        assert_eq!(policy.cards, ["card0", "card1"]);

        // Trailing separators are ignored
        let policy = decode(&[("gpu.intel.com/cards", "card0.")], &[]);
        assert_eq!(policy.cards, ["card0"]);
    }

    #[test]
    fn test_no_labels_mean_no_cards() {
        let policy = decode(&[], &[]);
        assert!(policy.cards.is_empty());
    }

    #[test]
    fn test_gpu_numbers_single_label() {
        let policy = decode(&[("gpu.intel.com/gpu-numbers", "0.1.2")], &[]);
        assert_eq!(policy.cards, ["card0", "card1", "card2"]);
    }

    /// Three gpu-numbers labels concatenate in label-key sorted order,
    /// trailing dots and all.
    #[test]
    fn test_gpu_numbers_label_family_round_trip() {
        let policy = decode(
            &[
                ("gpu.intel.com/gpu-numbers", "0.1.2."),
                ("gpu.intel.com/gpu-numbers2", "5.8.9."),
                ("gpu.intel.com/gpu-numbers3", "10"),
            ],
            &[],
        );
        assert_eq!(
            policy.cards,
            ["card0", "card1", "card2", "card5", "card8", "card9", "card10"]
        );
    }

    #[test]
    fn test_cards_and_gpu_numbers_union_dedupes() {
        let policy = decode(
            &[
                ("gpu.intel.com/cards", "card0,card5"),
                ("gpu.intel.com/gpu-numbers", "0.7"),
            ],
            &[],
        );
        assert_eq!(policy.cards, ["card0", "card5", "card7"]);
    }

    #[test]
    fn test_card_disable() {
        let policy = decode(
            &[
                ("gpu.intel.com/cards", "card0.card1"),
                ("telemetry.aware.scheduling.policy/gpu-disable-card0", "true"),
            ],
            &[],
        );
        assert!(!policy.is_card_usable("card0"));
        assert!(policy.is_card_usable("card1"));
    }

    /// Disabling one card with the PCI-group marker takes every card in its
    /// group out of scheduling.
    #[test]
    fn test_pci_group_disable_expands_to_the_group() {
        let policy = decode(
            &[
                ("gpu.intel.com/cards", "card0.card1.card2"),
                ("gpu.intel.com/pci-groups", "0.1_2"),
                (
                    "telemetry.aware.scheduling.policy/gpu-disable-card0",
                    "PCI_GROUP",
                ),
            ],
            &[],
        );
        assert!(!policy.is_card_usable("card0"));
        assert!(!policy.is_card_usable("card1"));
        assert!(policy.is_card_usable("card2"));
    }

    #[test]
    fn test_pci_group_disable_without_group_label() {
        let policy = decode(
            &[
                ("gpu.intel.com/cards", "card0"),
                (
                    "telemetry.aware.scheduling.policy/gpu-disable-card0",
                    "PCI_GROUP",
                ),
            ],
            &[],
        );
        assert!(!policy.is_card_usable("card0"));
    }

    #[test]
    fn test_tile_disable_and_deschedule() {
        let policy = decode(
            &[
                ("gpu.intel.com/cards", "card0.card1"),
                (
                    "telemetry.aware.scheduling.policy/gpu-disable-card0_gt0",
                    "true",
                ),
                (
                    "telemetry.aware.scheduling.policy/gpu-deschedule-card1_gt2",
                    "true",
                ),
            ],
            &[],
        );
        assert!(policy.is_tile_blocked("card0", 0));
        assert!(policy.is_tile_blocked("card1", 2));
        assert!(!policy.is_tile_blocked("card0", 1));
        // The cards themselves stay usable
        assert!(policy.is_card_usable("card0"));
        assert!(policy.is_card_usable("card1"));
    }

    #[test]
    fn test_malformed_tile_labels_are_ignored() {
        let policy = decode(
            &[
                ("gpu.intel.com/cards", "card0"),
                (
                    "telemetry.aware.scheduling.policy/gpu-disable-card0_gtx",
                    "true",
                ),
                (
                    "telemetry.aware.scheduling.policy/gpu-deschedule-card0_gt",
                    "true",
                ),
            ],
            &[],
        );
        assert!(policy.disabled_tiles.is_empty());
        assert!(policy.descheduled_tiles.is_empty());
    }

    #[test]
    fn test_preferred_card() {
        let policy = decode(
            &[
                ("gpu.intel.com/cards", "card0,card1,card2"),
                ("telemetry.aware.scheduling.policy/gas-prefer-gpu", "card2"),
            ],
            &[],
        );
        assert_eq!(policy.preferred_card.as_deref(), Some("card2"));
    }

    #[test]
    fn test_preferred_tiles_keep_label_order() {
        let policy = decode(
            &[
                ("gpu.intel.com/cards", "card0"),
                (
                    "telemetry.aware.scheduling.policy/gpu-pref-tiles-card0",
                    "gt3+gt1",
                ),
            ],
            &[],
        );
        assert_eq!(policy.preferred_tiles_for("card0"), [3, 1]);
        assert_eq!(policy.preferred_tiles_for("card1"), [0u32; 0]);
    }

    #[test]
    fn test_allow_and_deny_annotations() {
        let policy = decode(
            &[("gpu.intel.com/cards", "card0,card1,card2")],
            &[("gas-allow", "card0,card1"), ("gas-deny", "card1")],
        );
        assert!(policy.is_card_usable("card0"));
        // Deny wins over allow
        assert!(!policy.is_card_usable("card1"));
        // Not on the allowlist
        assert!(!policy.is_card_usable("card2"));
    }
}
