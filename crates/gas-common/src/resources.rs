//! Resource arithmetic over vendor GPU resource maps
//!
//! Quantities are non-negative integers. The orchestrator hands us
//! `Quantity` strings; anything fractional is rejected up front so the
//! arithmetic below never has to care.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::Error;
use crate::labels::{GPU_RESOURCE_PREFIX, TILE_RESOURCE};
use crate::Result;

/// Mapping from resource name to a non-negative integer quantity
///
/// Addition, saturating subtraction and the `fits` comparison are defined
/// element-wise; missing keys read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceMap(BTreeMap<String, u64>);

/// Currently-committed usage per card on one node
pub type NodeResources = BTreeMap<String, ResourceMap>;

/// In-use tile indices per card on one node
pub type NodeTiles = BTreeMap<String, BTreeSet<u32>>;

impl ResourceMap {
    /// Create an empty resource map
    pub fn new() -> Self {
        Self::default()
    }

    /// Quantity for a resource; missing keys read as zero
    pub fn get(&self, name: &str) -> u64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    /// Set the quantity for a resource
    pub fn set(&mut self, name: impl Into<String>, quantity: u64) {
        self.0.insert(name.into(), quantity);
    }

    /// True when no resources are present
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, quantity)` pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Add another map element-wise
    pub fn add(&mut self, other: &ResourceMap) {
        for (name, quantity) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) += quantity;
        }
    }

    /// Subtract another map element-wise, saturating at zero
    pub fn sub_saturating(&mut self, other: &ResourceMap) {
        for (name, quantity) in &other.0 {
            if let Some(current) = self.0.get_mut(name) {
                *current = current.saturating_sub(*quantity);
            }
        }
    }

    /// Per-card share of a request spread over `n` cards (ceiling division)
    ///
    /// Earlier cards of an uneven split carry the larger share, so the
    /// ceiling is the right per-card bound for capacity checks.
    pub fn divide_ceil(&self, n: u64) -> ResourceMap {
        if n <= 1 {
            return self.clone();
        }

        ResourceMap(
            self.0
                .iter()
                .map(|(name, quantity)| (name.clone(), quantity.div_ceil(n)))
                .collect(),
        )
    }

    /// Check that this request fits within `capacity` given current `used`
    ///
    /// True iff `self + used ≤ capacity` element-wise over this map's keys.
    /// Missing capacity keys read as zero, so requesting a resource the card
    /// does not have always fails.
    pub fn fits(&self, capacity: &ResourceMap, used: &ResourceMap) -> bool {
        self.iter()
            .all(|(name, need)| need + used.get(name) <= capacity.get(name))
    }
}

impl FromIterator<(String, u64)> for ResourceMap {
    fn from_iter<T: IntoIterator<Item = (String, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ResourceMap {
    type Item = (&'a String, &'a u64);
    type IntoIter = std::collections::btree_map::Iter<'a, String, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Decode an orchestrator quantity as a non-negative integer
///
/// Fractional or suffixed quantities (`500m`, `1.5`, `2Gi`) are invalid for
/// GPU resources and fail with [`Error::InvalidResource`].
pub fn quantity_value(resource: &str, quantity: &Quantity) -> Result<u64> {
    quantity
        .0
        .parse::<u64>()
        .map_err(|_| Error::invalid_resource(resource, &quantity.0))
}

/// Derive the per-GPU capacity from a node's allocatable resources
///
/// Every vendor resource is divided by the card count (integer division);
/// the tile resource is declared per card by the device plugin and is kept
/// as-is.
pub fn per_gpu_capacity(
    allocatable: &BTreeMap<String, Quantity>,
    card_count: u64,
) -> Result<ResourceMap> {
    let mut capacity = ResourceMap::new();

    if card_count == 0 {
        return Ok(capacity);
    }

    for (name, quantity) in allocatable {
        if !name.starts_with(GPU_RESOURCE_PREFIX) {
            continue;
        }

        let value = quantity_value(name, quantity)?;
        let per_gpu = if name == TILE_RESOURCE {
            value
        } else {
            value / card_count
        };
        capacity.set(name.clone(), per_gpu);
    }

    Ok(capacity)
}

/// Fold a per-card delta into a node's usage view
pub fn add_card_usage(used: &mut NodeResources, card: &str, delta: &ResourceMap) {
    used.entry(card.to_string()).or_default().add(delta);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rm(pairs: &[(&str, u64)]) -> ResourceMap {
        pairs
            .iter()
            .map(|(name, quantity)| (name.to_string(), *quantity))
            .collect()
    }

    #[test]
    fn test_need_exceeding_capacity_does_not_fit() {
        let need = rm(&[("foo", 1)]);
        assert!(!need.fits(&ResourceMap::new(), &ResourceMap::new()));
    }

    #[test]
    fn test_fits_is_checked_on_the_needs_keys_only() {
        let need = rm(&[("gpu.intel.com/i915", 1)]);
        let capacity = rm(&[("gpu.intel.com/i915", 2)]);
        // Capacity lists extra resources the need does not mention
        let used = rm(&[("gpu.intel.com/tiles", 99)]);
        assert!(need.fits(&capacity, &used));

        let used = rm(&[("gpu.intel.com/i915", 2)]);
        assert!(!need.fits(&capacity, &used));
    }

    #[test]
    fn test_add_and_sub_saturating() {
        let mut total = rm(&[("a", 1), ("b", 2)]);
        total.add(&rm(&[("b", 3), ("c", 4)]));
        assert_eq!(total, rm(&[("a", 1), ("b", 5), ("c", 4)]));

        total.sub_saturating(&rm(&[("a", 10), ("c", 1)]));
        assert_eq!(total.get("a"), 0);
        assert_eq!(total.get("b"), 5);
        assert_eq!(total.get("c"), 3);
    }

    #[test]
    fn test_divide_ceil_rounds_up() {
        let request = rm(&[("gpu.intel.com/i915", 2), ("gpu.intel.com/tiles", 3)]);
        let per_card = request.divide_ceil(2);
        assert_eq!(per_card.get("gpu.intel.com/i915"), 1);
        assert_eq!(per_card.get("gpu.intel.com/tiles"), 2);

        // n <= 1 is the identity
        assert_eq!(request.divide_ceil(1), request);
    }

    #[test]
    fn test_quantity_rejects_fractions() {
        assert!(quantity_value("gpu.intel.com/i915", &Quantity("1".into())).is_ok());
        for bad in ["1500m", "1.5", "-1", "2Gi", ""] {
            let err = quantity_value("gpu.intel.com/i915", &Quantity(bad.into())).unwrap_err();
            assert!(matches!(err, Error::InvalidResource { .. }), "{bad}");
        }
    }

    #[test]
    fn test_per_gpu_capacity_divides_all_but_tiles() {
        let mut allocatable = BTreeMap::new();
        allocatable.insert("gpu.intel.com/i915".to_string(), Quantity("6".into()));
        allocatable.insert("gpu.intel.com/tiles".to_string(), Quantity("4".into()));
        allocatable.insert("gpu.intel.com/foo".to_string(), Quantity("9".into()));
        allocatable.insert("cpu".to_string(), Quantity("1500m".into()));

        let capacity = per_gpu_capacity(&allocatable, 3).unwrap();
        assert_eq!(capacity.get("gpu.intel.com/i915"), 2);
        // Tile capacity is per card already
        assert_eq!(capacity.get("gpu.intel.com/tiles"), 4);
        assert_eq!(capacity.get("gpu.intel.com/foo"), 3);
        // Non-vendor resources are not ours to track
        assert_eq!(capacity.get("cpu"), 0);
    }

    #[test]
    fn test_per_gpu_capacity_with_no_cards_is_empty() {
        let mut allocatable = BTreeMap::new();
        allocatable.insert("gpu.intel.com/i915".to_string(), Quantity("2".into()));
        assert!(per_gpu_capacity(&allocatable, 0).unwrap().is_empty());
    }
}
