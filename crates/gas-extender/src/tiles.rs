//! Tile selection on one card
//!
//! Given a card and a tile count, picks concrete tile indices. The cycle's
//! scratch state doubles as the record of committed usage (the planner seeds
//! it from the cache snapshot), so a tile picked for one container is
//! forbidden for the next within the same cycle.

use gas_common::resources::NodeTiles;
use gas_common::{Error, Result};

use crate::policy::Policy;

/// Pick `count` tile indices on `card`, recording them in `in_cycle`
///
/// Preferred tiles are taken first in label order; the rest fill in
/// ascending index order, so the lowest free index wins when nothing is
/// preferred. Disabled and descheduled tiles are never picked; indices
/// past the card's capacity in those sets are harmless because selection
/// only ever draws from `0..capacity`.
pub fn pick_tiles(
    card: &str,
    count: u64,
    tile_capacity: u64,
    in_cycle: &mut NodeTiles,
    policy: &Policy,
) -> Result<Vec<u32>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let used = in_cycle.entry(card.to_string()).or_default();

    let mut available: Vec<u32> = (0..tile_capacity as u32)
        .filter(|index| !used.contains(index) && !policy.is_tile_blocked(card, *index))
        .collect();

    if (available.len() as u64) < count {
        return Err(Error::NoTiles);
    }

    let mut chosen: Vec<u32> = Vec::with_capacity(count as usize);

    for index in policy.preferred_tiles_for(card) {
        if chosen.len() as u64 == count {
            break;
        }
        if let Some(position) = available.iter().position(|a| a == index) {
            chosen.push(available.remove(position));
        }
    }

    for index in available {
        if chosen.len() as u64 == count {
            break;
        }
        chosen.push(index);
    }

    used.extend(chosen.iter().copied());

    Ok(chosen)
}
