//! Well-known labels, annotations and resource names.
//!
//! The GPU device plugin advertises cards and tiles through node labels in
//! the `gpu.intel.com` namespace; scheduling policy arrives through labels
//! in the telemetry policy namespace; per-pod decisions are recorded as
//! `gas-*` annotations on the pod.

/// Namespace prefix of all vendor GPU resources and labels
pub const GPU_RESOURCE_PREFIX: &str = "gpu.intel.com/";

/// Resource name counting shared device slots per card
pub const GPU_PLUGIN_RESOURCE: &str = "gpu.intel.com/i915";

/// Resource name counting GPU tiles
pub const TILE_RESOURCE: &str = "gpu.intel.com/tiles";

/// Node label carrying the card name list (`.` or `,` separated)
pub const CARDS_LABEL: &str = "gpu.intel.com/cards";

/// Node label (or label family, with numeric suffixes) carrying dot-separated
/// card numbers
pub const GPU_NUMBERS_LABEL: &str = "gpu.intel.com/gpu-numbers";

/// Node label describing PCI groups as `_`-separated groups of `.`-separated
/// card numbers
pub const PCI_GROUP_LABEL: &str = "gpu.intel.com/pci-groups";

/// Prefix of the policy label namespace
pub const POLICY_PREFIX: &str = "telemetry.aware.scheduling.policy/";

/// Policy label name fragment disabling a card (`gpu-disable-<card>`) or a
/// tile (`gpu-disable-<card>_gt<index>`)
pub const GPU_DISABLE_PREFIX: &str = "gpu-disable-";

/// Policy label name fragment descheduling a tile
/// (`gpu-deschedule-<card>_gt<index>`)
pub const TILE_DESCHEDULE_PREFIX: &str = "gpu-deschedule-";

/// Policy label name fragment listing preferred tiles for a card
/// (`gpu-pref-tiles-<card>` = `gt<i>[+gt<j>...]`)
pub const TILE_PREFERENCE_PREFIX: &str = "gpu-pref-tiles-";

/// Policy label naming the preferred card
pub const PREFERRED_GPU_LABEL: &str = "gas-prefer-gpu";

/// Label value meaning "enabled"
pub const TRUE_VALUE: &str = "true";

/// Disable-label value that extends the disable to the card's whole PCI group
pub const PCI_GROUP_VALUE: &str = "PCI_GROUP";

/// Pod annotation carrying the scheduling timestamp (decimal nanoseconds)
pub const TS_ANNOTATION: &str = "gas-ts";

/// Pod annotation carrying the per-container card assignment
pub const CARD_ANNOTATION: &str = "gas-container-cards";

/// Pod annotation carrying the per-container tile assignment
pub const TILE_ANNOTATION: &str = "gas-container-tiles";

/// Pod annotation listing cards the pod may use (comma-separated)
pub const ALLOWLIST_ANNOTATION: &str = "gas-allow";

/// Pod annotation listing cards the pod must not use (comma-separated)
pub const DENYLIST_ANNOTATION: &str = "gas-deny";

/// Separator between per-container groups in assignment annotations
pub const CONTAINER_SEPARATOR: &str = "|";

/// Separator between cards within one container group
pub const CARD_SEPARATOR: &str = ",";

/// Separator between tiles within one card entry
pub const TILE_SEPARATOR: &str = "+";

/// Prefix of a tile reference (`gt<index>`)
pub const TILE_PREFIX: &str = "gt";
