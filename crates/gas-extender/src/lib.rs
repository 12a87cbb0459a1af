//! GPU-aware scheduler extender
//!
//! The orchestrator delegates two decisions to this extender over HTTP:
//! *filter* (which candidate nodes can host a GPU pod) and *bind* (pick a
//! node and the concrete GPU cards and tiles on it, recorded as pod
//! annotations for the node-local device plugin to enforce).
//!
//! Module map, leaves first:
//! - [`policy`] — decode node labels and pod annotations into a [`policy::Policy`]
//! - [`tiles`] — pick concrete tile indices on one card
//! - [`cards`] — choose cards for one container request
//! - [`planner`] — per-pod placement over all containers
//! - [`annotations`] — compose and parse the assignment annotations
//! - [`cache`] — the cache capability set and its Kubernetes implementation
//! - [`extender`] — the filter/bind endpoints
//! - [`server`] — the axum HTTP surface

pub mod annotations;
pub mod cache;
pub mod cards;
pub mod extender;
pub mod planner;
pub mod policy;
pub mod server;
pub mod tiles;

pub use extender::{ExtenderConfig, GasExtender};
