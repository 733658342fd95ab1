//! Namespace reconciliation: maintains `ns-<name>` sets, their membership in
//! the all-namespaces list and in per-label lists.

pub mod controller;
pub mod reconcile;
