//! Pod reconciliation: mirrors valid pod IPs into namespace, label and
//! named-port sets.

pub mod controller;
pub mod reconcile;
