//! Kernel dataplane programming: named sets (`ipset`) and filter rules
//! (`iptables`).
//!
//! Both managers mirror the kernel state they own in memory and talk to the
//! kernel exclusively through [`exec::CommandRunner`], so the whole crate is
//! testable against a mock without a live netfilter.

pub mod exec;
pub mod ipset;
pub mod iptables;
pub mod metrics;
pub mod names;
