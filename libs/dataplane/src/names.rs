//! Naming for kernel-visible objects.
//!
//! The kernel caps set names at 31 bytes, so every logical name is published
//! under a fixed-width hashed alias: the agent prefix followed by the
//! FNV-1a 32-bit hash of the logical name in hex.

/// Prefix carried by every set this agent creates. Sets without it are never
/// touched, sets with it are assumed owned.
pub const SET_PREFIX: &str = "azure-npm-";

/// Logical name of the set-of-sets holding every known namespace set.
pub const ALL_NAMESPACES: &str = "all-namespaces";

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

fn fnv1a32(input: &str) -> u32 {
    input.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Kernel name for a logical set name.
pub fn hashed_name(logical: &str) -> String {
    format!("{SET_PREFIX}{:08x}", fnv1a32(logical))
}

/// Namespace membership set, e.g. `ns-kube-system`.
pub fn ns_set(namespace: &str) -> String {
    format!("ns-{namespace}")
}

/// Namespace label list holding namespace sets, e.g. `ns-env:prod`.
pub fn ns_label_set(key: &str, value: &str) -> String {
    format!("ns-{key}:{value}")
}

/// Namespace label existence list, e.g. `ns-env`.
pub fn ns_label_key_set(key: &str) -> String {
    format!("ns-{key}")
}

/// Pod label set, e.g. `app:frontend`.
pub fn pod_label_set(key: &str, value: &str) -> String {
    format!("{key}:{value}")
}

/// Named-port set fed by pod container ports, e.g. `namedport:http`.
pub fn namedport_set(port_name: &str) -> String {
    format!("namedport:{port_name}")
}
