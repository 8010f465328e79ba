mod agent;
mod request;
mod store;
pub mod swap;
mod uuid;

pub use agent::{
    Agent, AugmenterFilters, Augmenters, BidParams, Creative, DeviceTypeFilter, DmaFilter,
    RiskAugmenter, RiskAugmenterConfig, SegmentSpec, ViewabilityAugmenter, ViewabilityConfig,
    WhiteBlackLists,
};
pub use request::{extract, Components};
pub use store::{HttpObjectStore, KvStore, MemoryKv, ObjectStore, ObjectStoreConfig};
pub use uuid::{new_uuid, new_uuids};

/// FNV-1a, 64-bit. User identifiers are bucketed by the big-endian
/// interpretation of this digest everywhere in the system.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Parses a `"<integer>USD/1M"` amount into its micro value, or `None`
/// when malformed.
pub fn try_usd_1m(value: &str) -> Option<i64> {
    value.strip_suffix("USD/1M")?.parse::<i64>().ok()
}

/// Lenient variant: anything unparseable is treated as zero, same as a
/// missing parameter.
pub fn usd_1m(value: &str) -> i64 {
    try_usd_1m(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a64_reference_vectors() {
        // Vectors from the FNV reference implementation.
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn usd_1m_parses_micro_amounts() {
        assert_eq!(usd_1m("5000USD/1M"), 5000);
        assert_eq!(usd_1m("0USD/1M"), 0);
        assert_eq!(usd_1m("USD/1M"), 0);
        assert_eq!(usd_1m("5000"), 0);
        assert_eq!(usd_1m(""), 0);
        assert_eq!(try_usd_1m("5000USD/1M"), Some(5000));
        assert_eq!(try_usd_1m("5000"), None);
    }
}
