//! A recorded route repair (spec §3, §4.3).

use crate::trace::TraceId;
use std::net::Ipv4Addr;

/// A `A, *, B -> A, X, B` (or `*, A -> X, A` at the start of a route) repair.
///
/// `representative` is a handle into the engine's trace list, not a pointer, per the §9 design
/// note eliminating cyclic Trace<->RouteRepair references.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RouteRepair {
    pub hop_before: Option<Ipv4Addr>,
    pub hop_after: Option<Ipv4Addr>,
    pub replacement: Ipv4Addr,
    pub online: bool,
    /// How many traces this repair fixes (siblings sharing the same `(before, *, after)`
    /// context).
    pub occurrences_missing: u32,
    /// How many traces already witnessed `(before, replacement, after)` directly, offline only.
    pub occurrences_existing: u32,
    pub representative: TraceId,
    pub ttl: u8,
}

impl RouteRepair {
    #[must_use]
    pub fn to_line(&self) -> String {
        let before = self
            .hop_before
            .map_or_else(|| "*".to_string(), |v| v.to_string());
        let after = self
            .hop_after
            .map_or_else(|| "*".to_string(), |v| v.to_string());
        format!(
            "{before}, {}, {after} -> {} (TTL={}, missing={}, existing={}, online={})",
            "*", self.replacement, self.ttl, self.occurrences_missing, self.occurrences_existing, self.online
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_repairs_have_no_existing_occurrences_by_construction() {
        let r = RouteRepair {
            hop_before: Some("1.1.1.1".parse().unwrap()),
            hop_after: Some("2.2.2.2".parse().unwrap()),
            replacement: "1.1.1.2".parse().unwrap(),
            online: true,
            occurrences_missing: 1,
            occurrences_existing: 0,
            representative: TraceId(0),
            ttl: 3,
        };
        assert!(!r.online || r.occurrences_existing == 0);
    }
}
