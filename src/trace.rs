//! Traces and route hops (spec §3).

use std::net::Ipv4Addr;

/// Opaque handle into the engine's trace list (spec §9 design note: no cyclic references between
/// a [`crate::route_repair::RouteRepair`] and its representative trace).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, derive_more::From, serde::Serialize, serde::Deserialize,
)]
pub struct TraceId(pub u32);

/// The state tag of a single hop. Transitions are monotonic: `Missing -> Repaired* -> Stretched |
/// Cycle` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HopState {
    ViaTraceroute,
    Missing,
    Anonymous,
    Skipped,
    RepairedOffline,
    RepairedOnline,
    Limited,
    Stretched,
    Cycle,
}

/// A single hop within a [`Trace`]. `0.0.0.0` (`Ipv4Addr::UNSPECIFIED`) denotes an anonymous hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RouteHop {
    pub reply_addr: Ipv4Addr,
    pub reply_ttl: u8,
    pub state: HopState,
}

impl RouteHop {
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            reply_addr: Ipv4Addr::UNSPECIFIED,
            reply_ttl: 0,
            state: HopState::Missing,
        }
    }

    #[must_use]
    pub fn observed(reply_addr: Ipv4Addr, reply_ttl: u8) -> Self {
        if reply_addr == Ipv4Addr::UNSPECIFIED {
            Self::anonymous()
        } else {
            Self {
                reply_addr,
                reply_ttl,
                state: HopState::ViaTraceroute,
            }
        }
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.reply_addr == Ipv4Addr::UNSPECIFIED
    }

    /// Replace this hop's address in place during repair, preserving the `Repaired*` monotonic
    /// transition (spec §3 ownership rules: hop state transitions are the only in-place mutation
    /// allowed on an otherwise-immutable observed route).
    pub fn repair(&mut self, replacement: Ipv4Addr, online: bool) {
        self.reply_addr = replacement;
        self.state = if online {
            HopState::RepairedOnline
        } else {
            HopState::RepairedOffline
        };
    }
}

/// A traceroute record towards a single target (spec §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Trace {
    pub target: Ipv4Addr,
    pub reachable: bool,
    /// 1 for the first trace, 2.. for re-traces ("bis traces" / "opinions").
    pub opinion: u16,
    pub route: Vec<RouteHop>,
    pub post_processed: Option<Vec<RouteHop>>,
}

impl Trace {
    #[must_use]
    pub fn new(target: Ipv4Addr, opinion: u16) -> Self {
        Self {
            target,
            reachable: false,
            opinion,
            route: Vec::new(),
            post_processed: None,
        }
    }

    #[must_use]
    pub fn has_valid_route(&self) -> bool {
        !self.route.is_empty()
    }

    #[must_use]
    pub fn is_post_processed(&self) -> bool {
        self.post_processed.is_some()
    }

    #[must_use]
    pub fn has_complete_route(&self) -> bool {
        self.route.iter().all(|h| !h.is_anonymous())
    }

    #[must_use]
    pub fn has_incomplete_route(&self) -> bool {
        !self.has_complete_route()
    }

    #[must_use]
    pub fn count_missing_hops(&self) -> usize {
        self.route.iter().filter(|h| h.is_anonymous()).count()
    }

    #[must_use]
    pub fn is_stretched(&self) -> bool {
        self.route.iter().any(|h| h.state == HopState::Stretched)
    }

    #[must_use]
    pub fn has_cycles(&self) -> bool {
        self.route.iter().any(|h| h.state == HopState::Cycle)
    }

    /// Render the observed route as the `.traces` block described in spec §6.
    #[must_use]
    pub fn to_string_measured(&self) -> String {
        render_block(self.target, self.opinion, &self.route)
    }

    /// Render the post-processed route, if any, as the `.post-processed` block.
    #[must_use]
    pub fn to_string_post_processed(&self) -> Option<String> {
        self.post_processed
            .as_ref()
            .map(|route| render_block(self.target, self.opinion, route))
    }
}

fn render_block(target: Ipv4Addr, opinion: u16, route: &[RouteHop]) -> String {
    let mut out = format!("Target: {target} (opinion n°{opinion})\n");
    for hop in route {
        let tag = match hop.state {
            HopState::ViaTraceroute => hop.reply_addr.to_string(),
            HopState::Missing => "Anonymous".to_string(),
            HopState::Anonymous => "Anonymous".to_string(),
            HopState::Skipped => "Skipped".to_string(),
            HopState::RepairedOffline => format!("{} [Repaired-1]", hop.reply_addr),
            HopState::RepairedOnline => format!("{} [Repaired-2]", hop.reply_addr),
            HopState::Limited => format!("{} [Limited]", hop.reply_addr),
            HopState::Stretched => format!("{} [Stretched]", hop.reply_addr),
            HopState::Cycle => format!("{} [Cycle]", hop.reply_addr),
        };
        out.push_str(&tag);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_route_has_no_anonymous_hops() {
        let mut t = Trace::new("10.0.0.1".parse().unwrap(), 1);
        t.route.push(RouteHop::observed("1.1.1.1".parse().unwrap(), 64));
        t.route.push(RouteHop::observed("2.2.2.2".parse().unwrap(), 63));
        assert!(t.has_complete_route());
        assert_eq!(t.count_missing_hops(), 0);
    }

    #[test]
    fn incomplete_route_counts_anonymous_hops() {
        let mut t = Trace::new("10.0.0.1".parse().unwrap(), 1);
        t.route.push(RouteHop::observed("1.1.1.1".parse().unwrap(), 64));
        t.route.push(RouteHop::anonymous());
        assert!(t.has_incomplete_route());
        assert_eq!(t.count_missing_hops(), 1);
    }

    #[test]
    fn serde_round_trip_is_byte_identical() {
        let mut t = Trace::new("10.0.0.1".parse().unwrap(), 2);
        t.route.push(RouteHop::observed("1.1.1.1".parse().unwrap(), 64));
        let once = serde_json::to_string(&t).unwrap();
        let parsed: Trace = serde_json::from_str(&once).unwrap();
        let twice = serde_json::to_string(&parsed).unwrap();
        assert_eq!(once, twice);
    }
}
