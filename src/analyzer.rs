//! Route Analyzer & Post-Processor (spec §4.2).
//!
//! Grounded in `RoutePostProcessor::{detect,mitigate}` in
//! `original_source/v1/Code/src/tool/postprocessing/RoutePostProcessor.cpp`. Runs single-threaded,
//! after the dictionary has been populated from every completed trace
//! ([`crate::ip_table::IpTable::populate_from_trace`]) and after route repair.

use crate::ip_table::IpTable;
use crate::trace::{HopState, RouteHop, Trace};
use std::net::Ipv4Addr;

/// Mark cycles and stretches on every trace's *measured* route, feeding the per-interface
/// histograms on the IP table (spec §4.2).
pub fn detect(ip_table: &IpTable, traces: &mut [Trace]) {
    for trace in traces.iter_mut() {
        if !trace.has_valid_route() {
            continue;
        }
        detect_cycles(ip_table, &mut trace.route);
        detect_stretches(ip_table, &mut trace.route);
    }
}

fn detect_cycles(ip_table: &IpTable, route: &mut [RouteHop]) {
    for i in 0..route.len() {
        if route[i].state == HopState::Cycle || route[i].is_anonymous() {
            continue;
        }
        let addr = route[i].reply_addr;
        for j in (i + 1)..route.len() {
            if route[j].reply_addr == addr && !route[j].is_anonymous() {
                route[j].state = HopState::Cycle;
                ip_table.with(addr, |e| e.add_in_cycle_ttl((j + 1) as u8));
            }
        }
    }
}

fn detect_stretches(ip_table: &IpTable, route: &mut [RouteHop]) {
    for (i, hop) in route.iter_mut().enumerate() {
        if hop.is_anonymous() || hop.state == HopState::Cycle {
            continue;
        }
        let Some(min_ttl) = ip_table.lookup(hop.reply_addr).and_then(|e| e.min_ttl()) else {
            continue;
        };
        let ttl = (i + 1) as u8;
        if ttl > min_ttl {
            hop.state = HopState::Stretched;
            ip_table.with(hop.reply_addr, |e| e.add_stretched_ttl(ttl));
        }
    }
}

fn needs_cycling_mitigation(route: &[RouteHop]) -> bool {
    route.iter().any(|h| h.state == HopState::Cycle)
}

fn needs_stretch_mitigation(route: &[RouteHop]) -> bool {
    route.iter().any(|h| h.state == HopState::Stretched)
}

/// Replace each detected cycle and stretch with a fresh, collapsed route, written to
/// [`Trace::post_processed`]; the measured route in [`Trace::route`] is left untouched
/// (spec §3 ownership rules).
pub fn mitigate(ip_table: &IpTable, traces: &mut [Trace]) {
    let originals: Vec<(Ipv4Addr, Vec<RouteHop>)> = traces
        .iter()
        .filter(|t| t.has_valid_route())
        .map(|t| (t.target, t.route.clone()))
        .collect();

    for trace in traces.iter_mut() {
        if !trace.has_valid_route() {
            continue;
        }
        let needs_cycle = needs_cycling_mitigation(&trace.route);
        let needs_stretch = needs_stretch_mitigation(&trace.route);
        if !needs_cycle && !needs_stretch {
            continue;
        }

        let mut current = trace.route.clone();
        let mut changed = false;
        if needs_cycle {
            let (route, did_change) = mitigate_cycles(current);
            current = route;
            changed |= did_change;
        }
        if needs_stretch {
            let (route, did_change) = mitigate_stretches(ip_table, current, &originals);
            current = route;
            changed |= did_change;
        }
        if changed {
            trace.post_processed = Some(current);
        }
    }
}

fn mitigate_cycles(mut route: Vec<RouteHop>) -> (Vec<RouteHop>, bool) {
    let mut changed = false;
    while let Some(cycle_end) = route.iter().rposition(|h| h.state == HopState::Cycle) {
        if cycle_end == 0 {
            break;
        }
        let cycled_ip = route[cycle_end].reply_addr;
        let Some(cycle_start) = (0..cycle_end).find(|&i| route[i].reply_addr == cycled_ip) else {
            break;
        };

        let mut new_route = Vec::with_capacity(cycle_start + (route.len() - cycle_end));
        new_route.extend_from_slice(&route[..cycle_start]);
        new_route.extend_from_slice(&route[cycle_end..]);
        for hop in &mut new_route {
            if hop.reply_addr == cycled_ip {
                hop.state = HopState::ViaTraceroute;
            }
        }
        route = new_route;
        changed = true;
    }
    (route, changed)
}

/// Find the route prefix leading up to the earliest, shortest-TTL occurrence of `stretched`
/// across every trace's original (measured) route.
fn find_prefix(
    ip_table: &IpTable,
    stretched: Ipv4Addr,
    originals: &[(Ipv4Addr, Vec<RouteHop>)],
) -> Option<Vec<RouteHop>> {
    let min_ttl = ip_table.lookup(stretched)?.min_ttl()?;
    if min_ttl == 0 {
        return None;
    }
    let ttl = min_ttl as usize;

    for (target, route) in originals {
        if route.len() >= ttl {
            if route[ttl - 1].reply_addr == stretched {
                return Some(route[..ttl - 1].to_vec());
            }
        } else if route.len() == ttl - 1 && *target == stretched {
            return Some(route.clone());
        }
    }
    None
}

fn mitigate_stretches(
    ip_table: &IpTable,
    mut route: Vec<RouteHop>,
    originals: &[(Ipv4Addr, Vec<RouteHop>)],
) -> (Vec<RouteHop>, bool) {
    let mut changed = false;
    while let Some(offset) = route.iter().rposition(|h| h.state == HopState::Stretched) {
        if offset == 0 {
            break;
        }
        let ip_to_fix = route[offset].reply_addr;
        let prefix = find_prefix(ip_table, ip_to_fix, originals).unwrap_or_default();

        let mut new_route = Vec::with_capacity(prefix.len() + (route.len() - offset));
        new_route.extend(prefix);
        new_route.extend_from_slice(&route[offset..]);
        for hop in &mut new_route {
            if hop.reply_addr == ip_to_fix {
                hop.state = HopState::ViaTraceroute;
            }
        }
        route = new_route;
        changed = true;
    }
    (route, changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(addr: &str, ttl: u8) -> RouteHop {
        RouteHop::observed(addr.parse().unwrap(), ttl)
    }

    #[test]
    fn detect_marks_repeated_hop_as_cycle() {
        let table = IpTable::new();
        let mut trace = Trace::new("10.0.0.9".parse().unwrap(), 1);
        trace.route = vec![observed("1.1.1.1", 64), observed("2.2.2.2", 63), observed("1.1.1.1", 62)];
        detect(&table, std::slice::from_mut(&mut trace));
        assert_eq!(trace.route[2].state, HopState::Cycle);
        let entry = table.lookup("1.1.1.1".parse().unwrap()).unwrap();
        assert_eq!(entry.in_cycle_ttls(), &[3]);
    }

    #[test]
    fn detect_marks_deeper_occurrence_as_stretched() {
        let table = IpTable::new();
        table.get_or_create_with("5.5.5.5".parse().unwrap(), |e| e.record_hop_count(2));
        let mut trace = Trace::new("10.0.0.9".parse().unwrap(), 1);
        trace.route = vec![observed("1.1.1.1", 64), observed("2.2.2.2", 63), observed("5.5.5.5", 62)];
        detect(&table, std::slice::from_mut(&mut trace));
        assert_eq!(trace.route[2].state, HopState::Stretched);
    }

    #[test]
    fn mitigate_collapses_cycle_into_single_hop() {
        let table = IpTable::new();
        let mut trace = Trace::new("10.0.0.9".parse().unwrap(), 1);
        trace.route = vec![observed("1.1.1.1", 64), observed("2.2.2.2", 63), observed("1.1.1.1", 62)];
        let mut traces = vec![trace];
        detect(&table, &mut traces);
        mitigate(&table, &mut traces);
        let post = traces[0].post_processed.as_ref().unwrap();
        assert_eq!(post.len(), 1);
        assert_eq!(post[0].reply_addr, "1.1.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(post[0].state, HopState::ViaTraceroute);
    }

    #[test]
    fn mitigate_rewrites_stretch_with_shorter_prefix() {
        let table = IpTable::new();
        table.get_or_create_with("5.5.5.5".parse().unwrap(), |e| e.record_hop_count(1));

        let mut short_trace = Trace::new("9.9.9.9".parse().unwrap(), 1);
        short_trace.route = vec![observed("5.5.5.5", 64)];

        let mut stretched_trace = Trace::new("10.0.0.9".parse().unwrap(), 1);
        stretched_trace.route = vec![observed("1.1.1.1", 64), observed("5.5.5.5", 63)];

        let mut traces = vec![short_trace, stretched_trace];
        detect(&table, &mut traces);
        assert_eq!(traces[1].route[1].state, HopState::Stretched);

        mitigate(&table, &mut traces);
        let post = traces[1].post_processed.as_ref().unwrap();
        assert_eq!(post.len(), 1);
        assert_eq!(post[0].reply_addr, "5.5.5.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(post[0].state, HopState::ViaTraceroute);
    }
}
