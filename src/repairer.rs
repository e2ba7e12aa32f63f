//! Route Repairer (spec §4.3).
//!
//! Grounded in `RouteRepairer::repair`/`repairRouteOffline`/`resetUnavoidableAnonHops` in
//! `original_source/v1/Code/src/tool/repair/RouteRepairer.cpp` (Stages 1 & 2) and
//! `AnonymousChecker::loadTargets`/`probe`/`callback` in
//! `original_source/v1/Code/src/tool/repair/AnonymousChecker.cpp` (Stage 3). Offline repair is
//! pure, single-threaded computation over the already-collected trace list; online repair drives
//! the bounded worker pool (`pool::run_staggered`) to re-probe a handful of representative
//! targets.

use crate::config::Config;
use crate::error::ProberError;
use crate::pool;
use crate::prober::ProberFactory;
use crate::route_repair::RouteRepair;
use crate::trace::{HopState, RouteHop, Trace, TraceId};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

/// A trace is a repair candidate once it has reached its target through a valid route that still
/// has at least one anonymous hop (spec §4.3, `RouteRepairer::countIncompleteRoutes`).
fn is_candidate(trace: &Trace) -> bool {
    trace.reachable && trace.has_valid_route() && trace.has_incomplete_route()
}

fn placeholder(index: usize) -> Ipv4Addr {
    Ipv4Addr::new(0, 0, 0, index as u8)
}

fn is_placeholder(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0
}

/// Stage 1: mask every hop index that is anonymous in *every* trace with a route long enough to
/// reach it, since such a hop can never be repaired from witness evidence (no trace ever saw a
/// replacement there). Returns the number of hop indices masked.
pub fn mask_unavoidable_anonymous_hops(traces: &mut [Trace]) -> usize {
    let max_len = traces.iter().map(|t| t.route.len()).max().unwrap_or(0);
    let mut masked = 0;

    for index in 0..max_len {
        let mut saw_any = false;
        let mut all_anonymous = true;
        for trace in traces.iter() {
            if trace.route.len() <= index {
                continue;
            }
            saw_any = true;
            if !trace.route[index].is_anonymous() {
                all_anonymous = false;
                break;
            }
        }
        if saw_any && all_anonymous {
            masked += 1;
            for trace in traces.iter_mut() {
                if trace.route.len() > index {
                    trace.route[index] = RouteHop {
                        reply_addr: placeholder(index + 1),
                        reply_ttl: 0,
                        state: HopState::Skipped,
                    };
                }
            }
        }
    }
    masked
}

/// Undo [`mask_unavoidable_anonymous_hops`] once the repairer has finished using the placeholder
/// as a non-anonymous marker, restoring the affected hops to `Missing` (spec §4.3,
/// `RouteRepairer::resetUnavoidableAnonHops`).
pub fn reset_unavoidable_anonymous_hops(traces: &mut [Trace]) {
    for trace in traces.iter_mut() {
        for hop in &mut trace.route {
            if hop.state == HopState::Skipped && is_placeholder(hop.reply_addr) {
                *hop = RouteHop::anonymous();
            }
        }
    }
}

/// Stage 2: offline triplet-witness repair. For every candidate trace, replace each anonymous
/// hop whose neighbouring hops (`hop_before`, `hop_after`) uniquely determine a single
/// non-anonymous witness elsewhere in the trace set, propagating the same replacement to every
/// sibling trace sharing that exact `(before, *, after)` context (spec §4.3).
#[must_use]
pub fn offline_repair(traces: &mut [Trace]) -> Vec<RouteRepair> {
    let mut repairs = Vec::new();

    for trace_idx in 0..traces.len() {
        if !is_candidate(&traces[trace_idx]) {
            continue;
        }
        if traces[trace_idx].route.len() == 1 {
            if let Some(repair) = repair_single_hop(traces, trace_idx) {
                repairs.push(repair);
            }
            continue;
        }
        let route_len = traces[trace_idx].route.len();
        for hop_idx in 0..route_len - 1 {
            if !traces[trace_idx].route[hop_idx].is_anonymous() {
                continue;
            }
            if let Some(repair) = repair_hop(traces, trace_idx, hop_idx) {
                repairs.push(repair);
            }
        }
    }
    repairs
}

fn repair_single_hop(traces: &mut [Trace], trace_idx: usize) -> Option<RouteRepair> {
    let mut similar_indices = Vec::new();
    let mut options = Vec::new();
    for (j, t) in traces.iter().enumerate() {
        if t.route.is_empty() {
            continue;
        }
        options.push(t.route[0].reply_addr);
        if t.route.len() == 1 && t.route[0].is_anonymous() {
            similar_indices.push(j);
        }
    }

    let occurrences_existing = options.len() as u32;
    options.sort_unstable();
    options.dedup();
    if options.len() != 1 || similar_indices.is_empty() {
        return None;
    }
    let replacement = options[0];
    if replacement == Ipv4Addr::UNSPECIFIED {
        return None;
    }

    for &j in &similar_indices {
        traces[j].route[0].repair(replacement, false);
    }

    Some(RouteRepair {
        hop_before: None,
        hop_after: None,
        replacement,
        online: false,
        occurrences_missing: similar_indices.len() as u32,
        occurrences_existing,
        representative: TraceId(trace_idx as u32),
        ttl: 1,
    })
}

fn matches_context(route: &[RouteHop], hop_idx: usize, hop_before: Option<Ipv4Addr>, hop_after: Ipv4Addr) -> bool {
    if route.len() <= hop_idx + 1 {
        return false;
    }
    let before_ok = match hop_before {
        Some(addr) => hop_idx > 0 && route[hop_idx - 1].reply_addr == addr,
        None => hop_idx == 0,
    };
    before_ok && route[hop_idx + 1].reply_addr == hop_after
}

fn repair_hop(traces: &mut [Trace], trace_idx: usize, hop_idx: usize) -> Option<RouteRepair> {
    let hop_before = if hop_idx > 0 {
        let addr = traces[trace_idx].route[hop_idx - 1].reply_addr;
        if addr == Ipv4Addr::UNSPECIFIED {
            return None;
        }
        Some(addr)
    } else {
        None
    };
    let hop_after = traces[trace_idx].route[hop_idx + 1].reply_addr;
    if hop_after == Ipv4Addr::UNSPECIFIED {
        return None;
    }

    let mut options = Vec::new();
    let mut similar_indices = Vec::new();
    for (j, t) in traces.iter().enumerate() {
        if !matches_context(&t.route, hop_idx, hop_before, hop_after) {
            continue;
        }
        let addr = t.route[hop_idx].reply_addr;
        if addr == Ipv4Addr::UNSPECIFIED {
            similar_indices.push(j);
        } else {
            options.push(addr);
        }
    }

    let occurrences_existing = options.len() as u32;
    options.sort_unstable();
    options.dedup();
    if options.len() != 1 {
        return None;
    }
    let replacement = options[0];

    for &j in &similar_indices {
        traces[j].route[hop_idx].repair(replacement, false);
    }

    Some(RouteRepair {
        hop_before,
        hop_after: Some(hop_after),
        replacement,
        online: false,
        occurrences_missing: similar_indices.len() as u32,
        occurrences_existing,
        representative: TraceId(trace_idx as u32),
        ttl: (hop_idx + 1) as u8,
    })
}

/// Two traces are grouped for a single online probe when they share an anonymous hop at the same
/// index with matching, non-anonymous neighbours (spec §4.3,
/// `AnonymousChecker::similarAnonymousHops`).
fn similar_anonymous_hops(r1: &[RouteHop], r2: &[RouteHop]) -> bool {
    if r1.len() < 2 || r2.len() < 2 {
        return false;
    }
    for i in 1..r1.len() - 1 {
        if i >= r2.len() - 1 {
            break;
        }
        if !r1[i].is_anonymous() {
            continue;
        }
        let before = r1[i - 1].reply_addr;
        let after = r1[i + 1].reply_addr;
        if before == Ipv4Addr::UNSPECIFIED || after == Ipv4Addr::UNSPECIFIED {
            continue;
        }
        if r2[i - 1].reply_addr == before && r2[i + 1].reply_addr == after {
            return true;
        }
    }
    false
}

/// Partition candidate trace indices into representative-led groups (spec §4.3,
/// `AnonymousChecker::loadTargets`): one online probe per group, propagated to its siblings.
fn group_similar(traces: &[Trace], candidates: &[usize]) -> Vec<Vec<usize>> {
    let mut remaining = candidates.to_vec();
    let mut groups = Vec::new();
    while !remaining.is_empty() {
        let rep = remaining.remove(0);
        let mut group = vec![rep];
        remaining.retain(|&idx| {
            if similar_anonymous_hops(&traces[rep].route, &traces[idx].route) {
                group.push(idx);
                false
            } else {
                true
            }
        });
        groups.push(group);
    }
    groups
}

struct ResolvedHop {
    trace_idx: usize,
    hop_idx: usize,
    resolved: Ipv4Addr,
}

/// Probe every anonymous hop of a group's representative trace, one hop at a time, sleeping
/// between probes per spec §4.3's regulating rule (2s after a successful de-anonymization, 1s
/// after a timeout).
fn probe_group(
    prober: &mut dyn crate::prober::Prober,
    representative: &Trace,
    rep_idx: usize,
) -> Result<Vec<ResolvedHop>, ProberError> {
    let anon_hops: Vec<usize> = representative
        .route
        .iter()
        .enumerate()
        .filter(|(_, h)| h.is_anonymous())
        .map(|(i, _)| i)
        .collect();

    let mut resolved = Vec::new();
    for hop_idx in anon_hops {
        let ttl = (hop_idx + 1) as u8;
        let record = prober.single_probe(representative.target, ttl, true)?;
        if let Some(addr) = record.reply_addr {
            resolved.push(ResolvedHop { trace_idx: rep_idx, hop_idx, resolved: addr });
            sleep(Duration::from_secs(2));
        } else {
            sleep(Duration::from_secs(1));
        }
    }
    Ok(resolved)
}

fn apply_resolution(traces: &mut [Trace], hop: ResolvedHop) -> Option<RouteRepair> {
    let ResolvedHop { trace_idx, hop_idx, resolved } = hop;
    if !traces[trace_idx].route[hop_idx].is_anonymous() {
        return None;
    }
    traces[trace_idx].route[hop_idx].repair(resolved, true);
    let route_len = traces[trace_idx].route.len();

    if hop_idx == 0 || hop_idx + 1 == route_len {
        let hop_before = (hop_idx > 0).then(|| traces[trace_idx].route[hop_idx - 1].reply_addr);
        let hop_after = (hop_idx + 1 < route_len).then(|| traces[trace_idx].route[hop_idx + 1].reply_addr);
        return Some(RouteRepair {
            hop_before,
            hop_after,
            replacement: resolved,
            online: true,
            occurrences_missing: 1,
            occurrences_existing: 0,
            representative: TraceId(trace_idx as u32),
            ttl: (hop_idx + 1) as u8,
        });
    }

    let hop_before = traces[trace_idx].route[hop_idx - 1].reply_addr;
    let hop_after = traces[trace_idx].route[hop_idx + 1].reply_addr;
    let mut fixed = 1u32;
    for j in 0..traces.len() {
        if j == trace_idx {
            continue;
        }
        let len2 = traces[j].route.len();
        if hop_idx + 1 >= len2 {
            continue;
        }
        if !traces[j].route[hop_idx].is_anonymous() {
            continue;
        }
        if traces[j].route[hop_idx - 1].reply_addr == hop_before && traces[j].route[hop_idx + 1].reply_addr == hop_after {
            traces[j].route[hop_idx].repair(resolved, false);
            fixed += 1;
        }
    }

    Some(RouteRepair {
        hop_before: Some(hop_before),
        hop_after: Some(hop_after),
        replacement: resolved,
        online: true,
        occurrences_missing: fixed,
        occurrences_existing: 0,
        representative: TraceId(trace_idx as u32),
        ttl: (hop_idx + 1) as u8,
    })
}

/// Stage 3: online repair. Probes one representative trace per similar-context group directly
/// (spec §4.3, `AnonymousChecker::probe`), sized from the total remaining anonymous hop count
/// the same way the original sizes `AnonymousCheckUnit`s (`totalAnonymous / 1800`, clamped to
/// `[4, 16]`). If the first pass solves more than 40% but not all of the anonymous hops it
/// started with, a second pass runs after a cool-down (spec §4.3's `60s` rule;
/// [`online_repair`] is the production entry point, fixed at a real 60s sleep, while
/// [`online_repair_with_cooldown`] takes the cool-down as a parameter for testability).
///
/// # Errors
/// Propagates the first [`ProberError::Fatal`] encountered by any worker.
pub fn online_repair(
    traces: &mut [Trace],
    prober_factory: &dyn ProberFactory,
    config: &Config,
    stop: &AtomicBool,
) -> Result<Vec<RouteRepair>, ProberError> {
    online_repair_with_cooldown(traces, prober_factory, config, stop, Duration::from_secs(60))
}

/// Same as [`online_repair`], with the second-pass cool-down exposed as a parameter.
///
/// # Errors
/// Propagates the first [`ProberError::Fatal`] encountered by any worker.
pub fn online_repair_with_cooldown(
    traces: &mut [Trace],
    prober_factory: &dyn ProberFactory,
    config: &Config,
    stop: &AtomicBool,
    cooldown: Duration,
) -> Result<Vec<RouteRepair>, ProberError> {
    if stop.load(Ordering::Relaxed) {
        return Ok(Vec::new());
    }

    let candidates: Vec<usize> = traces
        .iter()
        .enumerate()
        .filter(|(_, t)| is_candidate(t))
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let total_anon: usize = candidates.iter().map(|&i| traces[i].count_missing_hops()).sum();
    if total_anon == 0 {
        return Ok(Vec::new());
    }

    let mut repairs = run_online_pass(traces, prober_factory, config, stop, &candidates)?;

    let remaining: usize = candidates.iter().map(|&i| traces[i].count_missing_hops()).sum();
    let solved_ratio = (total_anon - remaining) as f64 / total_anon as f64;

    if solved_ratio > 0.4 && solved_ratio < 1.0 && !stop.load(Ordering::Relaxed) {
        tracing::debug!(solved_ratio, "online repair: first pass partially solved, running second pass after cool-down");
        sleep(cooldown);
        let second_pass = run_online_pass(traces, prober_factory, config, stop, &candidates)?;
        repairs.extend(second_pass);
    }

    Ok(repairs)
}

/// Run a single online-repair pass over `candidates`, skipping any trace whose anonymous hops
/// have already been fully resolved (by a prior pass).
fn run_online_pass(
    traces: &mut [Trace],
    prober_factory: &dyn ProberFactory,
    config: &Config,
    stop: &AtomicBool,
    candidates: &[usize],
) -> Result<Vec<RouteRepair>, ProberError> {
    if stop.load(Ordering::Relaxed) {
        return Ok(Vec::new());
    }

    let remaining_candidates: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&i| traces[i].count_missing_hops() > 0)
        .collect();
    if remaining_candidates.is_empty() {
        return Ok(Vec::new());
    }

    let total_anon: usize = remaining_candidates.iter().map(|&i| traces[i].count_missing_hops()).sum();
    let groups = group_similar(traces, &remaining_candidates);
    let worker_count = pool::size_workers(total_anon, 1800, 4, 16) as usize;

    let snapshot: Vec<Trace> = traces.to_vec();
    let timeout = config.timeout;
    let results = pool::run_staggered(groups, worker_count.max(1), config.thread_delay, move |_w, group| {
        if stop.load(Ordering::Relaxed) {
            return Ok(Vec::new());
        }
        let rep_idx = group[0];
        let mut prober = prober_factory.build(timeout)?;
        probe_group(prober.as_mut(), &snapshot[rep_idx], rep_idx)
    });

    let mut repairs = Vec::new();
    for result in results {
        let resolved: Vec<ResolvedHop> = result?;
        for hop in resolved {
            if let Some(repair) = apply_resolution(traces, hop) {
                repairs.push(repair);
            }
        }
    }
    Ok(repairs)
}
