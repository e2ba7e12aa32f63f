//! Fixed-flow (Paris) per-hop tracing (spec §4.1).
//!
//! Grounded in `ParisTracerouteTask::run` in
//! `original_source/v1/Code/src/tool/traceroute/ParisTracerouteTask.cpp`. A trace never touches
//! the IP table's per-hop bookkeeping directly: that happens afterwards, in one single-threaded
//! pass over every completed trace (see [`crate::ip_table::IpTable::populate_from_trace`]). The
//! only IP table interaction here is the destination interface's preferred timeout and, on
//! success, its hop count — both narrow, target-specific facts the original records straight from
//! `ParisTracerouteTask` rather than from the dictionary-population pass.

use crate::config::{Config, MAX_TTL};
use crate::error::ProberError;
use crate::ip_table::IpTable;
use crate::prober::{Prober, ReplyKind};
use crate::trace::{HopState, RouteHop, Trace};
use arrayvec::ArrayVec;
use std::net::Ipv4Addr;

/// Trace a fixed-flow route to `target`, recording the result as a [`Trace`] with `opinion`
/// as its re-trace ("bis") number.
///
/// # Errors
/// Propagates [`ProberError::Fatal`] from the underlying [`Prober`]; a probe timeout is not an
/// error (spec §7).
pub fn trace_route(
    ip_table: &IpTable,
    prober: &mut dyn Prober,
    config: &Config,
    target: Ipv4Addr,
    opinion: u16,
) -> Result<Trace, ProberError> {
    let preferred_timeout = ip_table.ensure_preferred_timeout(target, config.timeout);
    let mut used_timeout = prober.timeout();
    if preferred_timeout > used_timeout {
        prober.set_timeout(preferred_timeout);
        used_timeout = preferred_timeout;
    }

    // A trace never exceeds `MAX_TTL` hops (spec §4.1), so the accumulator is a fixed-capacity
    // buffer rather than a growable `Vec`, the same shape the teacher uses for its own
    // hard-bounded-by-protocol buffers (`ArrayVec<TcpProbe, MAX_TCP_PROBES>`).
    let mut route: ArrayVec<RouteHop, { MAX_TTL as usize }> = ArrayVec::new();
    let mut reachable = false;
    let mut anonymous_run = 0u16;
    let mut cycles = 0u16;
    let mut ttl = 1u8;

    while ttl <= MAX_TTL {
        let mut record = prober.single_probe(target, ttl, true)?;

        if record.is_anonymous() {
            tracing::trace!(%target, ttl, "no reply, retrying with doubled timeout");
            prober.set_timeout(used_timeout * 2);
            record = prober.single_probe(target, ttl, true)?;
            prober.set_timeout(used_timeout);
        }

        if let Some(reply_addr) = record.reply_addr {
            anonymous_run = 0;
            if route.iter().any(|h: &RouteHop| h.reply_addr == reply_addr) {
                cycles += 1;
            }
        } else {
            anonymous_run += 1;
        }

        if anonymous_run > config.max_anon_hops || cycles > config.max_cycles {
            tracing::debug!(%target, ttl, anonymous_run, cycles, "stopping trace: limit reached");
            break;
        }

        match record.reply_kind {
            ReplyKind::DestinationUnreachable => break,
            ReplyKind::EchoReply => {
                reachable = true;
                break;
            }
            ReplyKind::TimeExceeded | ReplyKind::Timeout => {}
        }

        route.push(match record.reply_addr {
            Some(addr) => RouteHop {
                reply_addr: addr,
                reply_ttl: record.reply_ttl,
                state: HopState::ViaTraceroute,
            },
            None => RouteHop::anonymous(),
        });
        ttl += 1;
    }

    if reachable {
        ip_table.get_or_create_with(target, |entry| entry.set_min_ttl(ttl));
    }

    if matches!(config.verbosity, crate::config::Verbosity::Debug) {
        tracing::debug!(log = %prober.get_and_clear_log(), "prober log");
    } else {
        let _ = prober.get_and_clear_log();
    }

    let mut trace = Trace::new(target, opinion);
    trace.reachable = reachable;
    trace.route = route.into_iter().collect();
    Ok(trace)
}
