//! Rate-Limit Scheduler (spec §4.4).
//!
//! Grounded in `RoundScheduler::start`/`ProbeUnit::run` in
//! `original_source/v1/Code/src/tool/rate-limit-analysis/RoundScheduler.cpp`: a geometric,
//! per-candidate round loop that doubles concurrency each round until the mean response ratio
//! drops below a floor or the next round would exceed the configured thread ceiling.

use crate::config::Config;
use crate::error::ProberError;
use crate::ip_table::{IpTable, RateLimitTarget};
use crate::pool;
use crate::prober::ProberFactory;
use crate::round_record::RoundRecord;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

/// Run the full round loop against a single rate-limit candidate, pushing each completed
/// [`RoundRecord`] onto its [`crate::ip_table::Interface`] (spec §4.4, §8 scenario 4).
///
/// # Errors
/// Propagates the first [`ProberError::Fatal`] encountered by any probing worker.
pub fn evaluate_candidate(
    ip_table: &IpTable,
    prober_factory: &dyn ProberFactory,
    config: &Config,
    candidate: Ipv4Addr,
    rl_target: RateLimitTarget,
    stop: &AtomicBool,
) -> Result<(), ProberError> {
    let max_threads = u32::from(config.threads);
    let mut round_id: u16 = 1;
    let mut n_threads: u32 = 1;

    while n_threads < max_threads {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let stagger = Duration::from_secs(1) / n_threads;
        let mut round = RoundRecord::new(round_id);

        for experiment in 0..config.rl_experiments_per_round {
            if !(round_id == 1 && experiment == 0) {
                sleep(config.rl_delay_between_experiments);
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }

            let (success, misc) =
                run_experiment(prober_factory, config, rl_target, n_threads, stagger, candidate)?;
            let ratio = (f64::from(success) / f64::from(n_threads)) * 100.0;
            round.record_ratio(ratio);
            for ip in misc {
                round.record_misc_ip(ip);
            }
        }

        let mean = round.mean();
        ip_table.with(candidate, |e| e.push_round_record(round));

        if mean < config.rl_min_response_ratio {
            tracing::debug!(%candidate, round_id, mean, "rate-limit evaluation stopped: mean below floor");
            break;
        }

        round_id += 1;
        n_threads = 1u32 << (round_id - 1);
    }

    if n_threads >= max_threads {
        tracing::debug!(%candidate, "rate-limit evaluation stopped: reached thread ceiling");
    }

    Ok(())
}

/// Fire `n_threads` concurrent probes, staggered by `stagger`, and tally replies from `candidate`
/// against replies from any other (misc) interface (spec §4.4, `ProbeUnit::run`).
fn run_experiment(
    prober_factory: &dyn ProberFactory,
    config: &Config,
    rl_target: RateLimitTarget,
    n_threads: u32,
    stagger: Duration,
    candidate: Ipv4Addr,
) -> Result<(u32, Vec<Ipv4Addr>), ProberError> {
    let jobs: Vec<()> = (0..n_threads).map(|_| ()).collect();
    let timeout = config.timeout;
    let results = pool::run_staggered(jobs, n_threads as usize, stagger, move |_w, ()| {
        let mut prober = prober_factory.build(timeout)?;
        let record = prober.single_probe(rl_target.target, rl_target.ttl, true)?;
        Ok::<Option<Ipv4Addr>, ProberError>(record.reply_addr)
    });

    let mut success = 0u32;
    let mut misc = Vec::new();
    for result in results {
        match result? {
            Some(addr) if addr == candidate => success += 1,
            Some(addr) => misc.push(addr),
            None => {}
        }
    }
    Ok((success, misc))
}
