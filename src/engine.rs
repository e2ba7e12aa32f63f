//! The engine: owns the shared IP table and trace list and drives the serial phase sequence
//! (spec §5, §9 design note "globally shared mutable state").
//!
//! Grounded in `ToolEnvironment` (`original_source/v1/Code/src/tool/ToolEnvironment.cpp`) for the
//! shared-state/mutex layout, and in `Main.cpp`'s `main()` for the phase sequence itself: trace,
//! then repair, then analyze/post-process (repairing anonymous hops *before* detecting
//! stretch/cycle means a freshly-repaired hop is still eligible for anomaly detection), then an
//! optional round of "bis" re-traces of targets whose route touched a stretched or cycling
//! interface, then fingerprinting, then rate-limit evaluation of every interface a repair
//! introduced.

use crate::analyzer;
use crate::config::Config;
use crate::error::{CoreResult, ProberError};
use crate::fingerprint;
use crate::ip_table::{IpTable, RateLimitTarget};
use crate::pool;
use crate::prescan;
use crate::prober::ProberFactory;
use crate::rate_limit;
use crate::repairer;
use crate::route_repair::RouteRepair;
use crate::trace::Trace;
use crate::tracer;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Whether [`Engine::run`] drained every phase or stopped early because of an emergency stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Stopped,
}

/// Shared, mutable engine state, handed out to each phase's worker pool for the duration of that
/// phase only (spec §5: phases never overlap, so no two phases ever hold the lock concurrently).
pub struct Engine {
    config: Config,
    ip_table: IpTable,
    traces: Mutex<Vec<Trace>>,
    route_repairs: Mutex<Vec<RouteRepair>>,
    stop: Arc<AtomicBool>,
    prober_factory: Arc<dyn ProberFactory>,
}

impl Engine {
    /// # Errors
    /// Returns [`CoreError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: Config, prober_factory: Arc<dyn ProberFactory>) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ip_table: IpTable::new(),
            traces: Mutex::new(Vec::new()),
            route_repairs: Mutex::new(Vec::new()),
            stop: Arc::new(AtomicBool::new(false)),
            prober_factory,
        })
    }

    #[must_use]
    pub fn ip_table(&self) -> &IpTable {
        &self.ip_table
    }

    #[must_use]
    pub fn traces(&self) -> Vec<Trace> {
        self.traces.lock().clone()
    }

    #[must_use]
    pub fn route_repairs(&self) -> Vec<RouteRepair> {
        self.route_repairs.lock().clone()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Idempotently raise the emergency-stop flag (spec §7, `ToolEnvironment::triggerStop`):
    /// the first caller logs a warning, later callers are silent no-ops.
    pub fn trigger_stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            tracing::warn!("emergency stop triggered, draining in-flight workers before exiting");
        }
    }

    /// Run the full phase sequence against `destinations`. Returns `Ok(RunOutcome::Stopped)`
    /// rather than an error if emergency stop was raised mid-run (spec §7: partial results are
    /// still meaningful, not a failure).
    ///
    /// # Errors
    /// Returns [`CoreError::Prober`] if a [`ProberError::Fatal`] was raised and could not be
    /// absorbed as an emergency stop (should not normally happen: every phase below converts a
    /// fatal prober error into `trigger_stop` and returns early instead of propagating).
    pub fn run(&self, destinations: Vec<Ipv4Addr>) -> CoreResult<RunOutcome> {
        if let Err(e) = self.prescan_phase(&destinations) {
            self.trigger_stop();
            return Err(e.into());
        }
        if self.is_stopped() {
            return Ok(RunOutcome::Stopped);
        }

        if let Err(e) = self.trace_phase(&destinations, 1) {
            self.trigger_stop();
            return Err(e.into());
        }
        if self.is_stopped() {
            return Ok(RunOutcome::Stopped);
        }

        {
            let traces = self.traces.lock();
            for trace in traces.iter() {
                self.ip_table.populate_from_trace(trace);
            }
        }

        if let Err(e) = self.repair_phase() {
            self.trigger_stop();
            return Err(e.into());
        }
        if self.is_stopped() {
            return Ok(RunOutcome::Stopped);
        }

        self.analyze_phase();

        if let Err(e) = self.bis_trace_phase() {
            self.trigger_stop();
            return Err(e.into());
        }
        if self.is_stopped() {
            return Ok(RunOutcome::Stopped);
        }

        if let Err(e) = self.fingerprint_phase() {
            self.trigger_stop();
            return Err(e.into());
        }
        if self.is_stopped() {
            return Ok(RunOutcome::Stopped);
        }

        if let Err(e) = self.rate_limit_phase() {
            self.trigger_stop();
            return Err(e.into());
        }

        if self.is_stopped() {
            Ok(RunOutcome::Stopped)
        } else {
            Ok(RunOutcome::Completed)
        }
    }

    fn prescan_phase(&self, destinations: &[Ipv4Addr]) -> Result<(), ProberError> {
        let results = prescan::prescan(destinations, self.prober_factory.as_ref(), &self.config)?;
        let responsive = results.iter().filter(|(_, ok)| *ok).count();
        tracing::debug!(responsive, total = results.len(), "pre-scanning complete");
        Ok(())
    }

    /// Trace every destination at the given opinion number, appending results to the shared trace
    /// list (spec §4.1; `opinion` is 1 for the first pass, 2.. for bis traces per spec.md §9's
    /// resolved open question).
    fn trace_phase(&self, destinations: &[Ipv4Addr], opinion: u16) -> Result<(), ProberError> {
        if destinations.is_empty() {
            return Ok(());
        }
        let worker_count = self.config.threads.min(destinations.len() as u16).max(1) as usize;
        let ip_table = &self.ip_table;
        let config = &self.config;
        let prober_factory = self.prober_factory.as_ref();
        let stop = &self.stop;

        let results = pool::run_staggered(destinations.to_vec(), worker_count, config.thread_delay, move |_w, target| {
            if stop.load(Ordering::Relaxed) {
                return Ok(None);
            }
            let mut prober = prober_factory.build(config.timeout)?;
            let trace = tracer::trace_route(ip_table, prober.as_mut(), config, target, opinion)?;
            Ok::<Option<Trace>, ProberError>(Some(trace))
        });

        let mut traces = self.traces.lock();
        for result in results {
            if let Some(trace) = result? {
                traces.push(trace);
            }
        }
        Ok(())
    }

    /// Stage 1-3 of the route repairer, then flags every replacement interface as a rate-limit
    /// candidate (spec §4.3's final paragraph; `ToolEnvironment::listRateLimitedCandidates`).
    fn repair_phase(&self) -> Result<(), ProberError> {
        let mut traces = self.traces.lock();

        repairer::mask_unavoidable_anonymous_hops(&mut traces);
        let mut repairs = repairer::offline_repair(&mut traces);
        repairs.extend(repairer::online_repair(&mut traces, self.prober_factory.as_ref(), &self.config, &self.stop)?);
        repairer::reset_unavoidable_anonymous_hops(&mut traces);

        for repair in &repairs {
            let target = traces[repair.representative.0 as usize].target;
            self.ip_table.get_or_create_with(repair.replacement, |entry| {
                entry.set_rate_limit_candidate();
                entry.set_rate_limit_target(RateLimitTarget { target, ttl: repair.ttl });
            });
        }

        drop(traces);
        self.route_repairs.lock().extend(repairs);
        Ok(())
    }

    /// Route analysis and post-processing (spec §4.2): runs single-threaded, after repair so that
    /// repaired hops are included in stretch/cycle detection.
    fn analyze_phase(&self) {
        let mut traces = self.traces.lock();
        analyzer::detect(&self.ip_table, &mut traces);
        analyzer::mitigate(&self.ip_table, &mut traces);
    }

    /// Targets whose measured route touches a stretched or cycling interface (spec §9,
    /// `ToolEnvironment::listProblematicTargets`), deduplicated, used to drive the optional bis
    /// re-trace round.
    fn problematic_targets(&self) -> Vec<Ipv4Addr> {
        let traces = self.traces.lock();
        let mut targets: Vec<Ipv4Addr> = traces
            .iter()
            .filter(|t| t.is_stretched() || t.has_cycles())
            .map(|t| t.target)
            .collect();
        targets.sort_unstable();
        targets.dedup();
        targets
    }

    /// Re-trace every problematic target `config.bis_traces` additional times, each with an
    /// incrementing opinion number starting at 2 (spec §9 resolved open question). These
    /// additional traces are neither re-analyzed nor repaired (spec.md §4.3/§4.1, original's
    /// second-opinion pass is collected but not reprocessed).
    fn bis_trace_phase(&self) -> Result<(), ProberError> {
        if self.config.bis_traces == 0 {
            return Ok(());
        }
        let targets = self.problematic_targets();
        if targets.is_empty() {
            return Ok(());
        }
        for i in 0..self.config.bis_traces {
            if self.is_stopped() {
                break;
            }
            self.trace_phase(&targets, u16::from(i) + 2)?;
        }
        Ok(())
    }

    fn fingerprint_phase(&self) -> Result<(), ProberError> {
        fingerprint::fingerprint_all(&self.ip_table, self.prober_factory.as_ref(), &self.config)
    }

    /// Evaluate the rate-limit of every interface flagged during repair (spec §4.4).
    fn rate_limit_phase(&self) -> Result<(), ProberError> {
        if self.config.rl_experiments_per_round == 0 {
            return Ok(());
        }
        for interface in self.ip_table.rate_limited_ips() {
            if self.is_stopped() {
                break;
            }
            let Some(rl_target) = interface.rate_limit_target() else {
                continue;
            };
            rate_limit::evaluate_candidate(
                &self.ip_table,
                self.prober_factory.as_ref(),
                &self.config,
                interface.address(),
                rl_target,
                &self.stop,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::test_support::ScriptedProber;
    use crate::prober::{Prober, ProbeRecord, ReplyKind};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct ScriptFactory {
        scripts: StdMutex<std::collections::HashMap<Ipv4Addr, Vec<ProbeRecord>>>,
        default_script: Vec<ProbeRecord>,
    }

    impl ProberFactory for ScriptFactory {
        fn build(&self, _timeout: Duration) -> Result<Box<dyn Prober>, ProberError> {
            Ok(Box::new(ScriptedProber::new(self.default_script.clone())))
        }
    }

    fn echo(addr: &str) -> ProbeRecord {
        ProbeRecord { reply_addr: Some(addr.parse().unwrap()), reply_kind: ReplyKind::EchoReply, reply_ttl: 50 }
    }

    #[test]
    fn run_completes_a_minimal_single_target_pass() {
        let mut config = Config::default();
        config.rl_experiments_per_round = 0;
        config.bis_traces = 0;
        config.thread_delay = Duration::from_millis(0);
        config.threads = 4;

        let target: Ipv4Addr = "203.0.113.9".parse().unwrap();
        let factory = Arc::new(ScriptFactory {
            scripts: StdMutex::new(std::collections::HashMap::new()),
            default_script: vec![echo("203.0.113.9")],
        });

        let engine = Engine::new(config, factory).unwrap();
        let outcome = engine.run(vec![target]).unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        let traces = engine.traces();
        assert_eq!(traces.len(), 1);
        assert!(traces[0].reachable);
    }

    #[test]
    fn trigger_stop_is_idempotent() {
        let config = Config::default();
        let factory = Arc::new(ScriptFactory { scripts: StdMutex::new(std::collections::HashMap::new()), default_script: vec![] });
        let engine = Engine::new(config, factory).unwrap();
        assert!(!engine.is_stopped());
        engine.trigger_stop();
        engine.trigger_stop();
        assert!(engine.is_stopped());
    }
}
