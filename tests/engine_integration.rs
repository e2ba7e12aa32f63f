//! End-to-end exercise of the phase sequence through the public `Engine` API, using an in-memory
//! scripted `Prober` (never a real socket) — the same test-double shape the unit tests use, but
//! here driving the whole engine rather than a single module.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use trippy_core::config::Config;
use trippy_core::engine::{Engine, RunOutcome};
use trippy_core::prober::{ProbeRecord, Prober, ProberFactory, ReplyKind};
use trippy_core::ProberError;

/// A probe script keyed by destination, shared across every worker: `single_probe` dispatches on
/// its `dst` argument (the real destination the tracer is driving), so the fixture behaves
/// correctly no matter how the engine's worker pool interleaves concurrent traces.
struct SharedScriptProber {
    scripts: Arc<Mutex<HashMap<Ipv4Addr, (Vec<ProbeRecord>, usize)>>>,
    timeout: Duration,
}

impl Prober for SharedScriptProber {
    fn single_probe(&mut self, dst: Ipv4Addr, _ttl: u8, _fixed_flow: bool) -> Result<ProbeRecord, ProberError> {
        let mut scripts = self.scripts.lock().unwrap();
        let Some((script, cursor)) = scripts.get_mut(&dst) else {
            return Ok(ProbeRecord::timeout());
        };
        let record = script.get(*cursor).copied().unwrap_or_else(ProbeRecord::timeout);
        *cursor += 1;
        Ok(record)
    }

    fn get_and_clear_log(&mut self) -> String {
        String::new()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

struct SharedScriptFactory {
    scripts: Arc<Mutex<HashMap<Ipv4Addr, (Vec<ProbeRecord>, usize)>>>,
}

impl SharedScriptFactory {
    fn new(scripts: HashMap<Ipv4Addr, Vec<ProbeRecord>>) -> Self {
        let scripts = scripts.into_iter().map(|(k, v)| (k, (v, 0))).collect();
        Self { scripts: Arc::new(Mutex::new(scripts)) }
    }
}

impl ProberFactory for SharedScriptFactory {
    fn build(&self, timeout: Duration) -> Result<Box<dyn Prober>, ProberError> {
        Ok(Box::new(SharedScriptProber { scripts: self.scripts.clone(), timeout }))
    }
}

fn echo(addr: &str, ttl: u8) -> ProbeRecord {
    ProbeRecord { reply_addr: Some(addr.parse().unwrap()), reply_kind: ReplyKind::EchoReply, reply_ttl: ttl }
}

fn hop(addr: &str, ttl: u8) -> ProbeRecord {
    ProbeRecord { reply_addr: Some(addr.parse().unwrap()), reply_kind: ReplyKind::TimeExceeded, reply_ttl: ttl }
}

#[test]
fn engine_traces_two_targets_and_detects_a_stretch() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("trippy_core=debug"))
        .with_test_writer()
        .try_init()
        .ok();

    let short_target: Ipv4Addr = "198.51.100.1".parse().unwrap();
    let long_target: Ipv4Addr = "198.51.100.2".parse().unwrap();

    // Each script's first entry answers the engine's pre-scanning phase (one probe per
    // destination, spec §2); the rest answers the trace phase that follows.
    let mut scripts = HashMap::new();
    // short_target: reached via 5.5.5.5 at TTL=1.
    scripts.insert(
        short_target,
        vec![echo("198.51.100.1", 60), hop("5.5.5.5", 63), echo("198.51.100.1", 60)],
    );
    // long_target: 5.5.5.5 recurs one hop deeper than in short_target's trace, so once both
    // traces are in the IP table it should be flagged stretched there.
    scripts.insert(
        long_target,
        vec![echo("198.51.100.2", 60), hop("1.1.1.1", 62), hop("5.5.5.5", 61), echo("198.51.100.2", 60)],
    );

    let mut config = Config::default();
    config.bis_traces = 0;
    config.rl_experiments_per_round = 0;
    config.thread_delay = Duration::from_millis(0);
    config.threads = 4;

    let factory = Arc::new(SharedScriptFactory::new(scripts));
    let engine = Engine::new(config, factory).unwrap();

    let outcome = engine.run(vec![short_target, long_target]).unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let traces = engine.traces();
    assert_eq!(traces.len(), 2);
    assert!(traces.iter().all(|t| t.reachable));

    let long_trace = traces.iter().find(|t| t.target == long_target).unwrap();
    assert!(long_trace.is_stretched(), "expected the shared hop to be flagged stretched: {long_trace:?}");
    let post = long_trace.post_processed.as_ref().expect("stretch mitigation produces a post-processed route");
    assert!(post.len() < long_trace.route.len());

    let entry = engine.ip_table().lookup("5.5.5.5".parse().unwrap()).unwrap();
    assert_eq!(entry.min_ttl(), Some(1));
}
