//! Network pre-scanning (spec §2, listed first in the phase sequence).
//!
//! Grounded in `NetworkPrescanningUnit::run` in
//! `original_source/v1/Code/src/tool/prescanning/NetworkPrescanningUnit.cpp`: a single fixed-flow
//! probe sent directly to each destination (TTL high enough to guarantee arrival), classified
//! responsive only on a non-anonymous Echo Reply from that exact destination. Unlike the
//! original's `-s`/`--use-pre-scanning` flag, which drops unresponsive targets from the trace
//! phase entirely, this crate keeps prescanning non-filtering: the tracer already handles
//! unreachable destinations on its own (spec §4.1), and dropping targets here would silently
//! narrow the trace phase's contract. Prescanning here surfaces liveness as a cheap, parallel
//! diagnostic pass and fails fast on a broken prober before the more expensive trace phase runs.

use crate::config::{Config, MAX_TTL};
use crate::error::ProberError;
use crate::prober::ProberFactory;
use std::net::Ipv4Addr;

/// Probe every destination once and report which ones answered with a non-anonymous Echo Reply
/// from themselves. The caller decides what, if anything, to do with non-responsive entries; all
/// `destinations` are still eligible for tracing regardless of the outcome here.
///
/// # Errors
/// Propagates the first [`ProberError::Fatal`] encountered by any probing worker.
pub fn prescan(
    destinations: &[Ipv4Addr],
    prober_factory: &dyn ProberFactory,
    config: &Config,
) -> Result<Vec<(Ipv4Addr, bool)>, ProberError> {
    if destinations.is_empty() {
        return Ok(Vec::new());
    }

    let worker_count = crate::pool::size_workers(destinations.len(), 1000, 1, config.threads) as usize;
    let timeout = config.timeout;
    let results = crate::pool::run_staggered(destinations.to_vec(), worker_count.max(1), config.thread_delay, move |_w, target| {
        let mut prober = prober_factory.build(timeout)?;
        let record = prober.single_probe(target, MAX_TTL, true)?;
        let responsive = record.reply_addr == Some(target) && matches!(record.reply_kind, crate::prober::ReplyKind::EchoReply);
        Ok::<(Ipv4Addr, bool), ProberError>((target, responsive))
    });

    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::test_support::ScriptedProber;
    use crate::prober::{Prober, ProbeRecord, ReplyKind};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FixedFactory {
        script: Mutex<Vec<ProbeRecord>>,
    }

    impl ProberFactory for FixedFactory {
        fn build(&self, _timeout: Duration) -> Result<Box<dyn Prober>, ProberError> {
            let script = self.script.lock().unwrap().clone();
            Ok(Box::new(ScriptedProber::new(script)))
        }
    }

    #[test]
    fn classifies_echo_reply_from_destination_as_responsive() {
        let target: Ipv4Addr = "8.8.8.8".parse().unwrap();
        let config = Config::default();
        let factory = FixedFactory {
            script: Mutex::new(vec![ProbeRecord { reply_addr: Some(target), reply_kind: ReplyKind::EchoReply, reply_ttl: 50 }]),
        };

        let results = prescan(&[target], &factory, &config).unwrap();
        assert_eq!(results, vec![(target, true)]);
    }

    #[test]
    fn classifies_timeout_as_unresponsive() {
        let target: Ipv4Addr = "8.8.4.4".parse().unwrap();
        let config = Config::default();
        let factory = FixedFactory { script: Mutex::new(vec![ProbeRecord::timeout()]) };

        let results = prescan(&[target], &factory, &config).unwrap();
        assert_eq!(results, vec![(target, false)]);
    }
}
