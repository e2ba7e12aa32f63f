//! Fingerprinting phase (spec §2, §4.5's iTTL classification consumer).
//!
//! Grounded in `FingerprintMaker::probe`/`FingerprintingUnit::callback` in
//! `original_source/v1/Code/src/tool/fingerprinting/FingerprintMaker.cpp`: every interface
//! already present in the IP table is probed directly with a single echo-style probe, and a
//! non-zero remaining TTL on the reply feeds `Interface::set_initial_ttl_echo` (spec §3's
//! `iTTL[Echo]` field).

use crate::config::{Config, MAX_TTL};
use crate::error::ProberError;
use crate::ip_table::IpTable;
use crate::pool;
use crate::prober::{ProberFactory, ReplyKind};
use std::net::Ipv4Addr;

/// Per-thread target budget used to size the fingerprinting worker pool, mirroring
/// `FingerprintMaker`'s own thread-sizing loop.
const TARGETS_PER_THREAD: usize = 1000;

/// Probe every interface currently in `ip_table` directly and record its echo-reply iTTL.
///
/// # Errors
/// Propagates the first [`ProberError::Fatal`] encountered by any probing worker.
pub fn fingerprint_all(ip_table: &IpTable, prober_factory: &dyn ProberFactory, config: &Config) -> Result<(), ProberError> {
    let targets = ip_table.list_ips();
    if targets.is_empty() {
        return Ok(());
    }

    let worker_count = pool::size_workers(targets.len(), TARGETS_PER_THREAD, 1, config.threads) as usize;
    let timeout = config.timeout;
    let results = pool::run_staggered(targets, worker_count.max(1), config.thread_delay, move |_w, target| {
        let mut prober = prober_factory.build(timeout)?;
        let record = prober.single_probe(target, MAX_TTL, true)?;
        let ittl = matches!(record.reply_kind, ReplyKind::EchoReply).then_some(record.reply_ttl);
        Ok::<(Ipv4Addr, Option<u8>), ProberError>((target, ittl))
    });

    for result in results {
        let (target, ittl) = result?;
        if let Some(remaining) = ittl {
            if remaining > 0 {
                ip_table.with(target, |e| e.set_initial_ttl_echo(remaining));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::test_support::ScriptedProber;
    use crate::prober::{Prober, ProbeRecord};
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
    fn records_echo_ittl_for_every_known_interface() {
        let table = IpTable::new();
        let addr: Ipv4Addr = "1.1.1.1".parse().unwrap();
        table.create(addr);
        let config = Config::default();
        let factory = FixedFactory {
            script: Mutex::new(vec![ProbeRecord { reply_addr: Some(addr), reply_kind: ReplyKind::EchoReply, reply_ttl: 64 }]),
        };

        fingerprint_all(&table, &factory, &config).unwrap();

        let entry = table.lookup(addr).unwrap();
        assert!(entry.initial_ttl_echo().is_some());
    }

    #[test]
    fn ignores_timeouts() {
        let table = IpTable::new();
        let addr: Ipv4Addr = "1.1.1.2".parse().unwrap();
        table.create(addr);
        let config = Config::default();
        let factory = FixedFactory { script: Mutex::new(vec![ProbeRecord::timeout()]) };

        fingerprint_all(&table, &factory, &config).unwrap();

        let entry = table.lookup(addr).unwrap();
        assert!(entry.initial_ttl_echo().is_none());
    }
}
