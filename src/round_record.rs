//! A single round of the rate-limit scheduler's probing (spec §3, §4.4).

use itertools::Itertools;
use std::net::Ipv4Addr;

/// One round (`r`) of the rate-limit experiment: `len(ratios) == experiments_per_round`, and the
/// total probes sent in this round equal `2^(r-1) * ratios.len()` (spec §3, §8).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RoundRecord {
    round_id: u16,
    ratios: Vec<f64>,
    misc_ips: Vec<Ipv4Addr>,
}

impl RoundRecord {
    #[must_use]
    pub fn new(round_id: u16) -> Self {
        Self {
            round_id,
            ratios: Vec::new(),
            misc_ips: Vec::new(),
        }
    }

    #[must_use]
    pub fn round_id(&self) -> u16 {
        self.round_id
    }

    pub fn record_ratio(&mut self, ratio: f64) {
        self.ratios.push(ratio);
    }

    pub fn record_misc_ip(&mut self, ip: Ipv4Addr) {
        self.misc_ips.push(ip);
    }

    #[must_use]
    pub fn ratios(&self) -> &[f64] {
        &self.ratios
    }

    #[must_use]
    pub fn misc_ips(&self) -> &[Ipv4Addr] {
        &self.misc_ips
    }

    /// Arithmetic mean of the per-experiment success ratios.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.ratios.is_empty() {
            return 0.0;
        }
        self.ratios.iter().sum::<f64>() / self.ratios.len() as f64
    }

    /// Total probes sent across the round: `2^(round_id - 1) * experiments`.
    #[must_use]
    pub fn total_probes(&self) -> u64 {
        let n_r = 1u64 << (self.round_id.saturating_sub(1));
        n_r * self.ratios.len() as u64
    }

    /// Render as the `.rate-limit` line described in spec §6:
    /// `round-id - ratio1 ratio2 ... - Misc IPs: ip (p%), ...`
    #[must_use]
    pub fn to_line(&self) -> String {
        let ratios = self
            .ratios
            .iter()
            .map(|r| format!("{r:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        let mut line = format!("{} - {ratios}", self.round_id);

        if self.misc_ips.is_empty() {
            return line;
        }

        let total_probes = self.total_probes().max(1) as f64;
        let mut sorted = self.misc_ips.clone();
        sorted.sort_unstable();

        line.push_str(" - Misc IPs: ");
        line.push_str(
            &sorted
                .into_iter()
                .dedup_with_count()
                .map(|(count, ip)| {
                    let ratio = (count as f64 / total_probes) * 100.0;
                    format!("{ip} ({ratio:.5}%)")
                })
                .join(", "),
        );
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_probes_follows_geometric_schedule() {
        let mut r = RoundRecord::new(4);
        for _ in 0..15 {
            r.record_ratio(10.0);
        }
        assert_eq!(r.total_probes(), 8 * 15);
    }

    #[test]
    fn mean_matches_scenario_4() {
        // spec §8 scenario 4: means [80, 40, 10, 3], Rmin = 5 -> four rounds then stop.
        let means = [80.0, 40.0, 10.0, 3.0];
        let rmin = 5.0;
        let mut rounds_run = 0;
        for (i, mean) in means.iter().enumerate() {
            let mut r = RoundRecord::new(i as u16 + 1);
            r.record_ratio(*mean);
            rounds_run += 1;
            if r.mean() < rmin {
                break;
            }
        }
        assert_eq!(rounds_run, 4);
    }
}
