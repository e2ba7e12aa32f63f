//! The configuration surface the core reads (spec §6).
//!
//! Parsing command-line options and target lists is the excluded CLI front end's job; by the time
//! a [`Config`] reaches this crate every field has already been validated against its documented
//! range. The `validate_*` free functions are provided so that front end can reuse the same rules
//! the teacher's own `config.rs` applies (`validate_ttl`, `validate_max_inflight`, &c in
//! `examples/zarkdav-trippy/src/main.rs`), rather than re-deriving them.

use crate::error::{CoreError, CoreResult};
use std::time::Duration;

/// Probing protocol, selects which external [`crate::prober::Prober`] implementation is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProberProtocol {
    Icmp,
    Udp,
    Tcp,
}

impl Default for ProberProtocol {
    fn default() -> Self {
        Self::Icmp
    }
}

/// The maximum TTL a trace will probe to before giving up (spec §4.1).
pub const MAX_TTL: u8 = 64;

/// The full configuration surface consumed by the core engine.
#[derive(Debug, Clone)]
pub struct Config {
    pub probing_protocol: ProberProtocol,
    pub timeout: Duration,
    pub regulating_period: Duration,
    pub thread_delay: Duration,
    pub max_anon_hops: u16,
    pub max_cycles: u16,
    pub threads: u16,
    pub bis_traces: u8,
    pub rl_experiments_per_round: u16,
    pub rl_delay_between_experiments: Duration,
    pub rl_min_response_ratio: f64,
    pub verbosity: Verbosity,
}

/// Verbosity levels. The source's option parser has a dangling-`else` ambiguity that permits a
/// fourth, undocumented level; this crate rejects anything outside `{Laconic, PerRoute, Debug}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Laconic,
    PerRoute,
    Debug,
}

impl TryFrom<u8> for Verbosity {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Laconic),
            1 => Ok(Self::PerRoute),
            2 => Ok(Self::Debug),
            other => Err(CoreError::InvalidConfig(format!(
                "verbosity must be 0, 1 or 2, got {other}"
            ))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            probing_protocol: ProberProtocol::Icmp,
            timeout: Duration::from_millis(2500),
            regulating_period: Duration::from_millis(50),
            thread_delay: Duration::from_millis(250),
            max_anon_hops: 3,
            max_cycles: 4,
            threads: 256,
            bis_traces: 2,
            rl_experiments_per_round: 15,
            rl_delay_between_experiments: Duration::from_secs(2),
            rl_min_response_ratio: 5.0,
            verbosity: Verbosity::Laconic,
        }
    }
}

impl Config {
    /// Validate every field against its documented range, as the excluded CLI front end would
    /// before constructing an [`crate::engine::Engine`].
    pub fn validate(&self) -> CoreResult<()> {
        validate_max_anon_hops(self.max_anon_hops)?;
        validate_max_cycles(self.max_cycles)?;
        validate_threads(self.threads)?;
        validate_bis_traces(self.bis_traces)?;
        validate_rl_experiments_per_round(self.rl_experiments_per_round, self.threads)?;
        validate_rl_min_response_ratio(self.rl_min_response_ratio)?;
        Ok(())
    }
}

pub fn validate_max_anon_hops(value: u16) -> CoreResult<()> {
    validate_range("max-anon-hops", value, 1, 255)
}

pub fn validate_max_cycles(value: u16) -> CoreResult<()> {
    validate_range("max-cycles", value, 1, 255)
}

pub fn validate_threads(value: u16) -> CoreResult<()> {
    validate_range("threads", value, 1, 32766)
}

pub fn validate_bis_traces(value: u8) -> CoreResult<()> {
    // [0, 255], 0 disables re-traces: every value of u8 is valid, nothing to reject.
    let _ = value;
    Ok(())
}

pub fn validate_rl_experiments_per_round(value: u16, threads: u16) -> CoreResult<()> {
    if value > threads {
        return Err(CoreError::InvalidConfig(format!(
            "rl-experiments-per-round ({value}) must not exceed threads ({threads})"
        )));
    }
    Ok(())
}

pub fn validate_rl_min_response_ratio(value: f64) -> CoreResult<()> {
    if value <= 0.0 || value >= 100.0 {
        return Err(CoreError::InvalidConfig(format!(
            "rl-min-response-ratio must be in (0.0, 100.0), got {value}"
        )));
    }
    Ok(())
}

fn validate_range(name: &str, value: u16, min: u16, max: u16) -> CoreResult<()> {
    if value < min || value > max {
        return Err(CoreError::InvalidConfig(format!(
            "{name} must be in [{min}, {max}], got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_max_anon_hops() {
        assert!(validate_max_anon_hops(0).is_err());
    }

    #[test]
    fn rejects_rl_experiments_above_threads() {
        assert!(validate_rl_experiments_per_round(300, 256).is_err());
        assert!(validate_rl_experiments_per_round(256, 256).is_ok());
    }

    #[test]
    fn rejects_out_of_range_min_response_ratio() {
        assert!(validate_rl_min_response_ratio(0.0).is_err());
        assert!(validate_rl_min_response_ratio(100.0).is_err());
        assert!(validate_rl_min_response_ratio(5.0).is_ok());
    }

    #[test]
    fn verbosity_rejects_dangling_else_level() {
        assert!(Verbosity::try_from(3).is_err());
        assert_eq!(Verbosity::try_from(2).unwrap(), Verbosity::Debug);
    }
}
