//! The narrow external collaborator interface (spec §6).
//!
//! The core never crafts packets and never touches a raw socket: that work belongs to an
//! external `Prober` the engine is handed at construction time. Three wire variants (ICMP,
//! UDP-encapsulated-for-ICMP, TCP-encapsulated-for-ICMP) are interchangeable from the core's point
//! of view — it selects one by [`crate::config::ProberProtocol`] and never inspects the raw
//! packet.

use crate::error::ProberError;
use std::net::Ipv4Addr;
use std::time::Duration;

/// The ICMP-level classification of a reply, as far as the core cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// A regular `Time Exceeded` reply from an intermediate hop.
    TimeExceeded,
    /// An `Echo Reply` from the destination itself.
    EchoReply,
    /// A `Destination Unreachable` reply.
    DestinationUnreachable,
    /// No reply was received before the timeout elapsed.
    Timeout,
}

/// The result of a single probe, as returned by a [`Prober`] implementation (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct ProbeRecord {
    /// The address that replied; `None` for [`ReplyKind::Timeout`] (the anonymous case).
    pub reply_addr: Option<Ipv4Addr>,
    pub reply_kind: ReplyKind,
    /// Remaining TTL carried by the reply packet, used to infer the initial TTL (spec §4.1).
    /// `0` when not applicable (e.g. on timeout).
    pub reply_ttl: u8,
}

impl ProbeRecord {
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.reply_addr.is_none()
    }

    #[must_use]
    pub fn timeout() -> Self {
        Self {
            reply_addr: None,
            reply_kind: ReplyKind::Timeout,
            reply_ttl: 0,
        }
    }
}

/// The capability interface a concrete ICMP/UDP/TCP prober must expose (spec §6, §9 design
/// note "Polymorphic Prober").
pub trait Prober: Send {
    /// Send one probe with a fixed-flow packet identifier towards `dst` at `ttl` and block for a
    /// reply up to the prober's current timeout.
    ///
    /// # Errors
    /// Returns [`ProberError::Fatal`] only for unrecoverable socket failures; a timeout is a
    /// normal, successful [`ProbeRecord::timeout`] return, never an error (spec §7).
    fn single_probe(&mut self, dst: Ipv4Addr, ttl: u8, fixed_flow: bool) -> Result<ProbeRecord, ProberError>;

    /// Drain and return any accumulated debug log since the last call (debug verbosity only).
    fn get_and_clear_log(&mut self) -> String;

    /// Change the probe timeout for subsequent calls (used for the "retry with doubled timeout"
    /// rule in spec §4.1).
    fn set_timeout(&mut self, timeout: Duration);

    /// The timeout currently in effect.
    fn timeout(&self) -> Duration;
}

/// A factory that constructs one [`Prober`] per worker, matching the original's one-prober-per-
/// `Runnable` ownership (`ParisTracerouteTask` owns a `DirectProber` for its lifetime).
pub trait ProberFactory: Send + Sync {
    fn build(&self, timeout: Duration) -> Result<Box<dyn Prober>, ProberError>;
}

#[cfg(test)]
pub mod test_support {
    //! A scripted in-memory [`Prober`] used by unit and integration tests; never a real socket.
    use super::*;
    use std::collections::VecDeque;

    pub struct ScriptedProber {
        script: VecDeque<ProbeRecord>,
        timeout: Duration,
        log: String,
    }

    impl ScriptedProber {
        #[must_use]
        pub fn new(script: Vec<ProbeRecord>) -> Self {
            Self {
                script: script.into(),
                timeout: Duration::from_millis(2500),
                log: String::new(),
            }
        }
    }

    impl Prober for ScriptedProber {
        fn single_probe(&mut self, _dst: Ipv4Addr, ttl: u8, _fixed_flow: bool) -> Result<ProbeRecord, ProberError> {
            self.log.push_str(&format!("probe ttl={ttl}\n"));
            Ok(self.script.pop_front().unwrap_or_else(ProbeRecord::timeout))
        }

        fn get_and_clear_log(&mut self) -> String {
            std::mem::take(&mut self.log)
        }

        fn set_timeout(&mut self, timeout: Duration) {
            self.timeout = timeout;
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }
    }
}
