//! The global, concurrent IP table (spec §3, §4.5).
//!
//! A bucketed hash map keyed by IPv4 address, each bucket an address-ordered small list
//! (`IPLookUpTable` in the original, see `original_source/v1/Code/src/tool/structure/IPLookUpTable.cpp`).
//! Insert is idempotent on the address key.

use crate::round_record::RoundRecord;
use crate::trace::Trace;
use itertools::Itertools;
use parking_lot::RwLock;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Number of buckets in the table, keyed by the high 20 bits of the address (spec §3).
const BUCKET_COUNT: usize = 1 << 20;

/// The default timeout assigned to a freshly-created [`Interface`] (spec §4.1 "Timeout
/// adaptation"; mirrors `IPTableEntry::DEFAULT_TIMEOUT_SECONDS`).
const DEFAULT_PREFERRED_TIMEOUT: Duration = Duration::from_millis(2500);

/// The inferred initial-TTL class of a reply, rounded up to the next well-known boundary
/// (spec §4.1 "iTTL inference").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IttlClass {
    T32,
    T64,
    T128,
    T255,
}

impl IttlClass {
    /// Classify a remaining TTL observed on a reply. Returns `None` for a remaining TTL of `0`,
    /// which the original treats as "unknown" rather than a genuine observation.
    #[must_use]
    pub fn from_remaining_ttl(remaining: u8) -> Option<Self> {
        match remaining {
            0 => None,
            1..=32 => Some(Self::T32),
            33..=64 => Some(Self::T64),
            65..=128 => Some(Self::T128),
            _ => Some(Self::T255),
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::T32 => 32,
            Self::T64 => 64,
            Self::T128 => 128,
            Self::T255 => 255,
        }
    }
}

/// The destination+TTL context that made this interface a rate-limit candidate (spec §3).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RateLimitTarget {
    pub target: Ipv4Addr,
    pub ttl: u8,
}

/// Per-interface statistics accumulated by the tracer, analyzer, repairer and fingerprinter.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Interface {
    address: Ipv4Addr,
    min_ttl: Option<u8>,
    hop_counts: Vec<u8>,
    preferred_timeout: Duration,
    initial_ttl_time_exceeded: Option<IttlClass>,
    initial_ttl_echo: Option<IttlClass>,
    inconsistent_ittl: bool,
    rate_limit_candidate: bool,
    rate_limit_target: Option<RateLimitTarget>,
    stretched_ttls: Vec<u8>,
    in_cycle_ttls: Vec<u8>,
    round_records: Vec<RoundRecord>,
}

impl Interface {
    fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            min_ttl: None,
            hop_counts: Vec::new(),
            preferred_timeout: DEFAULT_PREFERRED_TIMEOUT,
            initial_ttl_time_exceeded: None,
            initial_ttl_echo: None,
            inconsistent_ittl: false,
            rate_limit_candidate: false,
            rate_limit_target: None,
            stretched_ttls: Vec::new(),
            in_cycle_ttls: Vec::new(),
            round_records: Vec::new(),
        }
    }

    #[must_use]
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Minimum observed hop count (TTL), i.e. `min(hop_counts)`, or `None` if never recorded.
    #[must_use]
    pub fn min_ttl(&self) -> Option<u8> {
        self.min_ttl
    }

    #[must_use]
    pub fn hop_counts(&self) -> &[u8] {
        &self.hop_counts
    }

    #[must_use]
    pub fn preferred_timeout(&self) -> Duration {
        self.preferred_timeout
    }

    pub fn set_preferred_timeout(&mut self, timeout: Duration) {
        self.preferred_timeout = timeout;
    }

    /// Overwrite `min_ttl` directly, bypassing `hop_counts` bookkeeping. The tracer uses this
    /// once per trace to record the hop count at which the destination itself replied
    /// (`ParisTracerouteTask::run`'s `targetIP->setTTL(probeTTL)`); it is distinct from
    /// [`Self::record_hop_count`], which only ever runs against intermediate hops during the
    /// dictionary-population pass (spec §4.1, §4.5).
    pub fn set_min_ttl(&mut self, ttl: u8) {
        self.min_ttl = Some(ttl);
    }

    /// Record a new observed hop count, maintaining `min(hop_counts) == min_ttl` (spec §8).
    /// Every observation is pushed, including repeats: `hop_counts` is a frequency log, not a
    /// set, and the stretch/cycle histograms divide by its full length.
    pub fn record_hop_count(&mut self, hop_count: u8) {
        match self.min_ttl {
            None => {
                self.min_ttl = Some(hop_count);
            }
            Some(current_min) if hop_count < current_min => {
                self.min_ttl = Some(hop_count);
            }
            _ => {}
        }
        self.hop_counts.push(hop_count);
        debug_assert_eq!(
            self.min_ttl,
            self.hop_counts.iter().copied().min(),
            "min_ttl invariant broken"
        );
    }

    #[must_use]
    pub fn is_rate_limit_candidate(&self) -> bool {
        self.rate_limit_candidate
    }

    pub fn set_rate_limit_candidate(&mut self) {
        self.rate_limit_candidate = true;
    }

    #[must_use]
    pub fn rate_limit_target(&self) -> Option<RateLimitTarget> {
        self.rate_limit_target
    }

    pub fn set_rate_limit_target(&mut self, target: RateLimitTarget) {
        self.rate_limit_target = Some(target);
    }

    /// Append a TTL at which this interface was observed stretched (spec §4.2). Duplicates are
    /// kept; they feed the per-TTL percentage histogram at serialize time (spec §9 design note).
    pub fn add_stretched_ttl(&mut self, ttl: u8) {
        self.stretched_ttls.push(ttl);
    }

    pub fn add_in_cycle_ttl(&mut self, ttl: u8) {
        self.in_cycle_ttls.push(ttl);
    }

    #[must_use]
    pub fn is_stretched(&self) -> bool {
        !self.stretched_ttls.is_empty()
    }

    #[must_use]
    pub fn is_cycling(&self) -> bool {
        !self.in_cycle_ttls.is_empty()
    }

    #[must_use]
    pub fn stretched_ttls(&self) -> &[u8] {
        &self.stretched_ttls
    }

    #[must_use]
    pub fn in_cycle_ttls(&self) -> &[u8] {
        &self.in_cycle_ttls
    }

    /// Latch the first observed initial-TTL for Time-Exceeded replies; flag inconsistency if a
    /// later, different, non-zero value is seen (spec §4.5).
    pub fn set_initial_ttl_time_exceeded(&mut self, remaining_ttl: u8) {
        let Some(class) = IttlClass::from_remaining_ttl(remaining_ttl) else {
            return;
        };
        match self.initial_ttl_time_exceeded {
            None => self.initial_ttl_time_exceeded = Some(class),
            Some(existing) if existing != class => self.inconsistent_ittl = true,
            Some(_) => {}
        }
    }

    pub fn set_initial_ttl_echo(&mut self, remaining_ttl: u8) {
        self.initial_ttl_echo = IttlClass::from_remaining_ttl(remaining_ttl);
    }

    #[must_use]
    pub fn initial_ttl_time_exceeded(&self) -> Option<IttlClass> {
        if self.inconsistent_ittl {
            None
        } else {
            self.initial_ttl_time_exceeded
        }
    }

    #[must_use]
    pub fn initial_ttl_echo(&self) -> Option<IttlClass> {
        self.initial_ttl_echo
    }

    #[must_use]
    pub fn inconsistent_ittl(&self) -> bool {
        self.inconsistent_ittl
    }

    #[must_use]
    pub fn round_records(&self) -> &[RoundRecord] {
        &self.round_records
    }

    #[must_use]
    pub fn has_round_records(&self) -> bool {
        !self.round_records.is_empty()
    }

    pub fn push_round_record(&mut self, record: RoundRecord) {
        self.round_records.push(record);
    }

    /// Percentage histogram of the TTLs at which this interface was observed stretched, computed
    /// only at serialize time per the append-only-log design note (spec §9).
    #[must_use]
    pub fn stretch_histogram(&self) -> Vec<(u8, f64)> {
        histogram(&self.stretched_ttls)
    }

    #[must_use]
    pub fn cycle_histogram(&self) -> Vec<(u8, f64)> {
        histogram(&self.in_cycle_ttls)
    }

    /// Render as the `.ip` dictionary line described in spec §6.
    #[must_use]
    pub fn to_dictionary_line(&self) -> String {
        let min_ttl = self
            .min_ttl
            .map_or_else(|| "*".to_string(), |v| v.to_string());
        let te = self
            .initial_ttl_time_exceeded()
            .map_or_else(|| "*".to_string(), |v| v.as_u8().to_string());
        let echo = self
            .initial_ttl_echo
            .map_or_else(|| "*".to_string(), |v| v.as_u8().to_string());
        let mut line = format!("{} - {min_ttl} - <{te},{echo}>", self.address);
        if self.rate_limit_candidate {
            line.push_str(" | Might be rate-limited");
        }
        if !self.stretched_ttls.is_empty() {
            line.push_str(" | Stretched [");
            line.push_str(&format_histogram(&self.stretch_histogram()));
            line.push(']');
        }
        if !self.in_cycle_ttls.is_empty() {
            line.push_str(" | Cycling [");
            line.push_str(&format_histogram(&self.cycle_histogram()));
            line.push(']');
        }
        line
    }
}

fn histogram(values: &[u8]) -> Vec<(u8, f64)> {
    if values.is_empty() {
        return Vec::new();
    }
    let total = values.len() as f64;
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    sorted
        .into_iter()
        .dedup_with_count()
        .map(|(count, ttl)| (ttl, (count as f64 / total) * 100.0))
        .collect()
}

fn format_histogram(entries: &[(u8, f64)]) -> String {
    entries
        .iter()
        .map(|(ttl, pct)| format!("{ttl} - {pct:.5}%"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A concurrent, bucketed IP dictionary. Insert (`create`) is idempotent: a second `create` for
/// an existing address returns `None` and never replaces the existing entry (spec §3).
pub struct IpTable {
    buckets: Vec<RwLock<Vec<Interface>>>,
}

impl Default for IpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IpTable {
    #[must_use]
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, || RwLock::new(Vec::new()));
        Self { buckets }
    }

    fn bucket_index(address: Ipv4Addr) -> usize {
        let raw = u32::from(address) as usize;
        (raw >> 12) % BUCKET_COUNT
    }

    /// Create a new entry for `address`, or return `None` if one already exists.
    pub fn create(&self, address: Ipv4Addr) -> Option<()> {
        let idx = Self::bucket_index(address);
        let mut bucket = self.buckets[idx].write();
        if bucket.iter().any(|e| e.address == address) {
            return None;
        }
        let pos = bucket.partition_point(|e| u32::from(e.address) < u32::from(address));
        bucket.insert(pos, Interface::new(address));
        Some(())
    }

    /// Look up `address`, creating it first if absent, and apply `f` to the entry, returning
    /// `f`'s result. This is the only way callers mutate an [`Interface`]: the lock is held only
    /// across this single call, never across a probe (spec §5).
    pub fn get_or_create_with<R>(&self, address: Ipv4Addr, f: impl FnOnce(&mut Interface) -> R) -> R {
        let idx = Self::bucket_index(address);
        let mut bucket = self.buckets[idx].write();
        if let Some(entry) = bucket.iter_mut().find(|e| e.address == address) {
            return f(entry);
        }
        let pos = bucket.partition_point(|e| u32::from(e.address) < u32::from(address));
        bucket.insert(pos, Interface::new(address));
        f(&mut bucket[pos])
    }

    /// Apply `f` to the entry for `address` if it exists.
    pub fn with<R>(&self, address: Ipv4Addr, f: impl FnOnce(&mut Interface) -> R) -> Option<R> {
        let idx = Self::bucket_index(address);
        let mut bucket = self.buckets[idx].write();
        bucket.iter_mut().find(|e| e.address == address).map(f)
    }

    /// Return a snapshot clone of the entry for `address`, if present.
    #[must_use]
    pub fn lookup(&self, address: Ipv4Addr) -> Option<Interface> {
        let idx = Self::bucket_index(address);
        let bucket = self.buckets[idx].read();
        bucket.iter().find(|e| e.address == address).cloned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.read().is_empty())
    }

    #[must_use]
    pub fn total_ips(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    /// All addresses currently present, in ascending address order within each bucket (buckets
    /// themselves are not globally sorted, matching the original's per-bucket-only ordering).
    #[must_use]
    pub fn list_ips(&self) -> Vec<Ipv4Addr> {
        self.buckets
            .iter()
            .flat_map(|b| b.read().iter().map(Interface::address).collect::<Vec<_>>())
            .collect()
    }

    fn filter_snapshot(&self, pred: impl Fn(&Interface) -> bool) -> Vec<Interface> {
        self.buckets
            .iter()
            .flat_map(|b| {
                b.read()
                    .iter()
                    .filter(|e| pred(e))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[must_use]
    pub fn stretched_ips(&self) -> Vec<Interface> {
        self.filter_snapshot(Interface::is_stretched)
    }

    #[must_use]
    pub fn in_cycles_ips(&self) -> Vec<Interface> {
        self.filter_snapshot(Interface::is_cycling)
    }

    #[must_use]
    pub fn rate_limited_ips(&self) -> Vec<Interface> {
        self.filter_snapshot(|e| e.rate_limit_candidate && e.rate_limit_target.is_some())
    }

    /// Look up `address`, creating it with `timeout` as its starting preferred timeout if
    /// absent, and return the timeout now in effect. The timeout is only ever set at creation
    /// (`IPTableEntry::setPreferredTimeout` is called once, from `ParisTracerouteTask`'s
    /// constructor); later calls for the same address leave it untouched.
    pub fn ensure_preferred_timeout(&self, address: Ipv4Addr, timeout: Duration) -> Duration {
        let idx = Self::bucket_index(address);
        let mut bucket = self.buckets[idx].write();
        if let Some(entry) = bucket.iter().find(|e| e.address == address) {
            return entry.preferred_timeout;
        }
        let mut entry = Interface::new(address);
        entry.preferred_timeout = timeout;
        let pos = bucket.partition_point(|e| u32::from(e.address) < u32::from(address));
        bucket.insert(pos, entry);
        timeout
    }

    /// Populate the dictionary from a single completed trace's observed route.
    ///
    /// This is a single-threaded pass run once over every collected trace after tracing has
    /// finished and before analysis or repair (`ToolEnvironment::recordRouteStepsInDictionnary`
    /// in `original_source/v1/Code/src/tool/ToolEnvironment.cpp`): the tracer itself never
    /// touches the IP table, it only builds `Trace`/`RouteHop` values.
    pub fn populate_from_trace(&self, trace: &Trace) {
        if !trace.has_valid_route() {
            return;
        }
        for (i, hop) in trace.route.iter().enumerate() {
            if hop.is_anonymous() {
                continue;
            }
            let ttl = (i + 1) as u8;
            self.get_or_create_with(hop.reply_addr, |entry| {
                entry.record_hop_count(ttl);
                entry.set_initial_ttl_time_exceeded(hop.reply_ttl);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_idempotent() {
        let table = IpTable::new();
        let a: Ipv4Addr = "10.0.0.1".parse().unwrap();
        assert!(table.create(a).is_some());
        assert!(table.create(a).is_none());
        assert_eq!(table.total_ips(), 1);
    }

    #[test]
    fn record_hop_count_maintains_min_invariant() {
        let mut iface = Interface::new("10.0.0.1".parse().unwrap());
        for h in [5, 3, 8, 1, 9] {
            iface.record_hop_count(h);
            assert_eq!(iface.min_ttl(), iface.hop_counts().iter().copied().min());
        }
        assert_eq!(iface.min_ttl(), Some(1));
    }

    #[test]
    fn ittl_classification_rounds_up() {
        assert_eq!(IttlClass::from_remaining_ttl(0), None);
        assert_eq!(IttlClass::from_remaining_ttl(33), Some(IttlClass::T64));
        assert_eq!(IttlClass::from_remaining_ttl(64), Some(IttlClass::T64));
        assert_eq!(IttlClass::from_remaining_ttl(65), Some(IttlClass::T128));
        assert_eq!(IttlClass::from_remaining_ttl(200), Some(IttlClass::T255));
    }

    #[test]
    fn inconsistent_ittl_flag_set_on_disagreement() {
        let mut iface = Interface::new("10.0.0.1".parse().unwrap());
        iface.set_initial_ttl_time_exceeded(64); // -> T64
        assert!(!iface.inconsistent_ittl());
        iface.set_initial_ttl_time_exceeded(0); // ignored
        assert!(!iface.inconsistent_ittl());
        iface.set_initial_ttl_time_exceeded(200); // -> T255, disagrees
        assert!(iface.inconsistent_ittl());
    }

    #[test]
    fn get_or_create_with_creates_then_reuses() {
        let table = IpTable::new();
        let a: Ipv4Addr = "192.168.1.1".parse().unwrap();
        table.get_or_create_with(a, |e| e.record_hop_count(4));
        table.get_or_create_with(a, |e| e.record_hop_count(2));
        let entry = table.lookup(a).unwrap();
        assert_eq!(entry.min_ttl(), Some(2));
        assert_eq!(table.total_ips(), 1);
    }

    /// Property-style fuzz of the `min_ttl` invariant (spec §8: `I.min_ttl == min(I.hop_counts)`
    /// after every `recordHopCount`), over random hop-count sequences rather than a handful of
    /// hand-picked ones.
    #[test]
    fn record_hop_count_invariant_holds_over_random_sequences() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut iface = Interface::new(Ipv4Addr::new(10, 0, 0, 1));
            let len = rng.gen_range(1..20);
            for _ in 0..len {
                iface.record_hop_count(rng.gen_range(1..=MAX_TTL_FOR_TEST));
                assert_eq!(iface.min_ttl(), iface.hop_counts().iter().copied().min());
            }
        }
    }

    const MAX_TTL_FOR_TEST: u8 = 64;
}
