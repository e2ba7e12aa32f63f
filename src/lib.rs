//! `trippy_core`: a fixed-flow ("Paris") traceroute engine that collects routes towards a set of
//! targets, detects routing anomalies (stretched and cycling interfaces), repairs anonymous hops
//! from cross-trace evidence and targeted re-probing, fingerprints interfaces by their initial
//! TTL, and estimates the rate limit of interfaces implicated in a repair.
//!
//! This crate is the probing and route-reasoning *core*: raw-socket probing, target-list parsing,
//! the CLI front end and output writers are external collaborators. [`engine::Engine`] is the
//! entry point; it is handed a [`config::Config`] and a [`prober::ProberFactory`] and drives the
//! phase sequence described in the crate's design notes (prescan, trace, repair, analyze, bis
//! re-trace, fingerprint, rate-limit).

#![warn(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::option_if_let_else,
    clippy::missing_const_for_fn,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::redundant_pub_crate,
    clippy::must_use_candidate
)]
#![forbid(unsafe_code)]

pub mod analyzer;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod ip_table;
pub mod pool;
pub mod prescan;
pub mod prober;
pub mod rate_limit;
pub mod repairer;
pub mod round_record;
pub mod route_repair;
pub mod trace;
pub mod tracer;

pub use config::Config;
pub use engine::{Engine, RunOutcome};
pub use error::{CoreError, CoreResult, ProberError};
pub use ip_table::IpTable;
pub use prober::{Prober, ProberFactory};
pub use route_repair::RouteRepair;
pub use trace::{Trace, TraceId};
