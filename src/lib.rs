//! A TCP DNS load generator.
//!
//! This crate opens TCP connections to a DNS server at a controlled rate,
//! sends one query per connection, collects the response, and accounts for
//! every possible outcome. It is built around a single-threaded,
//! readiness-based event loop: a fixed pool of exchange records is driven
//! through a connect–send–receive state machine, stalled exchanges are
//! garbage collected after a configurable drop time, and throughput, loss,
//! and round-trip statistics are reported on the way.
//!
//! # Modules
//!
//! * [config] holds the run configuration consumed by the driver,
//! * [template] builds or loads the DNS query payload,
//! * [pool] provides the fixed-size exchange slot pool and its lifecycle
//!   lists,
//! * [net] creates the non-blocking sockets and moves bytes,
//! * [pace] decides when and how many connections to initiate,
//! * [stats] aggregates counters and round-trip times,
//! * [run] ties everything together into the driver loop.
//!
//! The `dnsload` binary wraps the library in the command line interface
//! described by its usage text.

pub mod config;
pub mod error;
pub mod net;
pub mod pace;
pub mod pool;
pub mod run;
pub mod stats;
pub mod template;

pub use self::config::Config;
pub use self::error::Error;
pub use self::run::{Driver, ExitReason};
pub use self::template::Template;
