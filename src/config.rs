//! Configuration for a load run.

use std::net::SocketAddr;
use std::time::Duration;

//------------ Configuration Constants ---------------------------------------

/// Default number of connections initiated per second.
pub const DEFAULT_RATE: u32 = 100;

/// Default number of connections initiated per tick when behind.
pub const DEFAULT_AGGRESSIVITY: u32 = 1;

/// Default capacity of the exchange pool.
pub const DEFAULT_CAPACITY: usize = 60_000;

/// The exchange pool must be larger than this.
pub const MIN_CAPACITY: usize = 1000;

/// Default time after which a stalled exchange is dropped.
pub const DEFAULT_DROP_TIME: Duration = Duration::from_secs(1);

/// Smallest random offset that stays clear of the message header.
pub const MIN_RANDOM_OFFSET: usize = 14;

//------------ Family --------------------------------------------------------

/// The IP family the load runs over.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Family {
    /// TCP over IPv4.
    V4,
    /// TCP over IPv6.
    V6,
}

impl Family {
    /// Returns whether the given address belongs to this family.
    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

//------------ DropLimit -----------------------------------------------------

/// A cap on dropped exchanges after which the run aborts.
#[derive(Clone, Copy, Debug)]
pub enum DropLimit {
    /// Abort after this many exchanges were dropped.
    Count(u64),
    /// Abort when more than this percentage of sent queries was dropped.
    ///
    /// The threshold is only tested once more than ten queries were sent.
    Percent(f64),
}

//------------ Diag ----------------------------------------------------------

/// Diagnostic output selectors.
///
/// Each flag corresponds to a key letter of the `-x` option.
#[derive(Clone, Copy, Debug, Default)]
pub struct Diag {
    /// `a`: echo the decoded command line arguments.
    pub args: bool,
    /// `e`: print the reason the main loop stopped.
    pub exit_reason: bool,
    /// `i`: include rate processing details in the final report.
    pub rate: bool,
    /// `T`: dump the query template after the final report.
    pub template: bool,
}

impl Diag {
    /// Decodes a selector string. Unknown key letters are ignored.
    pub fn from_selectors(selectors: &str) -> Self {
        Diag {
            args: selectors.contains('a'),
            exit_reason: selectors.contains('e'),
            rate: selectors.contains('i'),
            template: selectors.contains('T'),
        }
    }
}

//------------ Config --------------------------------------------------------

/// Everything the driver needs to know about a run.
///
/// The command line maps onto this structure; tests build it directly.
#[derive(Clone, Debug)]
pub struct Config {
    /// The server to direct the load at.
    pub server: SocketAddr,

    /// Optional local address to bind sockets to.
    pub local: Option<SocketAddr>,

    /// Connections initiated per second.
    pub rate: u32,

    /// Maximum number of connections initiated per tick.
    pub aggressivity: u32,

    /// Number of additional exchanges initiated back to back at startup.
    pub preload: u32,

    /// Capacity of the exchange pool.
    pub capacity: usize,

    /// Time after which a stalled connect or unanswered query is dropped.
    pub drop_time: Duration,

    /// Interval between two periodic reports, if any.
    pub report: Option<Duration>,

    /// Stop once this many queries were sent.
    pub num_req: Option<u64>,

    /// Stop once this much time has passed since boot.
    pub period: Option<Duration>,

    /// Abort when too many exchanges were dropped.
    pub max_drop: Option<DropLimit>,

    /// Seed for the query ID generator, making runs repeatable.
    pub seed: Option<u64>,

    /// Diagnostic output selectors.
    pub diag: Diag,
}

impl Config {
    /// Creates a configuration with all defaults for the given server.
    pub fn new(server: SocketAddr) -> Self {
        Config {
            server,
            local: None,
            rate: DEFAULT_RATE,
            aggressivity: DEFAULT_AGGRESSIVITY,
            preload: 0,
            capacity: DEFAULT_CAPACITY,
            drop_time: DEFAULT_DROP_TIME,
            report: None,
            num_req: None,
            period: None,
            max_drop: None,
            seed: None,
            diag: Diag::default(),
        }
    }
}

//============ Testing =======================================================
