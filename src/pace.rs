//! Pacing of new connections.
//!
//! The pacer turns a target connection rate into a due time for the next
//! initiation. The driver waits for readiness at most until that due
//! time; once it has passed, the backlog since then is converted into a
//! batch of connections, clamped by the aggressivity cap so a stall never
//! turns into an unbounded burst.

use std::time::{Duration, Instant};

/// Stretch applied to the connect interval.
///
/// A slight over-estimate makes slow drift land below the target rate
/// rather than above it.
const INTERVAL_STRETCH: f64 = 1.01;

//------------ Pacer ---------------------------------------------------------

/// Decides when and how many connections to initiate.
#[derive(Clone, Copy, Debug)]
pub struct Pacer {
    /// The stretched interval between two initiations.
    interval: Duration,

    /// The target rate in connections per second.
    rate: u32,

    /// Maximum number of connections initiated per tick.
    aggressivity: u32,

    /// When the most recent connect was initiated.
    last: Instant,

    /// When the next connect is due; derived from `last` each tick.
    due: Instant,
}

impl Pacer {
    /// Creates a pacer for the given rate and aggressivity.
    ///
    /// Both must be at least one.
    pub fn new(rate: u32, aggressivity: u32, now: Instant) -> Self {
        Pacer {
            interval: Duration::from_secs_f64(
                INTERVAL_STRETCH / f64::from(rate),
            ),
            rate,
            aggressivity,
            last: now,
            due: now,
        }
    }

    /// Records a connect initiation; the next due time counts from here.
    pub fn record_connect(&mut self, now: Instant) {
        self.last = now;
    }

    /// Starts a tick: computes the pacing wait before the next connect.
    ///
    /// Returns the maximum time to wait for I/O and whether the due time
    /// had already passed when the tick began.
    pub fn tick(&mut self, now: Instant) -> (Duration, bool) {
        self.due = self.last + self.interval;
        if now < self.due {
            (self.due - now, false)
        } else {
            (Duration::ZERO, now > self.due)
        }
    }

    /// Number of connections due, clamped by the aggressivity cap.
    ///
    /// Zero means the tick ended before the due time. Otherwise one
    /// connection is due plus one more for every full interval the due
    /// time lies in the past.
    pub fn batch(&self, now: Instant) -> u32 {
        if now < self.due {
            return 0;
        }
        let backlog = (now - self.due).as_secs_f64() * f64::from(self.rate)
            + 1.0;
        if backlog >= f64::from(self.aggressivity) {
            self.aggressivity
        } else {
            backlog as u32
        }
    }
}

//============ Testing =======================================================
