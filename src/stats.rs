//! Counters and round-trip statistics.
//!
//! Every outcome an exchange can meet has a counter here, updated inline
//! by the driver. Reports go to standard output: they are the product of
//! the tool, not log events, and operators parse them by eye.

use std::time::Duration;

/// Number of response code buckets; the last one absorbs codes ≥ 6.
pub const RCODE_BUCKETS: usize = 7;

//------------ Rtt -----------------------------------------------------------

/// Round-trip time aggregation, in seconds.
#[derive(Clone, Copy, Debug)]
pub struct Rtt {
    /// Smallest observed round-trip time.
    pub min: f64,
    /// Largest observed round-trip time.
    pub max: f64,
    /// Sum of all round-trip times.
    pub sum: f64,
    /// Sum of the squares of all round-trip times.
    pub sum_sq: f64,
}

impl Default for Rtt {
    fn default() -> Self {
        Rtt {
            min: f64::INFINITY,
            max: 0.,
            sum: 0.,
            sum_sq: 0.,
        }
    }
}

impl Rtt {
    /// Folds one round-trip time into the aggregate.
    pub fn record(&mut self, delta: f64) {
        if delta < self.min {
            self.min = delta;
        }
        if delta > self.max {
            self.max = delta;
        }
        self.sum += delta;
        self.sum_sq += delta * delta;
    }

    /// The mean over `count` samples.
    pub fn mean(&self, count: u64) -> f64 {
        self.sum / count as f64
    }

    /// The standard deviation over `count` samples.
    pub fn stddev(&self, count: u64) -> f64 {
        let mean = self.mean(count);
        (self.sum_sq / count as f64 - mean * mean).max(0.).sqrt()
    }
}

//------------ Stats ---------------------------------------------------------

/// All counters of a load run.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Connections whose initiation succeeded.
    pub connects_started: u64,
    /// Queries written in full.
    pub sends_ok: u64,
    /// Valid responses received.
    pub receives_ok: u64,
    /// Initiations refused by local resource limits.
    pub local_limit: u64,
    /// Responses shorter than the query.
    pub short_reads: u64,
    /// Responses whose ID did not match.
    pub id_mismatch: u64,
    /// Messages received with the QR bit clear.
    pub not_response: u64,
    /// Connects that completed with an error.
    pub bad_connect: u64,
    /// Connects dropped after the drop time.
    pub conn_timeouts: u64,
    /// Queries whose send failed.
    pub bad_send: u64,
    /// Queries unanswered within the drop time.
    pub sent_timeouts: u64,
    /// Transient receive errors.
    pub recv_errors: u64,
    /// Main loop iterations.
    pub loops: u64,
    /// Ticks that began past the due time.
    pub late_conn: u64,
    /// Connections the scheduler asked for.
    pub comp_conn: u64,
    /// Ticks that ended with no connection due.
    pub short_wait: u64,
    /// Response code histogram.
    pub rcodes: [u64; RCODE_BUCKETS],
    /// Round-trip aggregation over valid responses.
    pub rtt: Rtt,
}

impl Stats {
    /// Creates a zeroed set of counters.
    pub fn new() -> Self {
        Default::default()
    }

    /// Accounts for one valid response.
    pub fn record_response(&mut self, rtt_secs: f64, rcode: u8) {
        self.receives_ok += 1;
        self.rtt.record(rtt_secs);
        self.rcodes[(rcode as usize).min(RCODE_BUCKETS - 1)] += 1;
    }

    /// Exchanges sent but (so far) unanswered.
    pub fn drops(&self) -> u64 {
        self.sends_ok.saturating_sub(self.receives_ok)
    }

    /// The summary line shared by periodic and final reports.
    fn summary_line(&self) -> String {
        format!(
            "connect: {}, sent: {}, received: {} \
             (embryonics: {}, drops: {})",
            self.connects_started,
            self.sends_ok,
            self.receives_ok,
            self.connects_started as i64 - self.sends_ok as i64,
            self.sends_ok as i64 - self.receives_ok as i64,
        )
    }

    /// Prints an intermediate report.
    ///
    /// An in-transit response can show up as a drop here; the final
    /// report settles the account.
    pub fn periodic_report(&self) {
        if self.connects_started == 0 {
            println!();
            return;
        }
        let mut line = self.summary_line();
        if self.receives_ok != 0 {
            line.push_str(&format!(
                " average: {:.3} ms",
                self.rtt.mean(self.receives_ok) * 1e3
            ));
        }
        println!("{}", line);
    }

    /// Prints the final report.
    ///
    /// `instrumentation` carries the pool's used/capacity pair and turns
    /// on the rate processing details.
    pub fn final_report(
        &self,
        elapsed: Duration,
        expected_rate: u32,
        instrumentation: Option<(usize, usize)>,
    ) {
        println!("{}", self.summary_line());
        println!(
            "local limits: {}, bad connects: {}, connect time outs: {}",
            self.local_limit, self.bad_connect, self.conn_timeouts,
        );
        println!(
            "bad sends: {}, bad recvs: {}, recv time outs: {}",
            self.bad_send, self.recv_errors, self.sent_timeouts,
        );
        println!(
            "too shorts: {}, bad IDs: {}, not responses: {}",
            self.short_reads, self.id_mismatch, self.not_response,
        );
        println!(
            "rcode counters:\n noerror: {}, formerr: {}, servfail: {}\n \
             nxdomain: {}, noimp: {}, refused: {}, others: {}",
            self.rcodes[0],
            self.rcodes[1],
            self.rcodes[2],
            self.rcodes[3],
            self.rcodes[4],
            self.rcodes[5],
            self.rcodes[6],
        );
        let secs = elapsed.as_secs_f64();
        if secs > 0. {
            println!(
                "rate: {:.6} (expected {})",
                self.receives_ok as f64 / secs,
                expected_rate,
            );
        }
        if let Some((used, capacity)) = instrumentation {
            println!(
                "loops: {}, computed connects: {}, late connects: {}, \
                 short waits: {}",
                self.loops, self.comp_conn, self.late_conn, self.short_wait,
            );
            println!(
                "bad connects: {}, connect time outs: {}, recv errors: {}, \
                 recv time outs: {}",
                self.bad_connect,
                self.conn_timeouts,
                self.recv_errors,
                self.sent_timeouts,
            );
            println!("memory: used({}) / allocated({})", used, capacity);
        }
        if self.receives_ok != 0 {
            println!(
                "RTT: min/avg/max/stddev:  {:.3}/{:.3}/{:.3}/{:.3} ms",
                self.rtt.min * 1e3,
                self.rtt.mean(self.receives_ok) * 1e3,
                self.rtt.max * 1e3,
                self.rtt.stddev(self.receives_ok) * 1e3,
            );
        }
        println!();
    }
}

//============ Testing =======================================================
