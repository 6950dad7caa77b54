//! The exchange driver.
//!
//! A single thread owns everything: the readiness poller, the exchange
//! pool, the pacer, and the counters. Each tick waits for readiness at
//! most until the next connect is due, then dispatches completed
//! connects, drains the ready list into sends, collects responses,
//! sweeps stalled exchanges, and finally initiates the connections the
//! pacer asks for. The only suspension point is the poll itself.
//!
//! Registration is per slot: a connecting socket is registered writable
//! under its slot index and re-registered readable once the query went
//! out. Readiness events are dispatched against the slot's current
//! state, so a stale event for a recycled slot falls through harmlessly.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mio::{Events, Interest, Poll, Token};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::{Config, DropLimit};
use crate::error::Error;
use crate::net::{self, RecvOutcome};
use crate::pace::Pacer;
use crate::pool::{Pool, SlotState};
use crate::stats::Stats;
use crate::template::Template;

/// Readiness events drained per poll.
const EVENTS_CAP: usize = 16;

/// Connecting slots examined per timeout sweep.
///
/// The bounds keep a burst of expiries from starving new I/O; leftovers
/// are collected on subsequent ticks.
const CONN_SWEEP: usize = 10;

/// Sent slots examined per timeout sweep.
const SENT_SWEEP: usize = 5;

/// Poll period while draining outstanding exchanges after the last send.
const DRAIN_WAIT: Duration = Duration::from_millis(10);

//------------ ExitReason ----------------------------------------------------

/// Why the driver stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitReason {
    /// A signal interrupted the run.
    Interrupted,
    /// An unrecoverable error occurred; the exit code will say so.
    Fatal,
    /// The configured test period elapsed.
    PeriodElapsed,
    /// The configured number of queries was sent and accounted for.
    NumReqReached,
    /// More exchanges were dropped than the absolute cap allows.
    MaxDropReached,
    /// More exchanges were dropped than the percentage cap allows.
    MaxPdropReached,
}

impl ExitReason {
    /// A human-readable description for the exit diagnostic.
    pub fn describe(self) -> &'static str {
        match self {
            ExitReason::Interrupted => "interrupted",
            ExitReason::Fatal => "got a fatal error",
            ExitReason::PeriodElapsed => "reached test-period",
            ExitReason::NumReqReached => "reached num-request",
            ExitReason::MaxDropReached => "reached max-drop (absolute)",
            ExitReason::MaxPdropReached => "reached max-drop (percent)",
        }
    }
}

//------------ Driver --------------------------------------------------------

/// The top-level load loop.
pub struct Driver {
    /// The run configuration.
    cfg: Config,

    /// The query payload shared by all exchanges.
    template: Template,

    /// The readiness poller; owns all socket registrations.
    poll: Poll,

    /// Reusable event buffer.
    events: Events,

    /// Readiness snapshot of the current tick: (slot, writable, readable).
    pending: Vec<(usize, bool, bool)>,

    /// The exchange slot pool.
    pool: Pool,

    /// The connect scheduler.
    pacer: Pacer,

    /// All the counters.
    stats: Stats,

    /// Query ID generator.
    rng: StdRng,

    /// Set by the signal handler; observed at every loop head.
    interrupted: Arc<AtomicBool>,

    /// Set on unrecoverable errors; ends the loop with a fatal exit.
    fatal: bool,

    /// Stop initiating connects, finish what is in flight.
    draining: bool,

    /// When the run started.
    boot: Instant,

    /// When the next periodic report is due.
    next_report: Option<Instant>,

    /// Scratch buffer for outgoing queries.
    out_buf: BytesMut,

    /// Scratch buffer for incoming responses.
    in_buf: Vec<u8>,
}

impl Driver {
    /// Creates a driver for the given run.
    ///
    /// `interrupted` is typically wired to a SIGINT handler; flipping it
    /// stops the run at the next tick.
    pub fn new(
        cfg: Config,
        template: Template,
        interrupted: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let boot = Instant::now();
        let seed = cfg.seed.unwrap_or_else(rand::random);
        let pool = Pool::new(cfg.capacity);
        let pacer = Pacer::new(cfg.rate, cfg.aggressivity, boot);
        let next_report = cfg.report.map(|every| boot + every);
        Ok(Driver {
            cfg,
            template,
            poll,
            events: Events::with_capacity(EVENTS_CAP),
            pending: Vec::with_capacity(EVENTS_CAP),
            pool,
            pacer,
            stats: Stats::new(),
            rng: StdRng::seed_from_u64(seed),
            interrupted,
            fatal: false,
            draining: false,
            boot,
            next_report,
            out_buf: BytesMut::with_capacity(net::RECV_BUF_LEN),
            in_buf: vec![0; net::RECV_BUF_LEN],
        })
    }

    /// Returns the counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Returns the exchange pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Returns how long the run has been going.
    pub fn elapsed(&self) -> Duration {
        self.boot.elapsed()
    }

    /// Runs the load until a termination predicate fires.
    ///
    /// An error is only returned when the very first connect cannot be
    /// initiated; everything after that is absorbed into the counters
    /// or the fatal flag.
    pub fn run(&mut self) -> Result<ExitReason, Error> {
        self.preload()?;
        let reason = self.drive();
        if self.cfg.diag.exit_reason {
            println!("{}", reason.describe());
        }
        Ok(reason)
    }

    /// Initiates the preload burst.
    ///
    /// At least one exchange goes out before the loop starts; failure of
    /// that very first one means the setup is broken and the run never
    /// happened.
    fn preload(&mut self) -> Result<(), Error> {
        self.stats.comp_conn += u64::from(self.cfg.preload) + 1;
        for i in 0..=self.cfg.preload {
            if let Err(err) = self.initiate_connect() {
                if i == 0 {
                    return Err(Error::Io(err));
                }
                if net::is_local_limit(&err) {
                    self.stats.local_limit += 1;
                }
                warn!("preload connect failed: {}", err);
                break;
            }
        }
        Ok(())
    }

    /// The tick loop.
    fn drive(&mut self) -> ExitReason {
        loop {
            if self.interrupted.load(Ordering::Relaxed) {
                return ExitReason::Interrupted;
            }
            if self.fatal {
                return ExitReason::Fatal;
            }
            self.stats.loops += 1;

            let now = Instant::now();
            if let Some(period) = self.cfg.period {
                if now.duration_since(self.boot) > period {
                    return ExitReason::PeriodElapsed;
                }
            }
            if let (Some(due), Some(every)) =
                (self.next_report, self.cfg.report)
            {
                if now >= due {
                    self.stats.periodic_report();
                    self.next_report = Some(due + every);
                }
            }

            let (wait, late) = if self.draining {
                (DRAIN_WAIT, false)
            } else {
                self.pacer.tick(now)
            };
            if late {
                self.stats.late_conn += 1;
            }

            match self.poll.poll(&mut self.events, Some(wait)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    continue
                }
                Err(err) => {
                    warn!("poll: {}", err);
                    return ExitReason::Fatal;
                }
            }
            self.pending.clear();
            for event in self.events.iter() {
                self.pending.push((
                    event.token().0,
                    event.is_writable(),
                    event.is_readable(),
                ));
            }

            self.complete_connects();
            if self.fatal {
                continue;
            }
            self.send_ready();
            if self.fatal {
                continue;
            }
            self.receive_responses();
            if self.fatal {
                continue;
            }

            let now = Instant::now();
            self.sweep(SlotState::Connecting, now);
            self.sweep(SlotState::Sent, now);

            if let Some(reason) = self.check_termination() {
                return reason;
            }

            if !self.draining {
                let batch = self.pacer.batch(Instant::now());
                if batch == 0 {
                    self.stats.short_wait += 1;
                } else {
                    let batch = self.clamp_to_remaining(batch);
                    if batch > 0 {
                        self.open_batch(batch);
                    }
                }
            }
        }
    }

    /// Caps a connect batch so sends cannot overshoot `num_req`.
    ///
    /// Connections already on their way to a send count against the
    /// request budget; they are replaced only when they fail.
    fn clamp_to_remaining(&self, batch: u32) -> u32 {
        let Some(num_req) = self.cfg.num_req else {
            return batch;
        };
        let committed = self.stats.sends_ok
            + self.pool.list_len(SlotState::Connecting) as u64
            + self.pool.list_len(SlotState::Ready) as u64;
        let remaining = num_req.saturating_sub(committed);
        batch.min(remaining.min(u64::from(u32::MAX)) as u32)
    }

    /// Evaluates the termination predicates at the end of a tick.
    fn check_termination(&mut self) -> Option<ExitReason> {
        if let Some(num_req) = self.cfg.num_req {
            if self.stats.sends_ok >= num_req {
                if self.pool.in_flight() == 0 {
                    return Some(ExitReason::NumReqReached);
                }
                // All requested queries went out; let the outstanding
                // ones finish or time out before reporting.
                self.draining = true;
            }
        }
        let drops = self.stats.drops();
        match self.cfg.max_drop {
            Some(DropLimit::Count(max)) if drops > max => {
                Some(ExitReason::MaxDropReached)
            }
            Some(DropLimit::Percent(max))
                if self.stats.sends_ok > 10
                    && drops as f64 * 100.
                        / self.stats.sends_ok as f64
                        > max =>
            {
                Some(ExitReason::MaxPdropReached)
            }
            _ => None,
        }
    }

    /// Initiates one connect on a freshly allocated slot.
    ///
    /// Pool exhaustion is reported as an out-of-memory error so callers
    /// classify it as a local limit, the same as kernel-side exhaustion.
    fn initiate_connect(&mut self) -> io::Result<()> {
        let now = Instant::now();
        self.pacer.record_connect(now);
        let idx = match self.pool.allocate() {
            Some(idx) => idx,
            None => return Err(io::ErrorKind::OutOfMemory.into()),
        };
        let mut sock =
            match net::open_socket(self.cfg.server, self.cfg.local) {
                Ok(sock) => sock,
                Err(err) => {
                    self.pool.enlist(idx, SlotState::Free);
                    return Err(err);
                }
            };
        if let Err(err) = self.poll.registry().register(
            &mut sock,
            Token(idx),
            Interest::WRITABLE,
        ) {
            self.pool.enlist(idx, SlotState::Free);
            self.fatal = true;
            return Err(err);
        }
        let id = self.rng.gen();
        let order = self.stats.connects_started;
        let slot = self.pool.slot_mut(idx);
        slot.sock = Some(sock);
        slot.ts_connect = Some(now);
        slot.id = id;
        slot.order = order;
        self.pool.enlist(idx, SlotState::Connecting);
        self.stats.connects_started += 1;
        Ok(())
    }

    /// Opens the batch of connections the pacer asked for.
    fn open_batch(&mut self, batch: u32) {
        self.stats.comp_conn += u64::from(batch);
        for _ in 0..batch {
            if let Err(err) = self.initiate_connect() {
                if net::is_local_limit(&err) {
                    self.stats.local_limit += 1;
                } else {
                    warn!("connect: {}", err);
                }
                break;
            }
        }
    }

    /// Completes connects that became writable.
    fn complete_connects(&mut self) {
        for i in 0..self.pending.len() {
            let (idx, writable, _) = self.pending[i];
            if !writable
                || idx >= self.pool.capacity()
                || self.pool.slot(idx).state() != SlotState::Connecting
            {
                continue;
            }
            let err = match self.pool.slot_mut(idx).sock.as_mut() {
                Some(sock) => match sock.take_error() {
                    Ok(pending_err) => pending_err,
                    Err(err) => Some(err),
                },
                None => continue,
            };
            match err {
                Some(err) => {
                    debug!("connect failed: {}", err);
                    self.stats.bad_connect += 1;
                    self.retire(idx);
                }
                None => self.pool.transition(idx, SlotState::Ready),
            }
        }
    }

    /// Sends the query on every slot of the ready list.
    fn send_ready(&mut self) {
        while let Some(idx) = self.pool.head(SlotState::Ready) {
            let id = self.pool.slot(idx).id;
            net::fill_query(&mut self.out_buf, &self.template, id);
            let now = Instant::now();
            let slot = self.pool.slot_mut(idx);
            slot.ts_send = Some(now);
            let sent = match slot.sock.as_mut() {
                Some(sock) => net::send_query(sock, &self.out_buf),
                None => Err(io::ErrorKind::NotConnected.into()),
            };
            match sent {
                Ok(()) => {
                    self.stats.sends_ok += 1;
                    self.pool.transition(idx, SlotState::Sent);
                    if let Some(sock) =
                        self.pool.slot_mut(idx).sock.as_mut()
                    {
                        if let Err(err) = self.poll.registry().reregister(
                            sock,
                            Token(idx),
                            Interest::READABLE,
                        ) {
                            warn!("reregister: {}", err);
                            self.fatal = true;
                            return;
                        }
                    }
                }
                Err(err) => {
                    debug!("send failed: {}", err);
                    self.stats.bad_send += 1;
                    self.retire(idx);
                }
            }
        }
    }

    /// Collects responses on sent slots that became readable.
    fn receive_responses(&mut self) {
        for i in 0..self.pending.len() {
            let (idx, _, readable) = self.pending[i];
            if !readable
                || idx >= self.pool.capacity()
                || self.pool.slot(idx).state() != SlotState::Sent
            {
                continue;
            }
            let query_len = self.template.len();
            let id = self.pool.slot(idx).id;
            let outcome = match self.pool.slot_mut(idx).sock.as_mut() {
                Some(sock) => net::recv_response(
                    sock,
                    &mut self.in_buf,
                    query_len,
                    id,
                ),
                None => continue,
            };
            match outcome {
                Ok(RecvOutcome::Response { rcode }) => {
                    let now = Instant::now();
                    let slot = self.pool.slot_mut(idx);
                    slot.ts_recv = Some(now);
                    let rtt = match slot.ts_send {
                        Some(sent_at) => {
                            now.saturating_duration_since(sent_at)
                        }
                        None => Duration::ZERO,
                    };
                    self.stats
                        .record_response(rtt.as_secs_f64(), rcode);
                    self.retire(idx);
                }
                Ok(RecvOutcome::Again) => {
                    // Spurious wakeup; the slot keeps waiting and the
                    // sweeper collects it if nothing ever arrives.
                    self.stats.recv_errors += 1;
                }
                Ok(RecvOutcome::TooShort) => {
                    self.stats.short_reads += 1;
                    self.retire(idx);
                }
                Ok(RecvOutcome::WrongId) => {
                    self.stats.id_mismatch += 1;
                    self.retire(idx);
                }
                Ok(RecvOutcome::NotResponse) => {
                    self.stats.not_response += 1;
                    self.retire(idx);
                }
                Err(err) => {
                    warn!("recv: {}", err);
                    self.fatal = true;
                    return;
                }
            }
        }
    }

    /// Retires exchanges that outlived the drop time.
    ///
    /// Walks a bounded number of slots from the head of the connecting
    /// or sent list and stops at the first one younger than the drop
    /// time; insertion order guarantees the rest are younger still.
    fn sweep(&mut self, state: SlotState, now: Instant) {
        let bound = match state {
            SlotState::Connecting => CONN_SWEEP,
            _ => SENT_SWEEP,
        };
        for _ in 0..bound {
            let Some(idx) = self.pool.head(state) else { return };
            let slot = self.pool.slot(idx);
            let started = match state {
                SlotState::Connecting => slot.ts_connect,
                _ => slot.ts_send,
            };
            let Some(started) = started else { return };
            if now.saturating_duration_since(started) < self.cfg.drop_time
            {
                return;
            }
            match state {
                SlotState::Connecting => self.stats.conn_timeouts += 1,
                _ => self.stats.sent_timeouts += 1,
            }
            self.retire(idx);
        }
    }

    /// Closes a slot's socket and returns the slot to the free list.
    fn retire(&mut self, idx: usize) {
        if let Some(mut sock) = self.pool.retire(idx) {
            let _ = self.poll.registry().deregister(&mut sock);
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_reasons_describe_themselves() {
        assert_eq!(ExitReason::Interrupted.describe(), "interrupted");
        assert_eq!(
            ExitReason::NumReqReached.describe(),
            "reached num-request"
        );
    }
}
