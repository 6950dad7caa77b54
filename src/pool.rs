//! The exchange slot pool.
//!
//! Every in-flight exchange occupies one slot of a fixed-size pool. Slots
//! are threaded onto four doubly-linked lists (free, connecting, ready,
//! and sent) through index links stored in the slots themselves, so that
//! moving a slot between lifecycle stages never allocates. A bump
//! watermark hands out never-used slots until the pool's tail is
//! exhausted; after that, allocation draws from the free list alone.
//!
//! A slot is on exactly one list at a time and its state tag agrees with
//! the list it is on. The connecting and sent lists are kept in insertion
//! order so the timeout sweeps can stop at the first entry younger than
//! the drop time.

use std::time::Instant;

use mio::net::TcpStream;

//------------ SlotState -----------------------------------------------------

/// The lifecycle state of an exchange slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    /// The slot is unused and eligible for allocation.
    Free,
    /// A TCP connect is in progress on the slot's socket.
    Connecting,
    /// The socket is writable but the query has not been sent yet.
    Ready,
    /// The query went out; the slot awaits the response.
    Sent,
}

//------------ Exchange ------------------------------------------------------

/// One DNS transaction tied to one TCP connection.
#[derive(Debug)]
pub struct Exchange {
    /// The connection's socket; present exactly while the slot is active.
    pub sock: Option<TcpStream>,

    /// The query ID, chosen at allocation and patched into the payload.
    pub id: u16,

    /// Sequence number of this exchange, for debugging.
    pub order: u64,

    /// When the connect was initiated.
    pub ts_connect: Option<Instant>,

    /// When the query was written.
    pub ts_send: Option<Instant>,

    /// When the response was received.
    pub ts_recv: Option<Instant>,

    /// The state tag; agrees with the list the slot is on.
    state: SlotState,

    /// Index of the next slot on the same list.
    next: Option<u32>,

    /// Index of the previous slot on the same list.
    prev: Option<u32>,
}

impl Exchange {
    /// Creates an empty, unlisted slot.
    fn empty() -> Self {
        Exchange {
            sock: None,
            id: 0,
            order: 0,
            ts_connect: None,
            ts_send: None,
            ts_recv: None,
            state: SlotState::Free,
            next: None,
            prev: None,
        }
    }

    /// Returns the slot's lifecycle state.
    pub fn state(&self) -> SlotState {
        self.state
    }
}

//------------ List ----------------------------------------------------------

/// Head and tail of one intrusive slot list.
#[derive(Clone, Copy, Debug)]
struct List {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl List {
    const fn new() -> Self {
        List {
            head: None,
            tail: None,
            len: 0,
        }
    }
}

//------------ Pool ----------------------------------------------------------

/// A fixed-capacity pool of exchange slots.
pub struct Pool {
    /// The slot records; index equals identity.
    slots: Vec<Exchange>,

    /// Bump watermark: slots below this index have been handed out once.
    used: usize,

    free: List,
    connecting: List,
    ready: List,
    sent: List,
}

impl Pool {
    /// Creates a pool with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(capacity, Exchange::empty);
        Pool {
            slots,
            used: 0,
            free: List::new(),
            connecting: List::new(),
            ready: List::new(),
            sent: List::new(),
        }
    }

    /// Returns the pool's capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns how many slots have ever been handed out.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns the length of the list for the given state.
    pub fn list_len(&self, state: SlotState) -> usize {
        self.list(state).len
    }

    /// Returns how many slots currently hold a live exchange.
    pub fn in_flight(&self) -> usize {
        self.connecting.len + self.ready.len + self.sent.len
    }

    /// Returns a reference to the slot at `idx`.
    pub fn slot(&self, idx: usize) -> &Exchange {
        &self.slots[idx]
    }

    /// Returns a mutable reference to the slot at `idx`.
    pub fn slot_mut(&mut self, idx: usize) -> &mut Exchange {
        &mut self.slots[idx]
    }

    /// Returns the index at the head of the list for the given state.
    pub fn head(&self, state: SlotState) -> Option<usize> {
        self.list(state).head.map(|idx| idx as usize)
    }

    /// Returns the index following `idx` on its list.
    pub fn next_on_list(&self, idx: usize) -> Option<usize> {
        self.slots[idx].next.map(|idx| idx as usize)
    }

    /// Takes a free slot out of the pool.
    ///
    /// Draws from the free list first and bump-allocates from the unused
    /// tail otherwise. Returns `None` once both are exhausted. The
    /// returned slot is reset, detached from all lists, and stays in the
    /// free state until the caller enlists it.
    pub fn allocate(&mut self) -> Option<usize> {
        let idx = match self.free.head {
            Some(idx) => {
                let idx = idx as usize;
                self.unlink(idx);
                idx
            }
            None => {
                if self.used >= self.slots.len() {
                    return None;
                }
                self.used += 1;
                self.used - 1
            }
        };
        let slot = &mut self.slots[idx];
        debug_assert!(slot.sock.is_none());
        slot.id = 0;
        slot.order = 0;
        slot.ts_connect = None;
        slot.ts_send = None;
        slot.ts_recv = None;
        slot.state = SlotState::Free;
        Some(idx)
    }

    /// Puts a detached slot onto the list for `state`.
    ///
    /// Released slots go to the head of the free list so they are reused
    /// first; active slots append at the tail, keeping the connecting and
    /// sent lists in initiation order for the sweeps.
    pub fn enlist(&mut self, idx: usize, state: SlotState) {
        self.slots[idx].state = state;
        match state {
            SlotState::Free => self.push_front(idx, state),
            _ => self.push_back(idx, state),
        }
    }

    /// Moves a slot from its current list to the one for `state`.
    pub fn transition(&mut self, idx: usize, state: SlotState) {
        self.unlink(idx);
        self.enlist(idx, state);
    }

    /// Returns a slot to the free list, handing back its socket.
    ///
    /// The caller is responsible for deregistering and closing the socket.
    pub fn retire(&mut self, idx: usize) -> Option<TcpStream> {
        self.unlink(idx);
        let sock = self.slots[idx].sock.take();
        self.enlist(idx, SlotState::Free);
        sock
    }

    fn list(&self, state: SlotState) -> &List {
        match state {
            SlotState::Free => &self.free,
            SlotState::Connecting => &self.connecting,
            SlotState::Ready => &self.ready,
            SlotState::Sent => &self.sent,
        }
    }

    fn list_mut(&mut self, state: SlotState) -> &mut List {
        match state {
            SlotState::Free => &mut self.free,
            SlotState::Connecting => &mut self.connecting,
            SlotState::Ready => &mut self.ready,
            SlotState::Sent => &mut self.sent,
        }
    }

    fn push_front(&mut self, idx: usize, state: SlotState) {
        let old_head = self.list(state).head;
        self.slots[idx].prev = None;
        self.slots[idx].next = old_head;
        match old_head {
            Some(head) => self.slots[head as usize].prev = Some(idx as u32),
            None => self.list_mut(state).tail = Some(idx as u32),
        }
        let list = self.list_mut(state);
        list.head = Some(idx as u32);
        list.len += 1;
    }

    fn push_back(&mut self, idx: usize, state: SlotState) {
        let old_tail = self.list(state).tail;
        self.slots[idx].next = None;
        self.slots[idx].prev = old_tail;
        match old_tail {
            Some(tail) => self.slots[tail as usize].next = Some(idx as u32),
            None => self.list_mut(state).head = Some(idx as u32),
        }
        let list = self.list_mut(state);
        list.tail = Some(idx as u32);
        list.len += 1;
    }

    /// Detaches a slot from the list its state says it is on.
    fn unlink(&mut self, idx: usize) {
        let state = self.slots[idx].state;
        let next = self.slots[idx].next;
        let prev = self.slots[idx].prev;
        match prev {
            Some(prev) => self.slots[prev as usize].next = next,
            None => self.list_mut(state).head = next,
        }
        match next {
            Some(next) => self.slots[next as usize].prev = prev,
            None => self.list_mut(state).tail = prev,
        }
        self.slots[idx].next = None;
        self.slots[idx].prev = None;
        self.list_mut(state).len -= 1;
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    fn active_sum(pool: &Pool) -> usize {
        pool.list_len(SlotState::Free)
            + pool.list_len(SlotState::Connecting)
            + pool.list_len(SlotState::Ready)
            + pool.list_len(SlotState::Sent)
    }

    #[test]
    fn allocate_to_capacity() {
        let mut pool = Pool::new(1001);
        for expected in 0..1001 {
            let idx = pool.allocate().unwrap();
            assert_eq!(idx, expected);
            pool.enlist(idx, SlotState::Connecting);
        }
        assert!(pool.allocate().is_none());
        assert_eq!(pool.used(), 1001);

        // A release makes exactly one slot available again.
        let _ = pool.retire(500);
        assert_eq!(pool.slot(500).state(), SlotState::Free);
        assert_eq!(pool.allocate(), Some(500));
        pool.enlist(500, SlotState::Connecting);
        assert!(pool.allocate().is_none());
    }

    #[test]
    fn list_lengths_track_used() {
        let mut pool = Pool::new(8);
        for _ in 0..5 {
            let idx = pool.allocate().unwrap();
            pool.enlist(idx, SlotState::Connecting);
        }
        pool.transition(1, SlotState::Ready);
        pool.transition(2, SlotState::Sent);
        let _ = pool.retire(3);
        assert_eq!(active_sum(&pool), pool.used());
        assert_eq!(pool.list_len(SlotState::Connecting), 2);
        assert_eq!(pool.list_len(SlotState::Ready), 1);
        assert_eq!(pool.list_len(SlotState::Sent), 1);
        assert_eq!(pool.list_len(SlotState::Free), 1);
        assert_eq!(pool.in_flight(), 4);
    }

    #[test]
    fn states_agree_with_lists() {
        let mut pool = Pool::new(4);
        let a = pool.allocate().unwrap();
        pool.enlist(a, SlotState::Connecting);
        let b = pool.allocate().unwrap();
        pool.enlist(b, SlotState::Connecting);
        pool.transition(a, SlotState::Ready);
        assert_eq!(pool.slot(a).state(), SlotState::Ready);
        assert_eq!(pool.head(SlotState::Ready), Some(a));
        assert_eq!(pool.head(SlotState::Connecting), Some(b));
        pool.transition(a, SlotState::Sent);
        assert_eq!(pool.head(SlotState::Ready), None);
        assert_eq!(pool.head(SlotState::Sent), Some(a));
    }

    #[test]
    fn fifo_order_for_sweeps() {
        let mut pool = Pool::new(4);
        for expected in 0..3 {
            let idx = pool.allocate().unwrap();
            assert_eq!(idx, expected);
            pool.enlist(idx, SlotState::Connecting);
        }
        // Oldest first.
        assert_eq!(pool.head(SlotState::Connecting), Some(0));
        assert_eq!(pool.next_on_list(0), Some(1));
        assert_eq!(pool.next_on_list(1), Some(2));
        assert_eq!(pool.next_on_list(2), None);
    }

    #[test]
    fn unlink_from_middle() {
        let mut pool = Pool::new(4);
        for _ in 0..3 {
            let idx = pool.allocate().unwrap();
            pool.enlist(idx, SlotState::Sent);
        }
        let _ = pool.retire(1);
        assert_eq!(pool.head(SlotState::Sent), Some(0));
        assert_eq!(pool.next_on_list(0), Some(2));
        assert_eq!(pool.next_on_list(2), None);
        assert_eq!(pool.list_len(SlotState::Sent), 2);
    }

    #[test]
    fn free_list_is_lifo() {
        let mut pool = Pool::new(8);
        for _ in 0..4 {
            let idx = pool.allocate().unwrap();
            pool.enlist(idx, SlotState::Connecting);
        }
        let _ = pool.retire(1);
        let _ = pool.retire(3);
        // The most recently released slot is reused first.
        assert_eq!(pool.allocate(), Some(3));
        pool.enlist(3, SlotState::Connecting);
        assert_eq!(pool.allocate(), Some(1));
        pool.enlist(1, SlotState::Connecting);
        // Free list empty again; the bump watermark continues.
        assert_eq!(pool.allocate(), Some(4));
    }

    #[test]
    fn allocate_resets_the_record() {
        let mut pool = Pool::new(2);
        let idx = pool.allocate().unwrap();
        {
            let slot = pool.slot_mut(idx);
            slot.id = 0x1234;
            slot.order = 7;
            slot.ts_connect = Some(Instant::now());
        }
        pool.enlist(idx, SlotState::Connecting);
        let _ = pool.retire(idx);
        let idx = pool.allocate().unwrap();
        let slot = pool.slot(idx);
        assert_eq!(slot.id, 0);
        assert_eq!(slot.order, 0);
        assert!(slot.ts_connect.is_none());
        assert_eq!(slot.state(), SlotState::Free);
    }
}
