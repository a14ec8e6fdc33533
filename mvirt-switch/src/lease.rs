//! Lease bookkeeping for multi-producer rings.
//!
//! Producers reserve disjoint slot ranges under the ring's bookkeeping lock,
//! fill them without holding it, and report completion. Completed ranges are
//! folded into `published_tail` strictly in reservation order, so a consumer
//! never observes a slot whose producer is still copying into it.
//!
//! Cursors (all in `0..num_slots`):
//!
//! ```text
//!   owner_cursor <= published_tail <= lease_high_water   (modulo wrap)
//!   [owner_cursor, published_tail)      ready for the consumer
//!   [published_tail, lease_high_water)  leased, copies in flight
//!   [lease_high_water, owner_cursor-1)  free
//! ```
//!
//! One slot always stays empty so a full ring differs from an empty one.

/// Which side of the ring is asking for space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Free slots a producer may still lease
    Producer,
    /// Published slots waiting for the consumer
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TicketState {
    Free,
    Reserved,
    Completed(u32),
}

/// A reservation of `count` slots starting at `start`.
///
/// Must be handed back through [`LeaseBook::complete`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a lease must be completed or the ring stalls"]
pub struct LeaseTicket {
    index: u32,
    start: u32,
    count: u32,
}

impl LeaseTicket {
    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

#[derive(Debug)]
pub struct LeaseBook {
    num_slots: u32,
    owner_cursor: u32,
    lease_high_water: u32,
    published_tail: u32,
    tickets: Box<[TicketState]>,
    next_ticket: u32,
}

impl LeaseBook {
    pub fn new(num_slots: u32) -> Self {
        assert!(num_slots >= 2, "ring needs at least two slots");
        Self {
            num_slots,
            owner_cursor: 0,
            lease_high_water: 0,
            published_tail: 0,
            tickets: vec![TicketState::Free; num_slots as usize].into_boxed_slice(),
            next_ticket: 0,
        }
    }

    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    pub fn owner_cursor(&self) -> u32 {
        self.owner_cursor
    }

    pub fn lease_high_water(&self) -> u32 {
        self.lease_high_water
    }

    pub fn published_tail(&self) -> u32 {
        self.published_tail
    }

    /// Position `n` slots after `pos`.
    #[inline]
    pub fn advance(&self, pos: u32, n: u32) -> u32 {
        ((pos as u64 + n as u64) % self.num_slots as u64) as u32
    }

    /// Slots from `from` forward to `to`.
    #[inline]
    pub fn distance(&self, from: u32, to: u32) -> u32 {
        if to >= from {
            to - from
        } else {
            to + self.num_slots - from
        }
    }

    #[inline]
    fn next_index(&self, i: u32) -> u32 {
        if i + 1 == self.num_slots { 0 } else { i + 1 }
    }

    pub fn space(&self, side: Side) -> u32 {
        match side {
            Side::Producer => {
                let busy = self.distance(self.owner_cursor, self.lease_high_water);
                self.num_slots - 1 - busy
            }
            Side::Consumer => self.distance(self.owner_cursor, self.published_tail),
        }
    }

    /// Reserve `n` slots.
    ///
    /// # Panics
    ///
    /// If `n` exceeds the producer space or the ticket table wrapped onto an
    /// outstanding reservation.
    pub fn lease(&mut self, n: u32) -> LeaseTicket {
        let space = self.space(Side::Producer);
        assert!(n <= space, "lease of {n} slots exceeds free space {space}");

        let index = self.next_ticket;
        assert_eq!(
            self.tickets[index as usize],
            TicketState::Free,
            "lease ticket {index} still outstanding"
        );
        self.tickets[index as usize] = TicketState::Reserved;
        self.next_ticket = self.next_index(index);

        let start = self.lease_high_water;
        self.lease_high_water = self.advance(start, n);
        LeaseTicket {
            index,
            start,
            count: n,
        }
    }

    /// True when no reservation was made after `ticket`.
    pub fn is_latest(&self, ticket: &LeaseTicket) -> bool {
        self.next_index(ticket.index) == self.next_ticket
    }

    /// Hand back the unused tail of the most recent lease. Returns the end
    /// of the part that was used.
    pub fn rollback(&mut self, ticket: &LeaseTicket, used: u32) -> u32 {
        assert!(self.is_latest(ticket), "rollback by a non-latest leaseholder");
        assert!(used <= ticket.count, "used {used} of a {}-slot lease", ticket.count);
        self.lease_high_water = self.advance(ticket.start, used);
        self.lease_high_water
    }

    /// Return an unused most recent lease: its slots and its ticket entry
    /// both become free again.
    pub fn cancel(&mut self, ticket: LeaseTicket) {
        assert!(self.is_latest(&ticket), "cancel by a non-latest leaseholder");
        assert_eq!(
            self.tickets[ticket.index as usize],
            TicketState::Reserved,
            "cancel of ticket {} that is not reserved",
            ticket.index
        );
        self.tickets[ticket.index as usize] = TicketState::Free;
        self.next_ticket = ticket.index;
        self.lease_high_water = ticket.start;
    }

    /// Record that the producer holding `ticket` finished writing up to
    /// `write_pos`. Returns the new published tail when it advanced.
    ///
    /// # Panics
    ///
    /// If the ticket is not currently reserved.
    pub fn complete(&mut self, ticket: LeaseTicket, write_pos: u32) -> Option<u32> {
        let slot = &mut self.tickets[ticket.index as usize];
        assert_eq!(
            *slot,
            TicketState::Reserved,
            "completion of ticket {} that is not reserved",
            ticket.index
        );
        *slot = TicketState::Completed(write_pos);

        // Only the oldest outstanding reservation may publish; anything
        // newer waits for it to walk past.
        if ticket.start != self.published_tail {
            return None;
        }

        let mut idx = ticket.index;
        let mut tail = self.published_tail;
        while idx != self.next_ticket {
            match self.tickets[idx as usize] {
                TicketState::Completed(pos) => {
                    tail = pos;
                    self.tickets[idx as usize] = TicketState::Free;
                    idx = self.next_index(idx);
                }
                _ => break,
            }
        }

        if tail != self.published_tail {
            self.published_tail = tail;
            Some(tail)
        } else {
            None
        }
    }

    /// Consumer hands `n` published slots back to producers.
    pub fn release(&mut self, n: u32) {
        let ready = self.space(Side::Consumer);
        assert!(n <= ready, "release of {n} slots, only {ready} published");
        self.owner_cursor = self.advance(self.owner_cursor, n);
    }
}
