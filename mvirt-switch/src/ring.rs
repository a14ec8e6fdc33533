//! Fixed-capacity slot rings shared by many producers and one consumer.
//!
//! A [`Ring`] owns `N` fixed-size slot buffers plus the [`LeaseBook`] that
//! tracks who may touch which slot. Producers go through [`LeaseWriter`]
//! (reserve under the bookkeeping lock, copy without it, complete under it
//! again). The consumer goes through [`RingConsumer`], which only ever
//! reads published slots and hands them back with `release`.

use std::cell::UnsafeCell;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::trace;

use crate::forward::ForwardScratch;
use crate::lease::{LeaseBook, LeaseTicket, Side};

/// Lock a mutex, ignoring poisoning. Guarded state is only mutated through
/// methods that assert their invariants before touching it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-slot flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotFlags(u16);

impl SlotFlags {
    pub const NONE: SlotFlags = SlotFlags(0);
    /// Set on every slot of a multi-slot frame except the last
    pub const MORE_FRAGMENTS: SlotFlags = SlotFlags(0x1);

    pub fn contains(self, other: SlotFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

impl BitOr for SlotFlags {
    type Output = SlotFlags;

    fn bitor(self, rhs: SlotFlags) -> SlotFlags {
        SlotFlags(self.0 | rhs.0)
    }
}

#[derive(Debug)]
pub struct Slot {
    buf: Box<[u8]>,
    len: usize,
    flags: SlotFlags,
}

impl Slot {
    fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            len: 0,
            flags: SlotFlags::NONE,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn flags(&self) -> SlotFlags {
        self.flags
    }

    pub fn has_more(&self) -> bool {
        self.flags.contains(SlotFlags::MORE_FRAGMENTS)
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Copy `data` into the slot. Data that does not fit leaves an empty
    /// slot behind.
    pub fn fill(&mut self, data: &[u8], flags: SlotFlags) -> bool {
        if data.len() > self.buf.len() {
            self.clear();
            return false;
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        self.flags = flags;
        true
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.flags = SlotFlags::NONE;
    }
}

struct SlotCell(UnsafeCell<Slot>);

/// Consumer-side state, owned by whoever currently holds the consumer guard.
#[derive(Default)]
pub(crate) struct ConsumerSide {
    pub(crate) scratch: Option<Box<ForwardScratch>>,
}

pub struct Ring {
    label: String,
    slot_size: usize,
    slots: Box<[SlotCell]>,
    book: Mutex<LeaseBook>,
    consumer: Mutex<ConsumerSide>,
    stopped: AtomicBool,
    dropped: AtomicU64,
}

// SAFETY: slot contents are only reached through `LeaseWriter` (exclusive
// owner of a leased range, handed out under `book`) or `RingConsumer`
// (holder of the `consumer` mutex, reading only published slots that no
// producer can lease again until it releases them). The two ranges never
// overlap by the lease book invariants.
unsafe impl Sync for Ring {}

impl Ring {
    pub fn new(label: impl Into<String>, num_slots: u32, slot_size: usize) -> Self {
        let slots = (0..num_slots)
            .map(|_| SlotCell(UnsafeCell::new(Slot::new(slot_size))))
            .collect();
        Self {
            label: label.into(),
            slot_size,
            slots,
            book: Mutex::new(LeaseBook::new(num_slots)),
            consumer: Mutex::new(ConsumerSide::default()),
            stopped: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn num_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    // Bookkeeping lock: short hold, may block briefly.
    fn book(&self) -> MutexGuard<'_, LeaseBook> {
        lock(&self.book)
    }

    pub fn space(&self, side: Side) -> u32 {
        self.book().space(side)
    }

    pub fn owner_cursor(&self) -> u32 {
        self.book().owner_cursor()
    }

    pub fn published_tail(&self) -> u32 {
        self.book().published_tail()
    }

    pub fn lease_high_water(&self) -> u32 {
        self.book().lease_high_water()
    }

    /// Slots from `from` forward to `to`.
    pub fn distance(&self, from: u32, to: u32) -> u32 {
        let n = self.num_slots();
        if to >= from { to - from } else { to + n - from }
    }

    /// Stop accepting new leases. Leases already handed out still complete.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn start(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn record_drops(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Lease up to `wanted` slots. Returns `None` when the ring is stopped
    /// or full.
    pub fn begin_lease(&self, wanted: u32) -> Option<LeaseWriter<'_>> {
        let mut book = self.book();
        if self.is_stopped() {
            return None;
        }
        let granted = wanted.min(book.space(Side::Producer));
        if granted == 0 {
            return None;
        }
        let ticket = book.lease(granted);
        trace!(ring = %self.label, start = ticket.start(), count = granted, "lease");
        Some(LeaseWriter {
            ring: self,
            next: ticket.start(),
            used: 0,
            ticket: Some(ticket),
        })
    }

    /// Take the consumer role, waiting for the current holder.
    pub fn consumer(&self) -> RingConsumer<'_> {
        RingConsumer::new(self, lock(&self.consumer))
    }

    /// Take the consumer role if nobody holds it.
    pub fn try_consumer(&self) -> Option<RingConsumer<'_>> {
        let side = match self.consumer.try_lock() {
            Ok(side) => side,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(RingConsumer::new(self, side))
    }

    /// # Safety
    ///
    /// The caller must have exclusive access to `pos`: either it lies in a
    /// lease the caller holds, or in the published range while the caller
    /// holds the consumer guard.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot_mut(&self, pos: u32) -> &mut Slot {
        // SAFETY: forwarded to the caller.
        unsafe { &mut *self.slots[pos as usize].0.get() }
    }

    /// # Safety
    ///
    /// No producer may hold a lease covering `pos`.
    unsafe fn slot_ref(&self, pos: u32) -> &Slot {
        // SAFETY: forwarded to the caller.
        unsafe { &*self.slots[pos as usize].0.get() }
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let book = self.book();
        f.debug_struct("Ring")
            .field("label", &self.label)
            .field("num_slots", &book.num_slots())
            .field("owner_cursor", &book.owner_cursor())
            .field("published_tail", &book.published_tail())
            .field("lease_high_water", &book.lease_high_water())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Exclusive writer over one leased slot range.
///
/// Dropping the writer completes the lease with whatever was written.
pub struct LeaseWriter<'a> {
    ring: &'a Ring,
    ticket: Option<LeaseTicket>,
    next: u32,
    used: u32,
}

impl LeaseWriter<'_> {
    /// Slots granted by the lease
    pub fn capacity(&self) -> u32 {
        self.ticket.as_ref().map_or(0, LeaseTicket::count)
    }

    pub fn remaining(&self) -> u32 {
        self.capacity() - self.used
    }

    pub fn written(&self) -> u32 {
        self.used
    }

    pub fn slot_size(&self) -> usize {
        self.ring.slot_size
    }

    /// Write one fragment into the next leased slot.
    pub fn push_fragment(&mut self, data: &[u8], more: bool) -> bool {
        if self.remaining() == 0 {
            return false;
        }
        let flags = if more {
            SlotFlags::MORE_FRAGMENTS
        } else {
            SlotFlags::NONE
        };
        // SAFETY: `next` lies inside the range leased to this writer.
        let slot = unsafe { self.ring.slot_mut(self.next) };
        if !slot.fill(data, flags) {
            trace!(ring = %self.ring.label, len = data.len(), "fragment larger than slot");
        }
        self.next = (self.next + 1) % self.ring.num_slots();
        self.used += 1;
        true
    }

    /// Write a whole frame, split across as many slots as needed. Writes
    /// nothing and returns false when the frame does not fit.
    pub fn write_frame(&mut self, frame: &[u8]) -> bool {
        let size = self.ring.slot_size;
        let needed = frame.len().div_ceil(size).max(1);
        if needed > self.remaining() as usize {
            return false;
        }
        if frame.is_empty() {
            return self.push_fragment(frame, false);
        }
        let mut chunks = frame.chunks(size).peekable();
        while let Some(chunk) = chunks.next() {
            self.push_fragment(chunk, chunks.peek().is_some());
        }
        true
    }

    /// Complete the lease. Returns the new published tail if this
    /// completion advanced it.
    pub fn finish(mut self) -> Option<u32> {
        self.complete()
    }

    fn complete(&mut self) -> Option<u32> {
        let ticket = self.ticket.take()?;
        let mut book = self.ring.book();
        if self.used == 0 && book.is_latest(&ticket) {
            book.cancel(ticket);
            return None;
        }
        let end = if self.used == ticket.count() {
            self.next
        } else if book.is_latest(&ticket) {
            book.rollback(&ticket, self.used)
        } else {
            // Someone leased after us; the range must stay, so leave empty
            // entries behind for the consumer to skip.
            let mut pos = self.next;
            for _ in self.used..ticket.count() {
                // SAFETY: still inside our lease, which is not yet completed.
                unsafe { self.ring.slot_mut(pos) }.clear();
                pos = (pos + 1) % self.ring.num_slots();
            }
            pos
        };
        book.complete(ticket, end)
    }
}

impl Drop for LeaseWriter<'_> {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Consumer role on a ring. At most one exists per ring at a time.
pub struct RingConsumer<'a> {
    ring: &'a Ring,
    side: MutexGuard<'a, ConsumerSide>,
    cursor: u32,
    pending: u32,
}

impl<'a> RingConsumer<'a> {
    fn new(ring: &'a Ring, side: MutexGuard<'a, ConsumerSide>) -> Self {
        let (cursor, pending) = {
            let book = ring.book();
            (book.owner_cursor(), book.space(Side::Consumer))
        };
        Self {
            ring,
            side,
            cursor,
            pending,
        }
    }

    pub fn ring(&self) -> &'a Ring {
        self.ring
    }

    /// Position of the first unconsumed slot
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Published slots available at the last refresh
    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Pick up slots published since the guard was taken.
    pub fn refresh(&mut self) -> u32 {
        self.pending = self.ring.space(Side::Consumer);
        self.pending
    }

    /// Published slot `offset` positions past the cursor.
    ///
    /// # Panics
    ///
    /// If `offset` is outside the pending range.
    pub fn slot(&self, offset: u32) -> &Slot {
        assert!(
            offset < self.pending,
            "slot offset {offset} beyond {} pending",
            self.pending
        );
        let pos = (self.cursor + offset) % self.ring.num_slots();
        // SAFETY: published and not yet released; producers cannot lease it
        // until `release`, which needs `&mut self`.
        unsafe { self.ring.slot_ref(pos) }
    }

    /// Hand `n` slots back to producers.
    pub fn release(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        assert!(n <= self.pending, "release of {n} slots, {} pending", self.pending);
        self.ring.book().release(n);
        self.cursor = (self.cursor + n) % self.ring.num_slots();
        self.pending -= n;
    }

    /// Reassemble and consume the next non-empty frame. Returns `None` when
    /// no complete frame is pending.
    pub fn pop_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let mut frags = 0;
            let mut len = 0;
            loop {
                if frags == self.pending {
                    return None;
                }
                let slot = self.slot(frags);
                len += slot.len();
                frags += 1;
                if !slot.has_more() {
                    break;
                }
            }
            if len == 0 {
                self.release(frags);
                continue;
            }
            let mut frame = Vec::with_capacity(len);
            for i in 0..frags {
                frame.extend_from_slice(self.slot(i).payload());
            }
            self.release(frags);
            return Some(frame);
        }
    }

    pub(crate) fn take_scratch(&mut self) -> Option<Box<ForwardScratch>> {
        self.side.scratch.take()
    }

    pub(crate) fn put_scratch(&mut self, scratch: Box<ForwardScratch>) {
        self.side.scratch = Some(scratch);
    }
}
