//! Software NIC implementing [`HardwareAdapter`]
//!
//! Stands in for a real device driver: frames "arrive from the wire" via
//! [`SimNic::inject`] and are moved into the rx ring on `sync_rx`, frames the
//! switch places in the tx ring are collected on `sync_tx` and can be read
//! back with [`SimNic::transmitted`]. [`SimNic::interrupt`] plays the rx
//! interrupt: it runs the installed notify hook, or counts a native wakeup
//! when no hook is installed.

use crossbeam_queue::ArrayQueue;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

use crate::lease::Side;
use crate::port::{HardwareAdapter, RxNotify};
use crate::ring::{Ring, lock};

/// Frames buffered per ring on each side of the wire
const WIRE_QUEUE_DEPTH: usize = 4096;

struct RxState {
    wire_in: ArrayQueue<Vec<u8>>,
    /// Frame popped from the wire that did not fit the ring yet
    carry: Mutex<Option<Vec<u8>>>,
    /// Free producer slots seen at the end of the last rxsync
    last_free: Mutex<u32>,
    replenished: AtomicU64,
    hook: Mutex<Option<RxNotify>>,
    native_wakeups: AtomicU64,
}

pub struct SimNic {
    name: String,
    num_rings: usize,
    host_rings: bool,
    rx_rings: Vec<Arc<Ring>>,
    tx_rings: Vec<Arc<Ring>>,
    rx_state: Vec<RxState>,
    wire_out: Vec<ArrayQueue<Vec<u8>>>,
    enabled: AtomicBool,
    fail_register: AtomicBool,
    mfs: usize,
    header_len: usize,
}

impl SimNic {
    /// NIC with `rings` hardware ring pairs of `slots` slots each, plus one
    /// host-stack pair when `host_rings` is set.
    pub fn new(
        name: &str,
        rings: usize,
        slots: u32,
        slot_size: usize,
        host_rings: bool,
    ) -> Arc<Self> {
        Self::with_offload(name, rings, slots, slot_size, host_rings, 0, 1514)
    }

    /// Like [`SimNic::new`] with a virtio-net header length and maximum
    /// frame size.
    pub fn with_offload(
        name: &str,
        rings: usize,
        slots: u32,
        slot_size: usize,
        host_rings: bool,
        header_len: usize,
        mfs: usize,
    ) -> Arc<Self> {
        let total = rings + usize::from(host_rings);
        let label = |dir: &str, i: usize| {
            if i == rings {
                format!("{name}/host-{dir}")
            } else {
                format!("{name}/{dir}{i}")
            }
        };
        let rx_rings: Vec<_> = (0..total)
            .map(|i| Arc::new(Ring::new(label("rx", i), slots, slot_size)))
            .collect();
        let tx_rings = (0..total)
            .map(|i| Arc::new(Ring::new(label("tx", i), slots, slot_size)))
            .collect();
        let rx_state = rx_rings
            .iter()
            .map(|ring| RxState {
                wire_in: ArrayQueue::new(WIRE_QUEUE_DEPTH),
                carry: Mutex::new(None),
                last_free: Mutex::new(ring.space(Side::Producer)),
                replenished: AtomicU64::new(0),
                hook: Mutex::new(None),
                native_wakeups: AtomicU64::new(0),
            })
            .collect();

        Arc::new(Self {
            name: name.to_string(),
            num_rings: rings,
            host_rings,
            rx_rings,
            tx_rings,
            rx_state,
            wire_out: (0..total).map(|_| ArrayQueue::new(WIRE_QUEUE_DEPTH)).collect(),
            enabled: AtomicBool::new(false),
            fail_register: AtomicBool::new(false),
            mfs,
            header_len,
        })
    }

    /// Queue a frame arriving from the wire on rx ring `ring`. Returns false
    /// when the wire queue is full.
    pub fn inject(&self, ring: usize, frame: Vec<u8>) -> bool {
        match self.rx_state.get(ring) {
            Some(state) => state.wire_in.push(frame).is_ok(),
            None => false,
        }
    }

    /// Inject a burst and raise one interrupt for it.
    pub fn receive_batch<I: IntoIterator<Item = Vec<u8>>>(&self, ring: usize, frames: I) -> usize {
        let queued = frames
            .into_iter()
            .filter_map(|frame| self.inject(ring, frame).then_some(()))
            .count();
        self.interrupt(ring);
        queued
    }

    /// Raise the rx interrupt of `ring`.
    pub fn interrupt(&self, ring: usize) {
        let Some(state) = self.rx_state.get(ring) else {
            return;
        };
        let hook = lock(&state.hook).clone();
        match hook {
            Some(hook) => hook(ring),
            None => {
                state.native_wakeups.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Frames transmitted on tx ring `ring` since the last call.
    pub fn transmitted(&self, ring: usize) -> Vec<Vec<u8>> {
        let Some(queue) = self.wire_out.get(ring) else {
            return Vec::new();
        };
        std::iter::from_fn(|| queue.pop()).collect()
    }

    /// Rx buffers handed back to the NIC by the switch
    pub fn replenished(&self, ring: usize) -> u64 {
        self.rx_state
            .get(ring)
            .map_or(0, |s| s.replenished.load(Ordering::Relaxed))
    }

    /// Interrupts that found no notify hook installed
    pub fn native_wakeups(&self, ring: usize) -> u64 {
        self.rx_state
            .get(ring)
            .map_or(0, |s| s.native_wakeups.load(Ordering::Relaxed))
    }

    pub fn has_rx_notify(&self, ring: usize) -> bool {
        self.rx_state
            .get(ring)
            .is_some_and(|s| lock(&s.hook).is_some())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Make the next `register` calls fail.
    pub fn fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::Relaxed);
    }
}

impl HardwareAdapter for SimNic {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_rx_rings(&self) -> usize {
        self.num_rings
    }

    fn num_tx_rings(&self) -> usize {
        self.num_rings
    }

    fn has_host_rings(&self) -> bool {
        self.host_rings
    }

    fn rx_ring(&self, index: usize) -> Option<Arc<Ring>> {
        self.rx_rings.get(index).cloned()
    }

    fn tx_ring(&self, index: usize) -> Option<Arc<Ring>> {
        self.tx_rings.get(index).cloned()
    }

    fn register(&self, on: bool) -> io::Result<()> {
        if self.fail_register.load(Ordering::Relaxed) {
            return Err(io::Error::other("simulated register failure"));
        }
        self.enabled.store(on, Ordering::Release);
        Ok(())
    }

    fn sync_tx(&self, ring: usize, head: u32) -> u32 {
        let (Some(tx), Some(wire)) = (self.tx_rings.get(ring), self.wire_out.get(ring)) else {
            return head;
        };
        // Blocks only behind another txsync on this ring
        let mut consumer = tx.consumer();
        while consumer.cursor() != head && consumer.pending() > 0 {
            let Some(frame) = consumer.pop_frame() else {
                break;
            };
            wire.force_push(frame);
        }
        trace!(nic = %self.name, ring, cur = consumer.cursor(), "txsync");
        consumer.cursor()
    }

    fn sync_rx(&self, ring: usize) -> io::Result<()> {
        let (Some(rx), Some(state)) = (self.rx_rings.get(ring), self.rx_state.get(ring)) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such ring"));
        };

        let mut last_free = lock(&state.last_free);
        let free = rx.space(Side::Producer);
        if free > *last_free {
            state
                .replenished
                .fetch_add(u64::from(free - *last_free), Ordering::Relaxed);
        }

        let mut carry = lock(&state.carry);
        if (carry.is_some() || !state.wire_in.is_empty())
            && let Some(mut writer) = rx.begin_lease(free)
        {
            loop {
                let Some(frame) = carry.take().or_else(|| state.wire_in.pop()) else {
                    break;
                };
                if !writer.write_frame(&frame) {
                    *carry = Some(frame);
                    break;
                }
            }
            writer.finish();
        }

        *last_free = rx.space(Side::Producer);
        trace!(nic = %self.name, ring, published = rx.published_tail(), "rxsync");
        Ok(())
    }

    fn set_rx_notify(&self, ring: usize, hook: Option<RxNotify>) -> Option<RxNotify> {
        let state = self.rx_state.get(ring)?;
        std::mem::replace(&mut *lock(&state.hook), hook)
    }

    fn mfs(&self) -> usize {
        self.mfs
    }

    fn header_len(&self) -> usize {
        self.header_len
    }
}

impl std::fmt::Debug for SimNic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNic")
            .field("name", &self.name)
            .field("rings", &self.num_rings)
            .field("host_rings", &self.host_rings)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
