//! Software port with in-memory rings.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

use super::{NotifyFlags, Port, PortKind, PortLink, PortStats, sealed};
use crate::bridge::LockMode;
use crate::config::{PortSpec, PortState};
use crate::error::Result;
use crate::notify::RingNotifier;
use crate::ring::Ring;

/// Endpoint created by CREATE_PORT.
///
/// The user writes frames into the tx rings and pushes them with
/// [`VirtualPort::send`]; the switch writes into the rx rings and signals
/// the ring's [`RingNotifier`].
pub struct VirtualPort {
    name: String,
    tx_rings: Vec<Arc<Ring>>,
    rx_rings: Vec<Arc<Ring>>,
    notifiers: Vec<RingNotifier>,
    header_len: AtomicUsize,
    mfs: usize,
    extra_bufs: u32,
    registered: AtomicBool,
    stats: PortStats,
    link: PortLink,
}

impl VirtualPort {
    pub fn new(name: impl Into<String>, spec: &PortSpec, slot_size: usize) -> Result<Self> {
        let name = name.into();
        let ring = |dir: &str, i: usize| {
            Arc::new(Ring::new(format!("{name}/{dir}{i}"), spec.slot_count, slot_size))
        };
        let tx_rings = (0..spec.ring_count).map(|i| ring("tx", i)).collect();
        let rx_rings = (0..spec.ring_count).map(|i| ring("rx", i)).collect();
        let notifiers = (0..spec.ring_count)
            .map(|_| RingNotifier::new())
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            name,
            tx_rings,
            rx_rings,
            notifiers,
            header_len: AtomicUsize::new(spec.header_len),
            mfs: spec.mfs,
            extra_bufs: spec.extra_bufs,
            registered: AtomicBool::new(false),
            stats: PortStats::default(),
            link: PortLink::default(),
        })
    }

    /// Queue `frames` on tx ring `ring` and push them through the switch.
    /// Returns how many frames fit into the tx ring.
    pub fn send<F: AsRef<[u8]>>(&self, ring: usize, frames: &[F]) -> usize {
        let Some(tx) = self.tx_rings.get(ring) else {
            return 0;
        };
        let wanted: u32 = frames
            .iter()
            .map(|f| f.as_ref().len().div_ceil(tx.slot_size()).max(1) as u32)
            .sum();

        let mut queued = 0;
        if let Some(mut writer) = tx.begin_lease(wanted) {
            for frame in frames {
                if !writer.write_frame(frame.as_ref()) {
                    break;
                }
                queued += 1;
            }
            writer.finish();
        }
        if queued < frames.len() {
            debug!(port = %self.name, ring, dropped = frames.len() - queued, "tx ring full");
        }

        self.sync_tx(ring, tx.published_tail());
        queued
    }

    /// Drain every complete frame from rx ring `ring`.
    pub fn recv(&self, ring: usize) -> Vec<Vec<u8>> {
        let Some(rx) = self.rx_rings.get(ring) else {
            return Vec::new();
        };
        if let Some(notifier) = self.notifiers.get(ring) {
            notifier.drain();
        }
        let mut consumer = rx.consumer();
        let mut frames = Vec::new();
        while let Some(frame) = consumer.pop_frame() {
            frames.push(frame);
        }
        frames
    }

    pub fn notifier(&self, ring: usize) -> Option<&RingNotifier> {
        self.notifiers.get(ring)
    }
}

impl sealed::Sealed for VirtualPort {}

impl Port for VirtualPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PortKind {
        PortKind::Virtual
    }

    fn num_tx_rings(&self) -> usize {
        self.tx_rings.len()
    }

    fn num_rx_rings(&self) -> usize {
        self.rx_rings.len()
    }

    fn tx_ring(&self, index: usize) -> Option<&Arc<Ring>> {
        self.tx_rings.get(index)
    }

    fn rx_ring(&self, index: usize) -> Option<&Arc<Ring>> {
        self.rx_rings.get(index)
    }

    fn header_len(&self) -> usize {
        self.header_len.load(Ordering::Relaxed)
    }

    fn set_header_len(&self, len: usize) {
        self.header_len.store(len, Ordering::Relaxed);
    }

    fn mfs(&self) -> usize {
        self.mfs
    }

    fn state(&self) -> PortState {
        if self.registered.load(Ordering::Acquire) {
            PortState::Registered
        } else {
            PortState::Unregistered
        }
    }

    fn stats(&self) -> &PortStats {
        &self.stats
    }

    fn link(&self) -> &PortLink {
        &self.link
    }

    fn register(&self, on: bool) -> Result<()> {
        super::set_rings_running(self, on);
        self.registered.store(on, Ordering::Release);
        Ok(())
    }

    fn sync_tx(&self, ring: usize, head: u32) -> u32 {
        let Some(tx) = self.tx_rings.get(ring) else {
            return head;
        };
        match self.link.get() {
            // User context: may sleep on the bridge lock
            Some((bridge, index)) => bridge.preflush(index, tx, ring, head, LockMode::MaySleep),
            None => tx.owner_cursor(),
        }
    }

    fn sync_rx(&self, _ring: usize) -> Result<()> {
        // The switch writes rx slots directly; nothing to fetch
        Ok(())
    }

    fn notify(&self, ring: usize, _flags: NotifyFlags) {
        if let Some(notifier) = self.notifiers.get(ring) {
            notifier.signal();
        }
    }

    fn extra_bufs(&self) -> u32 {
        self.extra_bufs
    }

    fn as_virtual(&self) -> Option<&VirtualPort> {
        Some(self)
    }
}
