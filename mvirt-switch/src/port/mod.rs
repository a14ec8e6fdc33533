//! Switch ports
//!
//! This module defines the `Port` trait the bridge drives, plus its two
//! implementations:
//! - `VirtualPort`: software endpoint whose rings live in process memory
//! - `HardwareWrapperPort`: adapts a NIC (`HardwareAdapter`) so its rings
//!   can be attached to a bridge

mod virtual_port;
mod wrapper;

pub use virtual_port::VirtualPort;
pub use wrapper::{HardwareAdapter, HardwareWrapperPort, IrqOutcome, RxNotify, WrapperSide};

use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::bridge::Bridge;
use crate::config::PortState;
use crate::error::Result;
use crate::ring::Ring;

/// Slot index of a port within its bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortIndex(u16);

impl PortIndex {
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PortIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PortKind {
    Virtual,
    HardwareWrapper,
}

impl PortKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortKind::Virtual => "virtual",
            PortKind::HardwareWrapper => "hardware",
        }
    }
}

/// Extra context passed along with `notify`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyFlags {
    /// The caller will retry leasing into this ring right after the call
    pub retrying: bool,
}

#[derive(Debug, Default)]
pub struct PortStats {
    tx_frames: AtomicU64,
    rx_frames: AtomicU64,
    dropped: AtomicU64,
    mismatch_drops: AtomicU64,
}

/// Point-in-time copy of `PortStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PortStatsSnapshot {
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub dropped: u64,
    pub mismatch_drops: u64,
}

impl PortStats {
    pub fn add_tx(&self, n: u64) {
        self.tx_frames.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rx(&self, n: u64) {
        self.rx_frames.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_mismatch_drop(&self) {
        self.mismatch_drops.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            mismatch_drops: self.mismatch_drops.load(Ordering::Relaxed),
        }
    }
}

struct LinkTarget {
    bridge: Weak<Bridge>,
    index: PortIndex,
}

/// Back-reference from a port to the bridge it is attached to.
///
/// Set on attach and cleared on detach; read lock-free by the data path.
#[derive(Clone, Default)]
pub struct PortLink(Arc<ArcSwapOption<LinkTarget>>);

impl PortLink {
    pub(crate) fn set(&self, bridge: &Arc<Bridge>, index: PortIndex) {
        self.0.store(Some(Arc::new(LinkTarget {
            bridge: Arc::downgrade(bridge),
            index,
        })));
    }

    pub(crate) fn clear(&self) {
        self.0.store(None);
    }

    /// Bridge and slot this port is attached to
    pub fn get(&self) -> Option<(Arc<Bridge>, PortIndex)> {
        let target = self.0.load_full()?;
        let bridge = target.bridge.upgrade()?;
        Some((bridge, target.index))
    }

    pub fn is_linked(&self) -> bool {
        self.get().is_some()
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A bridge port.
///
/// Rings are named from the switch's point of view: the bridge consumes a
/// port's tx rings and produces into its rx rings.
pub trait Port: sealed::Sealed + Send + Sync {
    /// Full `bridge:port` name
    fn name(&self) -> &str;

    fn kind(&self) -> PortKind;

    fn num_tx_rings(&self) -> usize;

    fn num_rx_rings(&self) -> usize;

    fn tx_ring(&self, index: usize) -> Option<&Arc<Ring>>;

    fn rx_ring(&self, index: usize) -> Option<&Arc<Ring>>;

    /// virtio-net header length prefixed to every frame (0, 10 or 12)
    fn header_len(&self) -> usize;

    fn set_header_len(&self, len: usize);

    /// Maximum frame size accepted on the rx side
    fn mfs(&self) -> usize;

    fn state(&self) -> PortState;

    fn stats(&self) -> &PortStats;

    fn link(&self) -> &PortLink;

    /// Enable (`on`) or disable the port's rings.
    fn register(&self, on: bool) -> Result<()>;

    /// Move frames queued on the transmit side up to `head` onward.
    /// Returns the position actually consumed.
    fn sync_tx(&self, ring: usize, head: u32) -> u32;

    /// Make newly arrived frames visible on the receive side.
    fn sync_rx(&self, ring: usize) -> Result<()>;

    /// Called by the switch after it published new slots on rx ring `ring`.
    fn notify(&self, ring: usize, flags: NotifyFlags);

    /// Whether flush may retry a lease after notifying this port
    fn retries_on_backpressure(&self) -> bool {
        false
    }

    /// Name of the wrapped hardware adapter, if any
    fn adapter_name(&self) -> Option<&str> {
        None
    }

    fn extra_bufs(&self) -> u32 {
        0
    }

    fn as_virtual(&self) -> Option<&VirtualPort> {
        None
    }
}

/// Start or stop every ring of a port.
pub(crate) fn set_rings_running(port: &dyn Port, running: bool) {
    let rings = (0..port.num_tx_rings())
        .filter_map(|i| port.tx_ring(i))
        .chain((0..port.num_rx_rings()).filter_map(|i| port.rx_ring(i)));
    for ring in rings {
        if running {
            ring.start();
        } else {
            ring.stop();
        }
    }
}
