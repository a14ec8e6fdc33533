//! Wrapper that attaches a hardware NIC's rings to a bridge.
//!
//! The wrapper owns no rings of its own. Its switch-facing tx ring *is* the
//! NIC rx ring (frames arriving from the wire enter the switch there) and its
//! switch-facing rx ring *is* the NIC tx ring (frames the switch delivers go
//! straight out). Two hooks tie the halves together:
//!
//! - `on_hw_rx`: installed as the NIC's rx interrupt notify; pulls arrivals
//!   into the bridge.
//! - `on_switch_tx`: run from `notify` after the switch published into the
//!   NIC tx ring; kicks the NIC to transmit.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

use super::{NotifyFlags, Port, PortKind, PortLink, PortStats, sealed};
use crate::bridge::LockMode;
use crate::config::{MAX_RINGS_PER_PORT, PortState};
use crate::error::{Result, SwitchError};
use crate::lease::Side;
use crate::ring::{Ring, lock};

/// Rx-completion callback a NIC invokes with the ring index
pub type RxNotify = Arc<dyn Fn(usize) + Send + Sync>;

/// Boundary to the device layer owning a NIC.
///
/// Ring index `num_rx_rings()` (resp. `num_tx_rings()`) addresses the host
/// stack ring when `has_host_rings()` is true.
pub trait HardwareAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn num_rx_rings(&self) -> usize;

    fn num_tx_rings(&self) -> usize;

    fn has_host_rings(&self) -> bool;

    fn rx_ring(&self, index: usize) -> Option<Arc<Ring>>;

    fn tx_ring(&self, index: usize) -> Option<Arc<Ring>>;

    fn register(&self, on: bool) -> std::io::Result<()>;

    /// Transmit tx ring slots up to `head`; returns the position consumed.
    ///
    /// Reachable from the rx interrupt path, so it must not take bridge
    /// locks. Waiting on the tx ring's consumer role for one txsync is fine.
    fn sync_tx(&self, ring: usize, head: u32) -> u32;

    /// Publish newly received frames and recycle released rx buffers.
    fn sync_rx(&self, ring: usize) -> std::io::Result<()>;

    /// Replace the rx notify hook, returning the previous one.
    fn set_rx_notify(&self, ring: usize, hook: Option<RxNotify>) -> Option<RxNotify>;

    fn mfs(&self) -> usize {
        1514
    }

    fn header_len(&self) -> usize {
        0
    }
}

/// What an interrupt-time notify achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqOutcome {
    Completed,
    /// More frames arrived while forwarding; the caller should run again
    Rescheduled,
}

/// Which half of the adapter a wrapper port covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperSide {
    Hardware,
    Host,
}

pub struct HardwareWrapperPort {
    name: String,
    hw: Arc<dyn HardwareAdapter>,
    side: WrapperSide,
    /// Adapter ring index of this port's ring 0
    ring_base: usize,
    tx_rings: Vec<Arc<Ring>>,
    rx_rings: Vec<Arc<Ring>>,
    saved_notify: Mutex<Vec<Option<RxNotify>>>,
    header_len: AtomicUsize,
    registered: AtomicBool,
    stats: PortStats,
    link: PortLink,
}

impl HardwareWrapperPort {
    /// Wrap the NIC rings (`WrapperSide::Hardware`) or the host stack rings
    /// (`WrapperSide::Host`) of `hw`.
    pub fn new(
        name: impl Into<String>,
        hw: Arc<dyn HardwareAdapter>,
        side: WrapperSide,
    ) -> Result<Self> {
        let name = name.into();
        let missing = |what: &str| SwitchError::hardware(hw.name(), format!("missing {what}"));
        let rings = hw.num_rx_rings().max(hw.num_tx_rings());
        if rings > MAX_RINGS_PER_PORT {
            return Err(SwitchError::InvalidConfig(format!(
                "adapter {} has {rings} rings, at most {MAX_RINGS_PER_PORT} per port",
                hw.name()
            )));
        }

        let (ring_base, tx_rings, rx_rings) = match side {
            WrapperSide::Hardware => {
                let tx = (0..hw.num_rx_rings())
                    .map(|i| hw.rx_ring(i).ok_or_else(|| missing("rx ring")))
                    .collect::<Result<Vec<_>>>()?;
                let rx = (0..hw.num_tx_rings())
                    .map(|i| hw.tx_ring(i).ok_or_else(|| missing("tx ring")))
                    .collect::<Result<Vec<_>>>()?;
                (0, tx, rx)
            }
            WrapperSide::Host => {
                if !hw.has_host_rings() || hw.num_rx_rings() != hw.num_tx_rings() {
                    return Err(missing("host rings"));
                }
                let base = hw.num_rx_rings();
                let tx = hw.rx_ring(base).ok_or_else(|| missing("host rx ring"))?;
                let rx = hw.tx_ring(base).ok_or_else(|| missing("host tx ring"))?;
                (base, vec![tx], vec![rx])
            }
        };
        if tx_rings.is_empty() || rx_rings.is_empty() {
            return Err(missing("rings"));
        }

        Ok(Self {
            name,
            header_len: AtomicUsize::new(hw.header_len()),
            saved_notify: Mutex::new(vec![None; tx_rings.len()]),
            hw,
            side,
            ring_base,
            tx_rings,
            rx_rings,
            registered: AtomicBool::new(false),
            stats: PortStats::default(),
            link: PortLink::default(),
        })
    }

    pub fn side(&self) -> WrapperSide {
        self.side
    }

    pub fn adapter(&self) -> &Arc<dyn HardwareAdapter> {
        &self.hw
    }

    /// Rx interrupt handler for this port's ring `ring`.
    pub fn on_hw_rx(&self, ring: usize) -> IrqOutcome {
        handle_hw_rx(self.hw.as_ref(), &self.link, self.ring_base + ring, ring)
    }

    /// Kick the NIC after the switch published into rx ring `ring`.
    pub fn on_switch_tx(&self, ring: usize) -> u32 {
        let Some(rx) = self.rx_rings.get(ring) else {
            return 0;
        };
        let hw_ring = self.ring_base + ring;

        // The adapter's txsync transmits up to the published tail and
        // hands the sent slots back to producers
        let tail = rx.published_tail();
        let done = self.hw.sync_tx(hw_ring, tail);
        trace!(port = %self.name, ring, tail, done, "switch tx");
        done
    }

    fn install_interceptors(&self) {
        let mut saved = lock(&self.saved_notify);
        for (ring, slot) in saved.iter_mut().enumerate() {
            let hw = Arc::clone(&self.hw);
            let link = self.link.clone();
            let hw_ring = self.ring_base + ring;
            let hook: RxNotify = Arc::new(move |_| {
                if handle_hw_rx(hw.as_ref(), &link, hw_ring, ring) == IrqOutcome::Rescheduled {
                    // One extra pass instead of a softirq-style reschedule
                    handle_hw_rx(hw.as_ref(), &link, hw_ring, ring);
                }
            });
            *slot = self.hw.set_rx_notify(hw_ring, Some(hook));
        }
    }

    fn restore_interceptors(&self) {
        let mut saved = lock(&self.saved_notify);
        for (ring, slot) in saved.iter_mut().enumerate() {
            self.hw.set_rx_notify(self.ring_base + ring, slot.take());
        }
    }
}

/// Interrupt-time rx path shared by the port and its installed hook.
fn handle_hw_rx(
    hw: &dyn HardwareAdapter,
    link: &PortLink,
    hw_ring: usize,
    port_ring: usize,
) -> IrqOutcome {
    let Some(rx) = hw.rx_ring(hw_ring) else {
        return IrqOutcome::Completed;
    };

    // Consumer wake on the NIC rx ring: fetch what arrived
    if let Err(e) = hw.sync_rx(hw_ring) {
        debug!(adapter = hw.name(), ring = hw_ring, error = %e, "rxsync failed");
        return IrqOutcome::Completed;
    }
    let tail = rx.published_tail();
    if rx.space(Side::Consumer) == 0 {
        return IrqOutcome::Completed;
    }

    // Push the new frames through the bridge; consumed slots are released
    // back to the NIC by the pipeline
    let Some((bridge, index)) = link.get() else {
        return IrqOutcome::Completed;
    };
    let cur = bridge.preflush(index, &rx, port_ring, tail, LockMode::NoSleep);
    trace!(adapter = hw.name(), ring = hw_ring, tail, cur, "hw rx forwarded");

    // Second rxsync recycles the released buffers and may surface more
    if let Err(e) = hw.sync_rx(hw_ring) {
        debug!(adapter = hw.name(), ring = hw_ring, error = %e, "rxsync failed");
        return IrqOutcome::Completed;
    }
    if rx.space(Side::Consumer) > 0 {
        IrqOutcome::Rescheduled
    } else {
        IrqOutcome::Completed
    }
}

impl sealed::Sealed for HardwareWrapperPort {}

impl Port for HardwareWrapperPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PortKind {
        PortKind::HardwareWrapper
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
        self.hw.mfs()
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
        if on {
            self.install_interceptors();
            // The host half rides on the hardware half's registration
            if self.side == WrapperSide::Hardware
                && let Err(e) = self.hw.register(true)
            {
                self.restore_interceptors();
                warn!(port = %self.name, error = %e, "hardware register failed");
                return Err(SwitchError::hardware(self.hw.name(), e));
            }
            super::set_rings_running(self, true);
            self.registered.store(true, Ordering::Release);
            info!(port = %self.name, adapter = self.hw.name(), side = ?self.side, "wrapper registered");
        } else {
            self.restore_interceptors();
            // Back in the adapter's hands
            super::set_rings_running(self, true);
            self.registered.store(false, Ordering::Release);
            if self.side == WrapperSide::Hardware
                && let Err(e) = self.hw.register(false)
            {
                warn!(port = %self.name, error = %e, "hardware unregister failed");
            }
            info!(port = %self.name, adapter = self.hw.name(), "wrapper unregistered");
        }
        Ok(())
    }

    fn sync_tx(&self, ring: usize, head: u32) -> u32 {
        self.hw.sync_tx(self.ring_base + ring, head)
    }

    fn sync_rx(&self, ring: usize) -> Result<()> {
        self.hw
            .sync_rx(self.ring_base + ring)
            .map_err(|e| SwitchError::hardware(self.hw.name(), e))
    }

    fn notify(&self, ring: usize, flags: NotifyFlags) {
        if flags.retrying {
            trace!(port = %self.name, ring, "notify before retry");
        }
        // Also reached from `on_hw_rx` under NoSleep; the txsync may wait
        // on the tx ring's consumer role but never on a bridge lock.
        self.on_switch_tx(ring);
    }

    fn retries_on_backpressure(&self) -> bool {
        self.side == WrapperSide::Hardware
    }

    fn adapter_name(&self) -> Option<&str> {
        Some(self.hw.name())
    }
}
