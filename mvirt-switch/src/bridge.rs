//! Bridge: a named set of port slots sharing one learning table.
//!
//! The port table sits behind a sleepable `RwLock`. Forwarding takes it for
//! reading (blocking from user context, `try_read` from interrupt-like
//! context); attach, detach and SET_LOOKUP take it for writing.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use tracing::{debug, info};

use crate::config::SwitchConfig;
use crate::error::{Result, SwitchError};
use crate::learning::{LearningLookup, LearningTable, LookupFn};
use crate::port::{Port, PortIndex, set_rings_running};

/// Whether the caller may block on the bridge lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// User/control context
    MaySleep,
    /// Interrupt or polling context: try once, make no progress on failure
    NoSleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeLimits {
    pub max_ports: usize,
    pub batch_limit: usize,
    pub hw_retry_limit: u32,
}

impl From<&SwitchConfig> for BridgeLimits {
    fn from(config: &SwitchConfig) -> Self {
        Self {
            max_ports: config.max_ports,
            batch_limit: config.batch_limit,
            hw_retry_limit: config.hw_retry_limit,
        }
    }
}

/// Generation-checked reference to an attached port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId {
    index: PortIndex,
    generation: u32,
}

impl PortId {
    pub fn index(&self) -> PortIndex {
        self.index
    }
}

#[derive(Default)]
struct PortSlot {
    generation: u32,
    port: Option<Arc<dyn Port>>,
}

pub(crate) struct BridgeState {
    slots: Vec<PortSlot>,
    /// Attached port indices, ascending
    active: Vec<PortIndex>,
    lookup: Arc<dyn LookupFn>,
}

impl BridgeState {
    pub(crate) fn port(&self, index: PortIndex) -> Option<&Arc<dyn Port>> {
        self.slots.get(index.as_usize())?.port.as_ref()
    }

    pub(crate) fn active(&self) -> &[PortIndex] {
        &self.active
    }

    pub(crate) fn lookup(&self) -> &dyn LookupFn {
        self.lookup.as_ref()
    }

    fn resolve(&self, id: PortId) -> Option<&Arc<dyn Port>> {
        let slot = self.slots.get(id.index.as_usize())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.port.as_ref()
    }

    fn id_of(&self, index: PortIndex) -> PortId {
        PortId {
            index,
            generation: self.slots[index.as_usize()].generation,
        }
    }

    /// First run of `n` contiguous free slots.
    fn free_run(&self, n: usize) -> Option<usize> {
        let mut run = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.port.is_some() {
                run = 0;
                continue;
            }
            run += 1;
            if run == n {
                return Some(i + 1 - n);
            }
        }
        None
    }
}

pub struct Bridge {
    name: String,
    limits: BridgeLimits,
    state: RwLock<BridgeState>,
    learning: LearningTable,
}

impl Bridge {
    /// New bridge with the learning lookup and an empty table.
    pub fn new(name: impl Into<String>, limits: BridgeLimits) -> Self {
        let slots = (0..limits.max_ports).map(|_| PortSlot::default()).collect();
        Self {
            name: name.into(),
            limits,
            state: RwLock::new(BridgeState {
                slots,
                active: Vec::new(),
                lookup: Arc::new(LearningLookup),
            }),
            learning: LearningTable::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> BridgeLimits {
        self.limits
    }

    pub fn learning(&self) -> &LearningTable {
        &self.learning
    }

    /// Reader lock in the given mode. `None` only in `NoSleep` mode when a
    /// writer holds the lock.
    pub(crate) fn read_state(&self, mode: LockMode) -> Option<RwLockReadGuard<'_, BridgeState>> {
        match mode {
            LockMode::MaySleep => Some(self.state.read().unwrap_or_else(PoisonError::into_inner)),
            LockMode::NoSleep => match self.state.try_read() {
                Ok(guard) => Some(guard),
                Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
                Err(TryLockError::WouldBlock) => None,
            },
        }
    }

    // Writer lock: control path only, may block.
    fn write_state(&self) -> RwLockWriteGuard<'_, BridgeState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a single port.
    pub fn attach(self: &Arc<Self>, port: Arc<dyn Port>) -> Result<PortId> {
        let ids = self.attach_group(&[port])?;
        Ok(ids[0])
    }

    /// Attach a port together with its host-stack companion in two
    /// contiguous slots.
    pub fn attach_with_host(
        self: &Arc<Self>,
        port: Arc<dyn Port>,
        host: Arc<dyn Port>,
    ) -> Result<(PortId, PortId)> {
        let ids = self.attach_group(&[port, host])?;
        Ok((ids[0], ids[1]))
    }

    fn attach_group(self: &Arc<Self>, ports: &[Arc<dyn Port>]) -> Result<Vec<PortId>> {
        let mut state = self.write_state();

        for port in ports {
            let taken = state
                .active
                .iter()
                .filter_map(|&i| state.port(i))
                .any(|p| p.name() == port.name());
            if taken {
                return Err(SwitchError::AlreadyAttached(port.name().to_string()));
            }
        }
        if state.active.len() + ports.len() > self.limits.max_ports {
            return Err(SwitchError::TooManyPorts(self.name.clone()));
        }
        let first = state
            .free_run(ports.len())
            .ok_or_else(|| SwitchError::TooManyPorts(self.name.clone()))?;

        let mut ids = Vec::with_capacity(ports.len());
        for (offset, port) in ports.iter().enumerate() {
            let index = PortIndex::new((first + offset) as u16);
            port.link().set(self, index);
            if let Err(e) = port.register(true) {
                port.link().clear();
                // Undo the members attached so far
                for id in ids.drain(..) {
                    Self::remove_locked(&mut state, id);
                }
                return Err(e);
            }
            state.slots[index.as_usize()].port = Some(Arc::clone(port));
            let pos = state.active.partition_point(|&i| i < index);
            state.active.insert(pos, index);
            ids.push(state.id_of(index));
            info!(bridge = %self.name, port = %port.name(), index = %index, kind = port.kind().as_str(), "port attached");
        }
        Ok(ids)
    }

    /// Quiesce and remove a port. Returns the detached port.
    pub fn detach(&self, id: PortId) -> Result<Arc<dyn Port>> {
        let mut state = self.write_state();
        let port = Self::remove_locked(&mut state, id)
            .ok_or_else(|| SwitchError::NotFound(format!("{}:#{}", self.name, id.index)))?;
        info!(bridge = %self.name, port = %port.name(), index = %id.index, "port detached");
        Ok(port)
    }

    fn remove_locked(state: &mut BridgeState, id: PortId) -> Option<Arc<dyn Port>> {
        state.resolve(id)?;
        let slot = &mut state.slots[id.index.as_usize()];
        let port = slot.port.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        // No new leases into or out of this port from here on
        set_rings_running(port.as_ref(), false);
        state.active.retain(|&i| i != id.index);
        if let Err(e) = port.register(false) {
            debug!(port = %port.name(), error = %e, "unregister failed during detach");
        }
        port.link().clear();
        Some(port)
    }

    pub fn port(&self, id: PortId) -> Option<Arc<dyn Port>> {
        self.read_state(LockMode::MaySleep)?.resolve(id).cloned()
    }

    pub fn find_port(&self, name: &str) -> Option<(PortId, Arc<dyn Port>)> {
        let state = self.read_state(LockMode::MaySleep)?;
        state.active.iter().find_map(|&i| {
            let port = state.port(i)?;
            (port.name() == name).then(|| (state.id_of(i), Arc::clone(port)))
        })
    }

    /// Attached ports in slot order.
    pub fn ports(&self) -> Vec<(PortId, Arc<dyn Port>)> {
        let Some(state) = self.read_state(LockMode::MaySleep) else {
            return Vec::new();
        };
        state
            .active
            .iter()
            .filter_map(|&i| Some((state.id_of(i), Arc::clone(state.port(i)?))))
            .collect()
    }

    pub fn active_ports(&self) -> usize {
        self.read_state(LockMode::MaySleep)
            .map_or(0, |state| state.active.len())
    }

    pub fn is_empty(&self) -> bool {
        self.active_ports() == 0
    }

    /// Replace the lookup function. In-flight flushes finish with the old
    /// one.
    pub fn set_lookup(&self, lookup: Arc<dyn LookupFn>) {
        self.write_state().lookup = lookup;
        debug!(bridge = %self.name, "lookup function replaced");
    }

    /// Change a port's virtio-net header length while no flush runs.
    pub fn set_header_len(&self, id: PortId, len: usize) -> Result<()> {
        let state = self.write_state();
        let port = state
            .resolve(id)
            .ok_or_else(|| SwitchError::NotFound(format!("{}:#{}", self.name, id.index)))?;
        port.set_header_len(len);
        debug!(bridge = %self.name, port = %port.name(), len, "header length set");
        Ok(())
    }

    /// Forward everything published on tx ring `ring` of port `index`.
    pub fn push(&self, index: PortIndex, ring: usize, mode: LockMode) -> u32 {
        let tx = {
            let Some(state) = self.read_state(mode) else {
                return 0;
            };
            match state.port(index).and_then(|p| p.tx_ring(ring)) {
                Some(tx) => Arc::clone(tx),
                None => return 0,
            }
        };
        let head = tx.published_tail();
        self.preflush(index, &tx, ring, head, mode)
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .field("active_ports", &self.active_ports())
            .finish()
    }
}
