//! Name-addressable set of bridges.
//!
//! The registry has no lock of its own: it lives inside the switch's
//! topology mutex and is only touched on the control path, never while
//! forwarding.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use tracing::info;

use crate::bridge::{Bridge, BridgeLimits};
use crate::error::{Result, SwitchError};

/// Longest bridge or port name
pub const MAX_NAME_LEN: usize = 15;

/// Generation-checked reference to a registry slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BridgeId {
    index: usize,
    generation: u32,
}

impl BridgeId {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// A bridge together with the id it is registered under.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    id: BridgeId,
    bridge: Arc<Bridge>,
}

impl BridgeHandle {
    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }
}

impl Deref for BridgeHandle {
    type Target = Arc<Bridge>;

    fn deref(&self) -> &Self::Target {
        &self.bridge
    }
}

#[derive(Default)]
struct BridgeSlot {
    generation: u32,
    bridge: Option<Arc<Bridge>>,
}

pub struct BridgeRegistry {
    limits: BridgeLimits,
    slots: Vec<BridgeSlot>,
    by_name: HashMap<String, usize>,
}

impl BridgeRegistry {
    /// Registry with room for `capacity` bridges, each created with
    /// `limits`.
    pub fn new(capacity: usize, limits: BridgeLimits) -> Self {
        Self {
            limits,
            slots: (0..capacity).map(|_| BridgeSlot::default()).collect(),
            by_name: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn find(&self, name: &str) -> Option<BridgeHandle> {
        let index = *self.by_name.get(name)?;
        self.handle(index)
    }

    /// Look `name` up, creating an empty bridge with the default learning
    /// lookup when it does not exist yet.
    pub fn find_or_create(&mut self, name: &str) -> Result<BridgeHandle> {
        validate_name(name)?;
        if let Some(handle) = self.find(name) {
            return Ok(handle);
        }

        let index = self
            .slots
            .iter()
            .position(|slot| slot.bridge.is_none())
            .ok_or(SwitchError::OutOfBridges(self.slots.len()))?;
        self.slots[index].bridge = Some(Arc::new(Bridge::new(name, self.limits)));
        self.by_name.insert(name.to_string(), index);
        info!(bridge = %name, index, "bridge created");

        self.handle(index)
            .ok_or_else(|| SwitchError::NotFound(name.to_string()))
    }

    pub fn get(&self, id: BridgeId) -> Option<BridgeHandle> {
        let slot = self.slots.get(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        self.handle(id.index)
    }

    /// Drop the bridge behind `id` if no port is attached to it. Returns
    /// whether it was removed. Stale ids are ignored.
    pub fn release_if_empty(&mut self, id: BridgeId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index) else {
            return false;
        };
        if slot.generation != id.generation {
            return false;
        }
        let Some(bridge) = slot.bridge.as_ref() else {
            return false;
        };
        if !bridge.is_empty() {
            return false;
        }

        let name = bridge.name().to_string();
        slot.bridge = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.by_name.remove(&name);
        info!(bridge = %name, index = id.index, "bridge released");
        true
    }

    /// Number of live bridges
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Live bridges in slot order.
    pub fn iter(&self) -> impl Iterator<Item = BridgeHandle> + '_ {
        (0..self.slots.len()).filter_map(|index| self.handle(index))
    }

    fn handle(&self, index: usize) -> Option<BridgeHandle> {
        let slot = self.slots.get(index)?;
        let bridge = slot.bridge.as_ref()?;
        Some(BridgeHandle {
            id: BridgeId {
                index,
                generation: slot.generation,
            },
            bridge: Arc::clone(bridge),
        })
    }
}

impl std::fmt::Debug for BridgeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRegistry")
            .field("capacity", &self.slots.len())
            .field("bridges", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Check a bridge or port name: 1 to 15 ASCII alphanumerics or `_`.
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(SwitchError::InvalidName(name.to_string()))
    }
}

/// Split `bridge:port` at the first `:`, validating both halves. A trailing
/// `^` on the port half (host-stack port) is accepted.
pub fn split_port_name(full: &str) -> Result<(&str, &str)> {
    let (bridge, port) = full
        .split_once(':')
        .ok_or_else(|| SwitchError::InvalidName(full.to_string()))?;
    validate_name(bridge)?;
    validate_name(port.strip_suffix('^').unwrap_or(port))
        .map_err(|_| SwitchError::InvalidName(full.to_string()))?;
    Ok((bridge, port))
}
