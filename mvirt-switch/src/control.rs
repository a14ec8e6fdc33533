//! Control surface: CREATE_PORT, ATTACH, DETACH, LIST, SET_LOOKUP and
//! SET_HEADER_LEN.
//!
//! Every call is synchronous and serialized by the topology mutex, which
//! also guards the bridge registry. Calls may block; none of them runs on
//! the forwarding path.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::bridge::{Bridge, PortId};
use crate::config::{AttachFlags, MAX_RINGS_PER_PORT, PortSpec, SwitchConfig};
use crate::error::{Result, SwitchError};
use crate::learning::LookupFn;
use crate::offload;
use crate::port::{
    HardwareAdapter, HardwareWrapperPort, Port, PortIndex, PortKind, PortStatsSnapshot,
    VirtualPort, WrapperSide,
};
use crate::registry::{BridgeHandle, BridgeId, BridgeRegistry, split_port_name};
use crate::ring::lock;

/// Port returned by CREATE_PORT and ATTACH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle {
    pub bridge: BridgeId,
    pub port: PortId,
}

/// Resume point for LIST: first bridge slot and first port slot to report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListCursor {
    pub bridge: usize,
    pub port: usize,
}

/// One LIST result
#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub bridge: String,
    pub port: String,
    pub kind: PortKind,
    pub index: PortIndex,
    pub tx_rings: usize,
    pub rx_rings: usize,
    pub state: &'static str,
    pub header_len: usize,
    pub extra_bufs: u32,
    pub stats: PortStatsSnapshot,
    /// Cursor of the following entry; `None` on the last one
    pub next: Option<ListCursor>,
}

struct Fabric {
    registry: BridgeRegistry,
    adapters: HashMap<String, Arc<dyn HardwareAdapter>>,
    /// Adapters currently wrapped into some bridge
    wrapped: HashSet<String>,
}

pub struct Switch {
    config: SwitchConfig,
    fabric: Mutex<Fabric>,
}

impl Switch {
    pub fn new(config: SwitchConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SwitchError::InvalidConfig(e.to_string()))?;
        let registry = BridgeRegistry::new(config.max_bridges, (&config).into());
        Ok(Self {
            config,
            fabric: Mutex::new(Fabric {
                registry,
                adapters: HashMap::new(),
                wrapped: HashSet::new(),
            }),
        })
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    // Global topology lock: control path only, may block.
    fn fabric(&self) -> MutexGuard<'_, Fabric> {
        lock(&self.fabric)
    }

    /// Make a hardware adapter available to ATTACH under its name.
    pub fn add_adapter(&self, adapter: Arc<dyn HardwareAdapter>) -> Result<()> {
        let mut fabric = self.fabric();
        let name = adapter.name().to_string();
        if fabric.adapters.contains_key(&name) {
            return Err(SwitchError::AlreadyAttached(name));
        }
        debug!(adapter = %name, rings = adapter.num_rx_rings(), "adapter added");
        fabric.adapters.insert(name, adapter);
        Ok(())
    }

    /// CREATE_PORT: create a virtual port `bridge:port`, creating the bridge
    /// on first use.
    pub fn create_port(&self, name: &str, spec: PortSpec) -> Result<PortHandle> {
        let (bridge_name, _) = split_port_name(name)?;
        if spec.ring_count == 0 || spec.ring_count > MAX_RINGS_PER_PORT {
            return Err(SwitchError::InvalidConfig(format!(
                "ring count {} out of range 1..={MAX_RINGS_PER_PORT}",
                spec.ring_count
            )));
        }
        if spec.slot_count < 2 {
            return Err(SwitchError::InvalidConfig(format!(
                "slot count {} below 2",
                spec.slot_count
            )));
        }
        if !offload::valid_header_len(spec.header_len) {
            return Err(SwitchError::InvalidHeaderLen(spec.header_len));
        }

        let port = Arc::new(VirtualPort::new(name, &spec, self.config.slot_size)?);
        let mut fabric = self.fabric();
        let handle = fabric.registry.find_or_create(bridge_name)?;
        match handle.attach(port) {
            Ok(id) => Ok(PortHandle {
                bridge: handle.id(),
                port: id,
            }),
            Err(e) => {
                fabric.registry.release_if_empty(handle.id());
                Err(e)
            }
        }
    }

    /// ATTACH: wrap hardware adapter `hw_ifname` into the bridge named by
    /// `name`. With `flags.host_stack` its host-stack rings become a second
    /// port `name^` in the adjacent slot.
    pub fn attach(&self, name: &str, hw_ifname: &str, flags: AttachFlags) -> Result<PortHandle> {
        let (bridge_name, _) = split_port_name(name)?;
        let mut fabric = self.fabric();
        let hw = fabric
            .adapters
            .get(hw_ifname)
            .cloned()
            .ok_or_else(|| SwitchError::NotFound(hw_ifname.to_string()))?;
        if fabric.wrapped.contains(hw_ifname) {
            return Err(SwitchError::AlreadyAttached(hw_ifname.to_string()));
        }

        let port = Arc::new(HardwareWrapperPort::new(
            name,
            Arc::clone(&hw),
            WrapperSide::Hardware,
        )?);
        let host = if flags.host_stack {
            Some(Arc::new(HardwareWrapperPort::new(
                format!("{name}^"),
                hw,
                WrapperSide::Host,
            )?))
        } else {
            None
        };

        let handle = fabric.registry.find_or_create(bridge_name)?;
        let attached = match host {
            Some(host) => handle.attach_with_host(port, host).map(|(id, _)| id),
            None => handle.attach(port),
        };
        match attached {
            Ok(id) => {
                fabric.wrapped.insert(hw_ifname.to_string());
                info!(bridge = %bridge_name, port = %name, adapter = %hw_ifname, host_stack = flags.host_stack, "adapter attached");
                Ok(PortHandle {
                    bridge: handle.id(),
                    port: id,
                })
            }
            Err(e) => {
                fabric.registry.release_if_empty(handle.id());
                Err(e)
            }
        }
    }

    /// DETACH: remove `bridge:port`. Detaching either half of a wrapped
    /// adapter detaches both. The bridge is released once empty.
    pub fn detach(&self, name: &str) -> Result<()> {
        let (bridge_name, _) = split_port_name(name)?;
        let mut fabric = self.fabric();
        let handle = fabric
            .registry
            .find(bridge_name)
            .ok_or_else(|| SwitchError::NotFound(name.to_string()))?;
        let (id, port) = handle
            .find_port(name)
            .ok_or_else(|| SwitchError::NotFound(name.to_string()))?;

        match port.adapter_name().map(str::to_string) {
            Some(adapter) => {
                let mut group: Vec<_> = handle
                    .ports()
                    .into_iter()
                    .filter(|(_, p)| p.adapter_name() == Some(adapter.as_str()))
                    .map(|(id, _)| id)
                    .collect();
                // Host half first, then the hardware half
                group.reverse();
                for member in group {
                    handle.detach(member)?;
                }
                fabric.wrapped.remove(&adapter);
            }
            None => {
                handle.detach(id)?;
            }
        }

        fabric.registry.release_if_empty(handle.id());
        Ok(())
    }

    /// LIST: the first port at or after `cursor`, in bridge then port slot
    /// order.
    pub fn list(&self, cursor: ListCursor) -> Option<ListEntry> {
        let fabric = self.fabric();
        let mut ports = fabric
            .registry
            .iter()
            .filter(|h| h.id().index() >= cursor.bridge)
            .flat_map(|h| {
                let ports = h.ports();
                ports.into_iter().map(move |(id, port)| (h.clone(), id, port))
            })
            .filter(|(h, id, _)| {
                h.id().index() > cursor.bridge || id.index().as_usize() >= cursor.port
            })
            .peekable();

        let (handle, id, port) = ports.next()?;
        let next = ports.peek().map(|(h, id, _)| ListCursor {
            bridge: h.id().index(),
            port: id.index().as_usize(),
        });
        Some(list_entry(&handle, id, port.as_ref(), next))
    }

    /// Every port, by walking LIST from the start.
    pub fn list_all(&self) -> Vec<ListEntry> {
        let mut entries = Vec::new();
        let mut cursor = Some(ListCursor::default());
        while let Some(c) = cursor
            && let Some(entry) = self.list(c)
        {
            cursor = entry.next;
            entries.push(entry);
        }
        entries
    }

    /// SET_LOOKUP
    pub fn set_lookup(&self, bridge: &str, lookup: Arc<dyn LookupFn>) -> Result<()> {
        let handle = self.find_bridge(bridge)?;
        handle.set_lookup(lookup);
        Ok(())
    }

    /// SET_HEADER_LEN
    pub fn set_header_len(&self, name: &str, len: usize) -> Result<()> {
        if !offload::valid_header_len(len) {
            return Err(SwitchError::InvalidHeaderLen(len));
        }
        let (bridge_name, _) = split_port_name(name)?;
        let handle = self.find_bridge(bridge_name)?;
        let (id, _) = handle
            .find_port(name)
            .ok_or_else(|| SwitchError::NotFound(name.to_string()))?;
        handle.set_header_len(id, len)
    }

    pub fn port(&self, name: &str) -> Option<Arc<dyn Port>> {
        let (bridge_name, _) = split_port_name(name).ok()?;
        let handle = self.fabric().registry.find(bridge_name)?;
        handle.find_port(name).map(|(_, port)| port)
    }

    pub fn bridge(&self, name: &str) -> Option<Arc<Bridge>> {
        self.fabric()
            .registry
            .find(name)
            .map(|h| Arc::clone(h.bridge()))
    }

    /// Number of live bridges
    pub fn bridge_count(&self) -> usize {
        self.fabric().registry.len()
    }

    fn find_bridge(&self, name: &str) -> Result<BridgeHandle> {
        self.fabric()
            .registry
            .find(name)
            .ok_or_else(|| SwitchError::NotFound(name.to_string()))
    }
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fabric = self.fabric();
        f.debug_struct("Switch")
            .field("registry", &fabric.registry)
            .field("adapters", &fabric.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn list_entry(handle: &BridgeHandle, id: PortId, port: &dyn Port, next: Option<ListCursor>) -> ListEntry {
    ListEntry {
        bridge: handle.name().to_string(),
        port: port.name().to_string(),
        kind: port.kind(),
        index: id.index(),
        tx_rings: port.num_tx_rings(),
        rx_rings: port.num_rx_rings(),
        state: port.state().as_str(),
        header_len: port.header_len(),
        extra_bufs: port.extra_bufs(),
        stats: port.stats().snapshot(),
        next,
    }
}
