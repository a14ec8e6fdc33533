//! Software Ethernet switch fabric.
//!
//! Bridges multiplex virtual and hardware-backed ports, learn which MAC
//! address lives behind which port, and move batches of frames between
//! per-port slot rings. Producers reserve destination slots through a lease
//! so the payload copy runs without holding any lock.

pub mod bridge;
pub mod config;
pub mod control;
pub mod error;
pub mod forward;
pub mod lease;
pub mod learning;
pub mod notify;
pub mod offload;
pub mod port;
pub mod registry;
pub mod ring;
pub mod test_util;
pub mod traffic;

pub use bridge::{Bridge, BridgeLimits, LockMode, PortId};
pub use config::{AttachFlags, PortSpec, PortSpecBuilder, PortState, SwitchConfig, Topology};
pub use control::{ListCursor, ListEntry, PortHandle, Switch};
pub use error::{Result, SwitchError};
pub use learning::{Destination, LearningLookup, LearningTable, LookupFn};
pub use port::{
    HardwareAdapter, HardwareWrapperPort, Port, PortIndex, PortKind, VirtualPort, WrapperSide,
};
pub use registry::{BridgeHandle, BridgeId, BridgeRegistry};
pub use ring::{LeaseWriter, Ring, RingConsumer, Slot, SlotFlags};
