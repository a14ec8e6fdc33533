//! Test harness for switch integration tests
//!
//! Wraps a [`Switch`] with helpers for creating virtual ports and moving
//! frames through them by name.

#![allow(dead_code)]

use std::sync::Arc;

use mvirt_switch::config::{PortSpec, PortSpecBuilder, SwitchConfig};
use mvirt_switch::control::Switch;
use mvirt_switch::port::{Port, VirtualPort};
use smoltcp::wire::EthernetAddress;

pub use mvirt_switch::test_util::SimNic;
pub use mvirt_switch::test_util::frames::{BROADCAST, ethernet_frame, mac, tcp_gso_frame, udp_frame};

pub const MAC_A: EthernetAddress = EthernetAddress([0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa]);
pub const MAC_B: EthernetAddress = EthernetAddress([0x02, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb]);

/// Small switch: 4 bridges, 8 ports each, 256-byte slots.
pub fn small_config() -> SwitchConfig {
    SwitchConfig {
        max_bridges: 4,
        max_ports: 8,
        batch_limit: 64,
        ring_slots: 64,
        slot_size: 256,
        ..Default::default()
    }
}

pub struct TestSwitch {
    pub switch: Switch,
}

impl TestSwitch {
    pub fn new() -> Self {
        Self::with_config(small_config())
    }

    pub fn with_config(config: SwitchConfig) -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        Self {
            switch: Switch::new(config).expect("valid config"),
        }
    }

    pub fn default_spec(&self) -> PortSpec {
        PortSpecBuilder::new(1, self.switch.config().ring_slots).build()
    }

    /// Create a virtual port with the default spec.
    pub fn add_port(&self, name: &str) -> Arc<dyn Port> {
        self.add_port_with(name, self.default_spec())
    }

    pub fn add_port_with(&self, name: &str, spec: PortSpec) -> Arc<dyn Port> {
        self.switch
            .create_port(name, spec)
            .unwrap_or_else(|e| panic!("create_port {name}: {e}"));
        self.switch.port(name).expect("port just created")
    }

    pub fn port(&self, name: &str) -> Arc<dyn Port> {
        self.switch
            .port(name)
            .unwrap_or_else(|| panic!("no port {name}"))
    }

    /// Send frames from ring 0 of a virtual port.
    pub fn send(&self, name: &str, frames: &[Vec<u8>]) -> usize {
        let port = self.port(name);
        virtual_port(&port).send(0, frames)
    }

    /// Drain ring 0 of a virtual port.
    pub fn recv(&self, name: &str) -> Vec<Vec<u8>> {
        let port = self.port(name);
        virtual_port(&port).recv(0)
    }
}

pub fn virtual_port(port: &Arc<dyn Port>) -> &VirtualPort {
    port.as_virtual().expect("virtual port")
}
