use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Upper bound on tx/rx ring pairs per port.
pub const MAX_RINGS_PER_PORT: usize = 16;

/// Upper bound on ports per bridge.
pub const MAX_PORTS_LIMIT: usize = 254;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Switch-wide limits and defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Capacity of the bridge registry
    pub max_bridges: usize,
    /// Port slots per bridge
    pub max_ports: usize,
    /// Forwarding descriptors per flush
    pub batch_limit: usize,
    /// Default slots per ring for new virtual ports
    pub ring_slots: u32,
    /// Default tx/rx ring pairs for new virtual ports
    pub ring_count: usize,
    /// Bytes per slot buffer
    pub slot_size: usize,
    /// Default maximum frame size for new virtual ports
    pub default_mfs: usize,
    /// Extra lease attempts toward hardware destinations
    pub hw_retry_limit: u32,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            max_bridges: 8,
            max_ports: 64,
            batch_limit: 512,
            ring_slots: 1024,
            ring_count: 1,
            slot_size: 2048,
            default_mfs: 1514,
            hw_retry_limit: 2,
        }
    }
}

impl SwitchConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: SwitchConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bridges == 0 {
            return Err(ConfigError::Invalid("max_bridges must be at least 1".into()));
        }
        if self.max_ports == 0 || self.max_ports > MAX_PORTS_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_ports must be in 1..={MAX_PORTS_LIMIT}, got {}",
                self.max_ports
            )));
        }
        if self.batch_limit == 0 || self.batch_limit > u16::MAX as usize / 2 {
            return Err(ConfigError::Invalid(format!(
                "batch_limit out of range: {}",
                self.batch_limit
            )));
        }
        if self.ring_slots < 2 {
            return Err(ConfigError::Invalid("ring_slots must be at least 2".into()));
        }
        if self.ring_count == 0 || self.ring_count > MAX_RINGS_PER_PORT {
            return Err(ConfigError::Invalid(format!(
                "ring_count must be in 1..={MAX_RINGS_PER_PORT}, got {}",
                self.ring_count
            )));
        }
        if self.slot_size < 64 {
            return Err(ConfigError::Invalid(format!(
                "slot_size must be at least 64, got {}",
                self.slot_size
            )));
        }
        if self.default_mfs < 60 {
            return Err(ConfigError::Invalid(format!(
                "default_mfs too small: {}",
                self.default_mfs
            )));
        }
        Ok(())
    }

    /// CREATE_PORT arguments using this config's defaults.
    pub fn port_spec(&self) -> PortSpecBuilder {
        PortSpecBuilder::new(self.ring_count, self.ring_slots).mfs(self.default_mfs)
    }
}

/// Arguments of CREATE_PORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub ring_count: usize,
    pub slot_count: u32,
    /// Recorded and reported, no memory is reserved for them
    pub extra_bufs: u32,
    pub header_len: usize,
    pub mfs: usize,
}

/// Builder for creating PortSpec
pub struct PortSpecBuilder {
    ring_count: usize,
    slot_count: u32,
    extra_bufs: u32,
    header_len: usize,
    mfs: usize,
}

impl PortSpecBuilder {
    pub fn new(ring_count: usize, slot_count: u32) -> Self {
        Self {
            ring_count,
            slot_count,
            extra_bufs: 0,
            header_len: 0,
            mfs: 1514,
        }
    }

    pub fn extra_bufs(mut self, extra_bufs: u32) -> Self {
        self.extra_bufs = extra_bufs;
        self
    }

    pub fn header_len(mut self, header_len: usize) -> Self {
        self.header_len = header_len;
        self
    }

    pub fn mfs(mut self, mfs: usize) -> Self {
        self.mfs = mfs;
        self
    }

    pub fn build(self) -> PortSpec {
        PortSpec {
            ring_count: self.ring_count,
            slot_count: self.slot_count,
            extra_bufs: self.extra_bufs,
            header_len: self.header_len,
            mfs: self.mfs,
        }
    }
}

/// Administrative port state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Registered,
    Unregistered,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Registered => "registered",
            PortState::Unregistered => "unregistered",
        }
    }
}

impl std::str::FromStr for PortState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(PortState::Registered),
            "unregistered" => Ok(PortState::Unregistered),
            _ => Err(()),
        }
    }
}

/// ATTACH flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachFlags {
    /// Also attach the adapter's host-stack ring as a second port
    pub host_stack: bool,
}

/// Demo topology: ports to create and the traffic to push through them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    /// `bridge:port` names, created in order
    pub ports: Vec<String>,
    /// `bridge:nic` pairs; each gets a simulated NIC wrapped into the bridge
    pub nics: Vec<String>,
    /// Frames each port sends per tick
    pub frames_per_tick: usize,
    /// Ethernet frame length (header included)
    pub frame_len: usize,
    pub tick_ms: u64,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            ports: vec!["sw0:a".into(), "sw0:b".into()],
            nics: Vec::new(),
            frames_per_tick: 32,
            frame_len: 128,
            tick_ms: 10,
        }
    }
}

impl Topology {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let topology: Topology = serde_json::from_str(&raw)?;
        if topology.ports.is_empty() && topology.nics.is_empty() {
            return Err(ConfigError::Invalid("topology has no ports".into()));
        }
        if topology.frame_len < 60 {
            return Err(ConfigError::Invalid(format!(
                "frame_len too small: {}",
                topology.frame_len
            )));
        }
        Ok(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_port_state_roundtrip() {
        for state in [PortState::Registered, PortState::Unregistered] {
            let s = state.as_str();
            let parsed: PortState = s.parse().unwrap();
            assert_eq!(state, parsed);
        }
    }

    #[test]
    fn test_port_state_invalid() {
        assert!("attached".parse::<PortState>().is_err());
    }

    #[test]
    fn test_defaults_validate() {
        let config = SwitchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_bridges, 8);
        assert_eq!(config.batch_limit, 512);
        assert_eq!(config.hw_retry_limit, 2);
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_ports": 4, "ring_slots": 16}}"#).unwrap();

        let config = SwitchConfig::load(file.path()).unwrap();
        assert_eq!(config.max_ports, 4);
        assert_eq!(config.ring_slots, 16);
        assert_eq!(config.slot_size, 2048);
    }

    #[test]
    fn test_load_rejects_bad_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_ports": 300}}"#).unwrap();
        assert!(matches!(
            SwitchConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let config = SwitchConfig {
            slot_size: 32,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SwitchConfig {
            ring_slots: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            SwitchConfig::load(file.path()),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_port_spec_builder() {
        let spec = SwitchConfig::default()
            .port_spec()
            .header_len(12)
            .extra_bufs(8)
            .build();
        assert_eq!(spec.ring_count, 1);
        assert_eq!(spec.slot_count, 1024);
        assert_eq!(spec.header_len, 12);
        assert_eq!(spec.extra_bufs, 8);
        assert_eq!(spec.mfs, 1514);
    }

    #[test]
    fn test_topology_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ports": ["sw0:x", "sw0:y", "sw0:z"]}}"#).unwrap();
        let topology = Topology::load(file.path()).unwrap();
        assert_eq!(topology.ports.len(), 3);
        assert!(topology.nics.is_empty());
        assert_eq!(topology.frame_len, 128);
    }

    #[test]
    fn test_topology_rejects_runt_frames() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ports": ["sw0:x"], "frame_len": 20}}"#).unwrap();
        assert!(matches!(
            Topology::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
