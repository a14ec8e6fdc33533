//! Traffic generators for the demo binary.
//!
//! Every endpoint (virtual port or simulated NIC) gets a sender thread that
//! pushes a burst of frames to its peer every tick and a receiver thread that
//! drains whatever the switch delivered to it. The peer of an endpoint is the
//! next endpoint on the same bridge, so a bridge with one endpoint floods.

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Topology;
use crate::control::Switch;
use crate::error::{Result, SwitchError};
use crate::port::Port;
use crate::registry::split_port_name;
use crate::test_util::SimNic;

/// Ethertype stamped on generated frames
pub const DEMO_ETHERTYPE: u16 = 0x88b5;

/// Where generated frames enter the switch
#[derive(Clone)]
pub enum Endpoint {
    /// A virtual port, by `bridge:port` name
    Virtual(Arc<dyn Port>),
    /// A simulated NIC wrapped into a bridge
    Nic(Arc<SimNic>),
}

impl Endpoint {
    fn send(&self, frames: &[Vec<u8>]) -> usize {
        match self {
            Endpoint::Virtual(port) => port.as_virtual().map_or(0, |v| v.send(0, frames)),
            Endpoint::Nic(nic) => nic.receive_batch(0, frames.iter().cloned()),
        }
    }

    /// Wait briefly for deliveries and drain them.
    fn receive(&self, timeout_ms: u16) -> usize {
        match self {
            Endpoint::Virtual(port) => {
                let Some(port) = port.as_virtual() else {
                    return 0;
                };
                (0..port.num_rx_rings())
                    .map(|ring| {
                        if let Some(notifier) = port.notifier(ring) {
                            notifier.wait(timeout_ms);
                        }
                        port.recv(ring).len()
                    })
                    .sum()
            }
            Endpoint::Nic(nic) => {
                thread::sleep(Duration::from_millis(u64::from(timeout_ms)));
                nic.transmitted(0).len()
            }
        }
    }
}

/// One endpoint with its bridge and address
#[derive(Clone)]
pub struct Station {
    pub name: String,
    pub bridge: String,
    pub mac: EthernetAddress,
    pub endpoint: Endpoint,
}

/// Totals across all generators
#[derive(Debug, Default)]
pub struct TrafficCounters {
    pub sent: AtomicU64,
    pub received: AtomicU64,
}

/// Running generator threads. Dropping without [`Traffic::stop`] leaves
/// them running until the process exits.
pub struct Traffic {
    stop: Arc<AtomicBool>,
    counters: Arc<TrafficCounters>,
    workers: Vec<JoinHandle<()>>,
}

impl Traffic {
    pub fn start(stations: &[Station], topology: &Topology) -> Result<Self> {
        if stations.is_empty() {
            return Err(SwitchError::InvalidConfig("no stations".into()));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(TrafficCounters::default());
        let tick = Duration::from_millis(topology.tick_ms.max(1));
        let wait_ms = topology.tick_ms.clamp(1, u64::from(u16::MAX)) as u16;
        let mut workers = Vec::with_capacity(stations.len() * 2);

        for (i, station) in stations.iter().enumerate() {
            let dst = peer_of(stations, i).map_or(EthernetAddress::BROADCAST, |p| p.mac);
            let src = station.mac;
            let (burst, frame_len) = (topology.frames_per_tick, topology.frame_len);

            let endpoint = station.endpoint.clone();
            let stop_tx = Arc::clone(&stop);
            let counters_tx = Arc::clone(&counters);
            let name = station.name.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("tx-{name}"))
                    .spawn(move || {
                        let mut seq = 0u64;
                        while !stop_tx.load(Ordering::Relaxed) {
                            let frames: Vec<_> = (0..burst)
                                .map(|_| {
                                    seq += 1;
                                    demo_frame(dst, src, frame_len, seq)
                                })
                                .collect();
                            let sent = endpoint.send(&frames);
                            counters_tx.sent.fetch_add(sent as u64, Ordering::Relaxed);
                            if sent < frames.len() {
                                debug!(station = %name, dropped = frames.len() - sent, "tx backlog");
                            }
                            thread::sleep(tick);
                        }
                    })?,
            );

            let endpoint = station.endpoint.clone();
            let stop_rx = Arc::clone(&stop);
            let counters_rx = Arc::clone(&counters);
            workers.push(
                thread::Builder::new()
                    .name(format!("rx-{}", station.name))
                    .spawn(move || {
                        while !stop_rx.load(Ordering::Relaxed) {
                            let n = endpoint.receive(wait_ms);
                            counters_rx.received.fetch_add(n as u64, Ordering::Relaxed);
                        }
                    })?,
            );
        }

        Ok(Self {
            stop,
            counters,
            workers,
        })
    }

    pub fn counters(&self) -> &TrafficCounters {
        &self.counters
    }

    /// Signal every generator and wait for it.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        for worker in self.workers {
            if worker.join().is_err() {
                warn!("traffic thread panicked");
            }
        }
    }
}

/// Build the demo topology on `switch`: one virtual port per
/// `topology.ports` entry and one wrapped [`SimNic`] per `topology.nics`
/// entry.
pub fn build(switch: &Switch, topology: &Topology) -> Result<Vec<Station>> {
    let config = switch.config();
    let mut stations = Vec::new();

    for name in &topology.ports {
        let (bridge, _) = split_port_name(name)?;
        switch.create_port(name, config.port_spec().build())?;
        let port = switch
            .port(name)
            .ok_or_else(|| SwitchError::NotFound(name.clone()))?;
        stations.push(Station {
            name: name.clone(),
            bridge: bridge.to_string(),
            mac: station_mac(stations.len()),
            endpoint: Endpoint::Virtual(port),
        });
    }

    for name in &topology.nics {
        let (bridge, ifname) = split_port_name(name)?;
        let nic = SimNic::new(
            ifname,
            config.ring_count,
            config.ring_slots,
            config.slot_size,
            false,
        );
        switch.add_adapter(nic.clone())?;
        switch.attach(name, ifname, Default::default())?;
        stations.push(Station {
            name: name.clone(),
            bridge: bridge.to_string(),
            mac: station_mac(stations.len()),
            endpoint: Endpoint::Nic(nic),
        });
    }
    Ok(stations)
}

fn peer_of(stations: &[Station], i: usize) -> Option<&Station> {
    let bridge = &stations[i].bridge;
    let same: Vec<usize> = (0..stations.len())
        .filter(|&j| stations[j].bridge == *bridge)
        .collect();
    if same.len() < 2 {
        return None;
    }
    let pos = same.iter().position(|&j| j == i)?;
    Some(&stations[same[(pos + 1) % same.len()]])
}

/// Locally administered address for station `n`
pub fn station_mac(n: usize) -> EthernetAddress {
    let [.., hi, lo] = (n as u32).to_be_bytes();
    EthernetAddress([0x02, 0x00, 0x5e, 0x00, hi, lo])
}

/// Ethernet frame of `len` bytes carrying `seq` at the start of its payload.
pub fn demo_frame(dst: EthernetAddress, src: EthernetAddress, len: usize, seq: u64) -> Vec<u8> {
    const ETH_HDR_LEN: usize = 14;
    let len = len.max(ETH_HDR_LEN + 8);
    let mut frame = vec![0u8; len];
    let repr = EthernetRepr {
        src_addr: src,
        dst_addr: dst,
        ethertype: EthernetProtocol::Unknown(DEMO_ETHERTYPE),
    };
    let mut eth = EthernetFrame::new_unchecked(&mut frame[..]);
    repr.emit(&mut eth);
    eth.payload_mut()[..8].copy_from_slice(&seq.to_be_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchConfig;

    fn small_config() -> SwitchConfig {
        SwitchConfig {
            ring_slots: 64,
            slot_size: 256,
            ..Default::default()
        }
    }

    #[test]
    fn test_demo_frame_layout() {
        let frame = demo_frame(station_mac(1), station_mac(2), 60, 7);
        assert_eq!(frame.len(), 60);
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.dst_addr(), station_mac(1));
        assert_eq!(eth.ethertype(), EthernetProtocol::Unknown(DEMO_ETHERTYPE));
        assert_eq!(&eth.payload()[..8], &7u64.to_be_bytes());
    }

    #[test]
    fn test_station_macs_unique_unicast() {
        assert_ne!(station_mac(0), station_mac(1));
        assert!(station_mac(300).is_unicast());
    }

    #[test]
    fn test_build_and_peers() {
        let switch = Switch::new(small_config()).unwrap();
        let topology = Topology {
            ports: vec!["sw0:a".into(), "sw0:b".into(), "sw1:c".into()],
            nics: vec!["sw0:eth0".into()],
            ..Default::default()
        };
        let stations = build(&switch, &topology).unwrap();
        assert_eq!(stations.len(), 4);

        assert_eq!(peer_of(&stations, 0).unwrap().name, "sw0:b");
        assert_eq!(peer_of(&stations, 1).unwrap().name, "sw0:eth0");
        assert_eq!(peer_of(&stations, 3).unwrap().name, "sw0:a");
        assert!(peer_of(&stations, 2).is_none());
    }

    #[test]
    fn test_traffic_flows() {
        let switch = Switch::new(small_config()).unwrap();
        let topology = Topology {
            ports: vec!["sw0:a".into(), "sw0:b".into()],
            frames_per_tick: 4,
            tick_ms: 1,
            ..Default::default()
        };
        let stations = build(&switch, &topology).unwrap();
        let traffic = Traffic::start(&stations, &topology).unwrap();
        thread::sleep(Duration::from_millis(100));
        let sent = traffic.counters().sent.load(Ordering::Relaxed);
        traffic.stop();
        assert!(sent > 0);

        let stats: u64 = switch
            .list_all()
            .iter()
            .map(|e| e.stats.rx_frames)
            .sum();
        assert!(stats > 0);
    }
}
