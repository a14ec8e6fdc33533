//! End-to-end switching through the control surface
//!
//! Ports are created with CREATE_PORT, frames are pushed from their tx rings
//! and read back from their rx rings.

mod harness;

use std::sync::Arc;

use harness::{BROADCAST, MAC_A, MAC_B, TestSwitch, ethernet_frame, mac, tcp_gso_frame, virtual_port};
use mvirt_switch::config::PortSpecBuilder;
use mvirt_switch::control::ListCursor;
use mvirt_switch::error::SwitchError;
use mvirt_switch::lease::Side;
use mvirt_switch::learning::Destination;
use mvirt_switch::port::PortIndex;

/// A sends from aa:aa:aa:aa:aa:aa, then B answers to that address: only A
/// gets the answer.
#[test]
fn test_learned_unicast_reaches_only_owner() {
    let sw = TestSwitch::new();
    sw.add_port("sw0:a");
    sw.add_port("sw0:b");
    sw.add_port("sw0:c");

    let hello = ethernet_frame(MAC_B, MAC_A, &[1; 46]);
    assert_eq!(sw.send("sw0:a", &[hello]), 1);
    // Unknown destination: flooded
    assert_eq!(sw.recv("sw0:b").len(), 1);
    assert_eq!(sw.recv("sw0:c").len(), 1);

    let bridge = sw.switch.bridge("sw0").unwrap();
    assert_eq!(
        bridge.learning().lookup(MAC_A),
        Destination::Unicast(PortIndex::new(0))
    );

    let reply = ethernet_frame(MAC_A, MAC_B, &[2; 46]);
    sw.send("sw0:b", &[reply.clone()]);
    assert_eq!(sw.recv("sw0:a"), vec![reply]);
    assert!(sw.recv("sw0:c").is_empty());
    assert!(sw.recv("sw0:b").is_empty());
}

/// B sends to an address nobody announced: every other port gets it.
#[test]
fn test_unlearned_destination_floods() {
    let sw = TestSwitch::new();
    for name in ["sw0:a", "sw0:b", "sw0:c", "sw0:d"] {
        sw.add_port(name);
    }

    let frame = ethernet_frame(mac(0x42), MAC_B, &[9; 46]);
    sw.send("sw0:b", &[frame.clone()]);
    for name in ["sw0:a", "sw0:c", "sw0:d"] {
        assert_eq!(sw.recv(name), vec![frame.clone()], "{name}");
    }
    assert!(sw.recv("sw0:b").is_empty());
}

#[test]
fn test_broadcast_is_byte_identical() {
    let sw = TestSwitch::new();
    for name in ["sw0:a", "sw0:b", "sw0:c"] {
        sw.add_port(name);
    }
    // Spans two 256-byte slots
    let payload: Vec<u8> = (0..400u32).map(|i| (i * 7) as u8).collect();
    let frame = ethernet_frame(BROADCAST, MAC_A, &payload);

    sw.send("sw0:a", &[frame.clone()]);
    assert_eq!(sw.recv("sw0:b"), vec![frame.clone()]);
    assert_eq!(sw.recv("sw0:c"), vec![frame]);
}

#[test]
fn test_bridges_are_isolated() {
    let sw = TestSwitch::new();
    sw.add_port("sw0:a");
    sw.add_port("sw0:b");
    sw.add_port("sw1:a");

    sw.send("sw0:a", &[ethernet_frame(BROADCAST, MAC_A, b"only sw0")]);
    assert_eq!(sw.recv("sw0:b").len(), 1);
    assert!(sw.recv("sw1:a").is_empty());
}

/// N frames into a destination with room for them: the destination's
/// published tail moves by exactly N and every payload comes back intact.
#[test]
fn test_n_frames_round_trip() {
    let sw = TestSwitch::new();
    sw.add_port("sw0:a");
    let b = sw.add_port("sw0:b");

    // Teach the bridge where MAC_B lives
    sw.send("sw0:b", &[ethernet_frame(BROADCAST, MAC_B, b"hello")]);
    sw.recv("sw0:a");

    let rx = Arc::clone(b.rx_ring(0).unwrap());
    let before = rx.published_tail();
    let frames: Vec<_> = (0..40u8)
        .map(|i| ethernet_frame(MAC_B, MAC_A, &[i; 60]))
        .collect();
    assert_eq!(sw.send("sw0:a", &frames), 40);

    assert_eq!(rx.distance(before, rx.published_tail()), 40);
    assert_eq!(sw.recv("sw0:b"), frames);
    assert_eq!(b.stats().snapshot().rx_frames, 40);
}

#[test]
fn test_excess_frames_dropped_cleanly() {
    let sw = TestSwitch::new();
    sw.add_port("sw0:a");
    sw.add_port_with("sw0:small", PortSpecBuilder::new(1, 8).build());

    let frames: Vec<_> = (0..20u8)
        .map(|i| ethernet_frame(BROADCAST, MAC_A, &[i; 50]))
        .collect();
    sw.send("sw0:a", &frames);

    let small = sw.port("sw0:small");
    assert_eq!(small.stats().snapshot().dropped, 13);
    assert_eq!(sw.recv("sw0:small"), frames[..7].to_vec());

    // The ring is healthy afterwards
    let next = ethernet_frame(BROADCAST, MAC_A, b"after");
    sw.send("sw0:a", &[next.clone()]);
    assert_eq!(sw.recv("sw0:small"), vec![next]);
    assert_eq!(small.rx_ring(0).unwrap().space(Side::Consumer), 0);
}

/// create → attach → detach → release leaves the registry as it was.
#[test]
fn test_lifecycle_restores_registry() {
    let sw = TestSwitch::new();
    assert_eq!(sw.switch.bridge_count(), 0);

    let first = sw.switch.create_port("sw0:a", sw.default_spec()).unwrap();
    sw.switch.detach("sw0:a").unwrap();
    assert_eq!(sw.switch.bridge_count(), 0);
    assert!(sw.switch.list(ListCursor::default()).is_none());

    // Same slot, new generation
    let second = sw.switch.create_port("sw0:a", sw.default_spec()).unwrap();
    assert_eq!(first.bridge.index(), second.bridge.index());
    assert_ne!(first.bridge, second.bridge);
}

#[test]
fn test_detached_port_gets_nothing() {
    let sw = TestSwitch::new();
    sw.add_port("sw0:a");
    let b = sw.add_port("sw0:b");
    sw.add_port("sw0:c");
    sw.switch.detach("sw0:b").unwrap();

    sw.send("sw0:a", &[ethernet_frame(BROADCAST, MAC_A, b"x")]);
    assert!(virtual_port(&b).recv(0).is_empty());
    assert!(b.rx_ring(0).unwrap().is_stopped());
    assert_eq!(sw.recv("sw0:c").len(), 1);
}

#[test]
fn test_list_reports_every_port() {
    let sw = TestSwitch::new();
    sw.add_port("sw0:a");
    sw.add_port("sw1:x");
    sw.add_port_with("sw0:b", PortSpecBuilder::new(2, 32).extra_bufs(16).build());

    let mut seen = Vec::new();
    let mut cursor = Some(ListCursor::default());
    while let Some(c) = cursor {
        let entry = sw.switch.list(c).unwrap();
        cursor = entry.next;
        seen.push((entry.bridge, entry.port, entry.extra_bufs));
    }
    assert_eq!(
        seen,
        vec![
            ("sw0".to_string(), "sw0:a".to_string(), 0),
            ("sw0".to_string(), "sw0:b".to_string(), 16),
            ("sw1".to_string(), "sw1:x".to_string(), 0),
        ]
    );
}

#[test]
fn test_duplicate_port_rejected() {
    let sw = TestSwitch::new();
    sw.add_port("sw0:a");
    assert!(matches!(
        sw.switch.create_port("sw0:a", sw.default_spec()),
        Err(SwitchError::AlreadyAttached(_))
    ));
}

/// A port announcing a 10-byte virtio-net header talks to a plain one: the
/// header is stripped on the way and large TCP frames are segmented.
#[test]
fn test_header_mismatch_segments() {
    let mut config = harness::small_config();
    config.slot_size = 2048;
    let sw = TestSwitch::with_config(config);
    sw.add_port_with(
        "sw0:vm",
        PortSpecBuilder::new(1, 64).header_len(10).mfs(65535).build(),
    );
    sw.add_port("sw0:wire");

    let payload: Vec<u8> = (0..4000u32).map(|i| i as u8).collect();
    let frame = tcp_gso_frame(mac(2), mac(1), 1448, 100, &payload);
    sw.send("sw0:vm", &[frame]);

    let segments = sw.recv("sw0:wire");
    assert_eq!(segments.len(), 3);
    assert!(segments.iter().all(|s| s.len() <= 1514));
    let total: usize = segments.iter().map(|s| s.len() - 54).sum();
    assert_eq!(total, payload.len());

    // And back: the plain frame gains a header
    sw.send("sw0:wire", &[ethernet_frame(mac(1), mac(2), &[0; 46])]);
    let framed = sw.recv("sw0:vm");
    assert_eq!(framed.len(), 1);
    assert_eq!(framed[0].len(), 10 + 14 + 46);
}

#[test]
fn test_set_header_len_applies_to_forwarding() {
    let sw = TestSwitch::new();
    sw.add_port("sw0:a");
    sw.add_port("sw0:b");
    sw.switch.set_header_len("sw0:b", 12).unwrap();

    let frame = ethernet_frame(BROADCAST, MAC_A, &[3; 46]);
    sw.send("sw0:a", &[frame.clone()]);
    let got = sw.recv("sw0:b");
    assert_eq!(got.len(), 1);
    assert_eq!(&got[0][12..], &frame[..]);
}
