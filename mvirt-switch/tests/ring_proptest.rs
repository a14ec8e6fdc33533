//! Property tests for ring occupancy and overflow handling

mod harness;

use std::collections::VecDeque;

use harness::{BROADCAST, MAC_A, TestSwitch, ethernet_frame};
use mvirt_switch::config::PortSpecBuilder;
use mvirt_switch::lease::Side;
use mvirt_switch::ring::Ring;
use proptest::prelude::*;

const SLOT_SIZE: usize = 64;

#[derive(Debug, Clone)]
enum Op {
    /// Lease room for these frames and write as many as fit
    Produce(Vec<Vec<u8>>),
    /// Pop up to this many frames
    Consume(usize),
}

fn frame_strategy() -> impl Strategy<Value = Vec<u8>> {
    (1..=3 * SLOT_SIZE, any::<u8>()).prop_map(|(len, seed)| {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    })
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        prop::collection::vec(frame_strategy(), 1..8).prop_map(Op::Produce),
        (0usize..10).prop_map(Op::Consume),
    ]
}

fn slots_for(frame: &[u8]) -> u32 {
    frame.len().div_ceil(SLOT_SIZE) as u32
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Whatever the interleaving, published plus free slots account for the
    /// whole ring and frames come out exactly as they went in.
    #[test]
    fn prop_ring_preserves_frames(
        num_slots in 2u32..40,
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let ring = Ring::new("prop", num_slots, SLOT_SIZE);
        let mut model: VecDeque<Vec<u8>> = VecDeque::new();

        for op in ops {
            match op {
                Op::Produce(frames) => {
                    let wanted: u32 = frames.iter().map(|f| slots_for(f)).sum();
                    let free = ring.space(Side::Producer);
                    match ring.begin_lease(wanted) {
                        Some(mut writer) => {
                            prop_assert_eq!(writer.capacity(), wanted.min(free));
                            for frame in frames {
                                if !writer.write_frame(&frame) {
                                    break;
                                }
                                model.push_back(frame);
                            }
                            writer.finish();
                        }
                        None => prop_assert_eq!(free, 0),
                    }
                }
                Op::Consume(n) => {
                    let mut consumer = ring.consumer();
                    for _ in 0..n {
                        let got = consumer.pop_frame();
                        prop_assert_eq!(got, model.pop_front());
                    }
                }
            }

            let published = ring.space(Side::Consumer);
            let free = ring.space(Side::Producer);
            prop_assert_eq!(published + free, num_slots - 1);
            let expected: u32 = model.iter().map(|f| slots_for(f)).sum();
            prop_assert_eq!(published, expected);
        }
    }

    /// Two overlapping leases finishing in either order, each using only
    /// part of its range: the consumer sees the first holder's frames, then
    /// the second's, and nothing else.
    #[test]
    fn prop_overlapping_leases_publish_in_order(
        first in prop::collection::vec(1usize..=SLOT_SIZE, 1..5),
        second in prop::collection::vec(1usize..=SLOT_SIZE, 1..5),
        first_extra in 0u32..3,
        second_extra in 0u32..3,
        second_finishes_first in any::<bool>(),
    ) {
        let ring = Ring::new("prop", 32, SLOT_SIZE);
        let frames_a: Vec<Vec<u8>> = first.iter().map(|&len| vec![0xa0; len]).collect();
        let frames_b: Vec<Vec<u8>> = second.iter().map(|&len| vec![0xb0; len]).collect();

        let mut a = ring.begin_lease(frames_a.len() as u32 + first_extra).unwrap();
        let mut b = ring.begin_lease(frames_b.len() as u32 + second_extra).unwrap();
        for frame in &frames_a {
            prop_assert!(a.write_frame(frame));
        }
        for frame in &frames_b {
            prop_assert!(b.write_frame(frame));
        }
        if second_finishes_first {
            prop_assert_eq!(b.finish(), None);
            prop_assert!(a.finish().is_some());
        } else {
            a.finish();
            b.finish();
        }

        let mut consumer = ring.consumer();
        let got: Vec<_> = std::iter::from_fn(|| consumer.pop_frame()).collect();
        let expected: Vec<_> = frames_a.into_iter().chain(frames_b).collect();
        prop_assert_eq!(got, expected);
        drop(consumer);
        prop_assert_eq!(ring.space(Side::Consumer), 0);
        prop_assert_eq!(ring.space(Side::Producer), 31);
    }

    /// Bursts into a small destination: occupancy never exceeds the ring,
    /// overflow is counted as drops and delivered frames are intact.
    #[test]
    fn prop_destination_overflow_drops_cleanly(
        dst_slots in 2u32..16,
        rounds in prop::collection::vec((1usize..40, any::<bool>()), 1..8),
    ) {
        let sw = TestSwitch::new();
        sw.add_port("sw0:src");
        let dst = sw.add_port_with("sw0:dst", PortSpecBuilder::new(1, dst_slots).build());
        let rx = dst.rx_ring(0).unwrap().clone();

        let mut pending: VecDeque<Vec<u8>> = VecDeque::new();
        let mut expected_drops = 0u64;
        let mut seq = 0u32;

        for (burst, drain) in rounds {
            let frames: Vec<_> = (0..burst)
                .map(|_| {
                    seq += 1;
                    ethernet_frame(BROADCAST, MAC_A, &seq.to_be_bytes().repeat(12))
                })
                .collect();
            let free = (dst_slots - 1) as usize - pending.len();
            let fits = burst.min(free);
            pending.extend(frames[..fits].iter().cloned());
            expected_drops += (burst - fits) as u64;

            prop_assert_eq!(sw.send("sw0:src", &frames), burst);
            prop_assert!(rx.space(Side::Consumer) <= dst_slots - 1);
            prop_assert_eq!(rx.space(Side::Consumer) as usize, pending.len());
            prop_assert_eq!(dst.stats().snapshot().dropped, expected_drops);

            if drain {
                let got = sw.recv("sw0:dst");
                prop_assert_eq!(got, pending.drain(..).collect::<Vec<_>>());
            }
        }
    }
}
