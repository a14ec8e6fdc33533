//! Forwarding pipeline.
//!
//! [`Bridge::preflush`] harvests the frames a source ring has published into
//! a batch of descriptors. Each full batch (and the tail of the harvest) is
//! flushed in two passes: the first classifies every frame with the bridge's
//! lookup function and threads it onto a per-destination queue, the second
//! leases space in each destination ring and copies the queued frames in.
//!
//! Descriptors live in an arena owned by the source ring's consumer side and
//! queues link them by index, so the steady state allocates nothing.

use tracing::{debug, trace};

use crate::bridge::{Bridge, BridgeLimits, BridgeState, LockMode};
use crate::config::MAX_RINGS_PER_PORT;
use crate::learning::Destination;
use crate::offload;
use crate::port::{NotifyFlags, Port, PortIndex};
use crate::ring::{LeaseWriter, Ring, RingConsumer};

/// Position in the descriptor arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DescIdx(u16);

impl DescIdx {
    fn new(index: usize) -> Self {
        assert!(index <= u16::MAX as usize, "descriptor index {index} out of range");
        DescIdx(index as u16)
    }

    fn get(self) -> usize {
        self.0 as usize
    }
}

/// One harvested source slot
#[derive(Debug, Clone, Copy)]
struct FwdDesc {
    /// Slot position relative to the source consumer's cursor
    offset: u32,
    /// Fragment count of the frame; meaningful on its first descriptor only
    frags: u16,
    /// Next frame on the same destination queue
    next: Option<DescIdx>,
}

#[derive(Debug, Clone, Copy, Default)]
struct DestQueue {
    head: Option<DescIdx>,
    tail: Option<DescIdx>,
}

/// Per-source-ring forwarding state, kept between flushes.
pub struct ForwardScratch {
    descs: Vec<FwdDesc>,
    batch_limit: usize,
    /// One queue per (destination port, rx ring) plus a trailing broadcast
    /// queue
    queues: Box<[DestQueue]>,
    /// Queues that received frames in the current flush
    dests: Vec<usize>,
    gather: Vec<u8>,
    segments: Vec<Vec<u8>>,
}

impl ForwardScratch {
    pub fn new(limits: &BridgeLimits) -> Self {
        let queues = limits.max_ports * MAX_RINGS_PER_PORT + 1;
        Self {
            descs: Vec::with_capacity(limits.batch_limit),
            batch_limit: limits.batch_limit,
            queues: vec![DestQueue::default(); queues].into_boxed_slice(),
            dests: Vec::with_capacity(queues),
            gather: Vec::new(),
            segments: Vec::new(),
        }
    }

    /// Whether this scratch was sized for `limits`
    pub fn fits(&self, limits: &BridgeLimits) -> bool {
        self.batch_limit == limits.batch_limit
            && self.queues.len() == limits.max_ports * MAX_RINGS_PER_PORT + 1
    }

    fn is_full(&self) -> bool {
        self.descs.len() >= self.batch_limit
    }

    fn push(&mut self, offset: u32) {
        self.descs.push(FwdDesc {
            offset,
            frags: 1,
            next: None,
        });
    }

    /// Mark descriptors `first..` as one frame.
    fn close_frame(&mut self, first: usize) {
        let frags = self.descs.len() - first;
        self.descs[first].frags = frags as u16;
    }

    fn broadcast_queue(&self) -> usize {
        self.queues.len() - 1
    }

    fn append(&mut self, q: usize, idx: DescIdx) {
        let broadcast = self.broadcast_queue();
        let queue = &mut self.queues[q];
        match queue.tail {
            Some(tail) => self.descs[tail.get()].next = Some(idx),
            None => {
                queue.head = Some(idx);
                if q != broadcast {
                    self.dests.push(q);
                }
            }
        }
        queue.tail = Some(idx);
    }

    fn reset_queues(&mut self) {
        for &q in &self.dests {
            self.queues[q] = DestQueue::default();
        }
        let broadcast = self.broadcast_queue();
        self.queues[broadcast] = DestQueue::default();
        self.dests.clear();
    }
}

fn queue_index(port: PortIndex, ring: usize) -> usize {
    port.as_usize() * MAX_RINGS_PER_PORT + ring
}

/// Walks a unicast queue and the broadcast queue together in arrival order.
#[derive(Debug, Clone, Copy)]
struct Merge {
    unicast: Option<DescIdx>,
    broadcast: Option<DescIdx>,
}

impl Merge {
    /// Next frame and whether it came from the unicast queue
    fn peek(&self) -> Option<(DescIdx, bool)> {
        match (self.unicast, self.broadcast) {
            (Some(u), Some(b)) if b < u => Some((b, false)),
            (Some(u), _) => Some((u, true)),
            (None, Some(b)) => Some((b, false)),
            (None, None) => None,
        }
    }

    fn advance(&mut self, descs: &[FwdDesc], from_unicast: bool) {
        let cursor = if from_unicast {
            &mut self.unicast
        } else {
            &mut self.broadcast
        };
        *cursor = cursor.and_then(|i| descs[i.get()].next);
    }

    /// Frames and slots still to deliver
    fn remaining(mut self, descs: &[FwdDesc]) -> (u64, u32) {
        let (mut frames, mut slots) = (0, 0);
        while let Some((idx, from_unicast)) = self.peek() {
            frames += 1;
            slots += descs[idx.get()].frags as u32;
            self.advance(descs, from_unicast);
        }
        (frames, slots)
    }
}

struct Source<'a> {
    index: PortIndex,
    port: &'a dyn Port,
    ring: usize,
    header_len: usize,
    mfs: usize,
}

enum CopyOutcome {
    Copied,
    NoRoom,
    Dropped,
}

impl Bridge {
    /// Forward the frames published on `src_ring` (tx ring `ring` of port
    /// `src`) up to position `head`, and return the source's new consumer
    /// cursor.
    ///
    /// In [`LockMode::NoSleep`] a busy bridge or a source ring already being
    /// consumed elsewhere yields no progress; the caller retries later.
    pub fn preflush(
        &self,
        src: PortIndex,
        src_ring: &Ring,
        ring: usize,
        head: u32,
        mode: LockMode,
    ) -> u32 {
        let Some(state) = self.read_state(mode) else {
            trace!(bridge = %self.name(), port = %src, "bridge busy");
            return src_ring.owner_cursor();
        };
        let Some(port) = state.port(src) else {
            return src_ring.owner_cursor();
        };
        let mut consumer = match mode {
            LockMode::MaySleep => src_ring.consumer(),
            LockMode::NoSleep => match src_ring.try_consumer() {
                Some(consumer) => consumer,
                None => return src_ring.owner_cursor(),
            },
        };

        let limits = self.limits();
        let mut scratch = match consumer.take_scratch() {
            Some(scratch) if scratch.fits(&limits) => scratch,
            _ => Box::new(ForwardScratch::new(&limits)),
        };
        let source = Source {
            index: src,
            port: port.as_ref(),
            ring,
            header_len: port.header_len(),
            mfs: port.mfs(),
        };

        let avail = src_ring
            .distance(consumer.cursor(), head)
            .min(consumer.pending());
        // Slots before `consumed` belong to frames already handled
        let mut consumed = 0u32;
        // Arena index where the frame being harvested starts
        let mut frame_desc = 0usize;
        let mut skipping = false;
        let mut harvested = 0u64;
        let mut oversized = 0u64;

        for off in 0..avail {
            let more = consumer.slot(off).has_more();
            if skipping {
                if !more {
                    skipping = false;
                    consumed = off + 1;
                    oversized += 1;
                }
                continue;
            }
            if scratch.is_full() {
                if frame_desc == 0 {
                    // The frame alone outgrows a batch
                    scratch.descs.clear();
                    if more {
                        skipping = true;
                    } else {
                        consumed = off + 1;
                        oversized += 1;
                    }
                    continue;
                }
                self.flush(&state, &source, &consumer, &mut scratch, frame_desc);
                scratch.descs.drain(..frame_desc);
                frame_desc = 0;
            }
            scratch.push(off);
            if !more {
                scratch.close_frame(frame_desc);
                harvested += 1;
                consumed = off + 1;
                frame_desc = scratch.descs.len();
                if scratch.is_full() {
                    self.flush(&state, &source, &consumer, &mut scratch, frame_desc);
                    scratch.descs.clear();
                    frame_desc = 0;
                }
            }
        }

        // A trailing incomplete frame stays in the ring until its last
        // fragment is published
        scratch.descs.truncate(frame_desc);
        if frame_desc > 0 {
            self.flush(&state, &source, &consumer, &mut scratch, frame_desc);
        }
        scratch.descs.clear();

        consumer.release(consumed);
        consumer.put_scratch(scratch);
        port.stats().add_tx(harvested);
        if oversized > 0 {
            port.stats().add_dropped(oversized);
            debug!(bridge = %self.name(), port = %port.name(), oversized, "frames larger than a batch dropped");
        }
        consumer.cursor()
    }

    /// Deliver the first `count` descriptors of `scratch`.
    fn flush(
        &self,
        state: &BridgeState,
        src: &Source<'_>,
        consumer: &RingConsumer<'_>,
        scratch: &mut ForwardScratch,
        count: usize,
    ) {
        let lookup = state.lookup();
        let broadcast = scratch.broadcast_queue();

        let mut i = 0;
        while i < count {
            let desc = scratch.descs[i];
            let frags = desc.frags.max(1) as usize;
            let frame = consumer.slot(desc.offset).payload();
            match lookup.lookup(frame, src.header_len, src.index, self.learning()) {
                Destination::Unicast(dst) if dst != src.index => {
                    if let Some(port) = state.port(dst)
                        && port.num_rx_rings() > 0
                    {
                        let q = queue_index(dst, src.ring % port.num_rx_rings());
                        scratch.append(q, DescIdx::new(i));
                    }
                }
                Destination::Broadcast => {
                    scratch.append(broadcast, DescIdx::new(i));
                }
                _ => {}
            }
            i += frags;
        }

        // Broadcast frames go to ring 0 of every other port
        if scratch.queues[broadcast].head.is_some() {
            for &p in state.active() {
                let q = queue_index(p, 0);
                if p != src.index && scratch.queues[q].head.is_none() {
                    scratch.dests.push(q);
                }
            }
        }

        for k in 0..scratch.dests.len() {
            let q = scratch.dests[k];
            self.dispatch(state, src, consumer, scratch, q);
        }
        scratch.reset_queues();
    }

    /// Copy queue `q` (merged with the broadcast queue on ring 0) into its
    /// destination ring.
    fn dispatch(
        &self,
        state: &BridgeState,
        src: &Source<'_>,
        consumer: &RingConsumer<'_>,
        scratch: &mut ForwardScratch,
        q: usize,
    ) {
        let dst_index = PortIndex::new((q / MAX_RINGS_PER_PORT) as u16);
        let ring = q % MAX_RINGS_PER_PORT;
        let broadcast = scratch.broadcast_queue();
        let ForwardScratch {
            descs,
            queues,
            gather,
            segments,
            ..
        } = scratch;
        let descs = &descs[..];

        let mut merge = Merge {
            unicast: queues[q].head,
            broadcast: if ring == 0 { queues[broadcast].head } else { None },
        };
        let Some(dst) = state.port(dst_index) else {
            return;
        };

        let mut delivered = 0u64;
        if let Some(dst_ring) = dst.rx_ring(ring) {
            let dst_hdr = dst.header_len();
            let mismatch = dst_hdr != src.header_len;
            let dst_mfs = dst.mfs();
            let mut retries = if dst.retries_on_backpressure() {
                self.limits().hw_retry_limit
            } else {
                0
            };

            loop {
                let (_, slots) = merge.remaining(descs);
                let needed = if mismatch {
                    offload::mismatch_slots(slots, src.mfs, dst_mfs)
                } else {
                    slots
                };
                let Some(mut writer) = dst_ring.begin_lease(needed) else {
                    break;
                };
                let granted = writer.capacity();

                while let Some((idx, from_unicast)) = merge.peek() {
                    let outcome = if mismatch {
                        copy_converted(
                            consumer,
                            descs,
                            idx,
                            Conversion {
                                src_hdr: src.header_len,
                                dst_hdr,
                                dst_mfs,
                            },
                            gather,
                            segments,
                            &mut writer,
                        )
                    } else {
                        copy_direct(consumer, descs, idx, &mut writer)
                    };
                    match outcome {
                        CopyOutcome::NoRoom => break,
                        CopyOutcome::Copied => delivered += 1,
                        CopyOutcome::Dropped => dst.stats().add_mismatch_drop(),
                    }
                    merge.advance(descs, from_unicast);
                }

                let retrying = merge.peek().is_some() && retries > 0 && needed > granted;
                let published = writer.finish().is_some();
                if published {
                    dst.notify(ring, NotifyFlags { retrying });
                }
                if !(retrying && published) {
                    break;
                }
                retries -= 1;
                trace!(bridge = %self.name(), port = %dst.name(), ring, retries, "retrying destination");
            }

            let (left, _) = merge.remaining(descs);
            if left > 0 {
                dst_ring.record_drops(left);
            }
        }

        let (left, _) = merge.remaining(descs);
        if left > 0 {
            dst.stats().add_dropped(left);
            debug!(
                bridge = %self.name(),
                src = %src.port.name(),
                dst = %dst.name(),
                ring,
                dropped = left,
                "destination ring full or stopped"
            );
        }
        if delivered > 0 {
            dst.stats().add_rx(delivered);
        }
    }
}

fn copy_direct(
    consumer: &RingConsumer<'_>,
    descs: &[FwdDesc],
    idx: DescIdx,
    writer: &mut LeaseWriter<'_>,
) -> CopyOutcome {
    let first = idx.get();
    let frags = descs[first].frags.max(1) as usize;
    if frags > writer.remaining() as usize {
        return CopyOutcome::NoRoom;
    }
    for (k, desc) in descs[first..first + frags].iter().enumerate() {
        writer.push_fragment(consumer.slot(desc.offset).payload(), k + 1 < frags);
    }
    CopyOutcome::Copied
}

#[derive(Clone, Copy)]
struct Conversion {
    src_hdr: usize,
    dst_hdr: usize,
    dst_mfs: usize,
}

fn copy_converted(
    consumer: &RingConsumer<'_>,
    descs: &[FwdDesc],
    idx: DescIdx,
    conv: Conversion,
    gather: &mut Vec<u8>,
    segments: &mut Vec<Vec<u8>>,
    writer: &mut LeaseWriter<'_>,
) -> CopyOutcome {
    let first = idx.get();
    let frags = descs[first].frags.max(1) as usize;
    gather.clear();
    for desc in &descs[first..first + frags] {
        gather.extend_from_slice(consumer.slot(desc.offset).payload());
    }

    segments.clear();
    if let Err(e) = offload::convert(gather, conv.src_hdr, conv.dst_hdr, conv.dst_mfs, segments) {
        trace!(error = %e, "offload conversion failed");
        return CopyOutcome::Dropped;
    }

    let slot_size = writer.slot_size();
    let needed: usize = segments
        .iter()
        .map(|s| s.len().div_ceil(slot_size).max(1))
        .sum();
    if needed > writer.remaining() as usize {
        return CopyOutcome::NoRoom;
    }
    for segment in segments.iter() {
        writer.write_frame(segment);
    }
    CopyOutcome::Copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortSpec, PortSpecBuilder};
    use crate::port::VirtualPort;
    use crate::test_util::frames::{BROADCAST, ethernet_frame, mac, tcp_gso_frame};
    use std::sync::Arc;

    fn bridge(batch_limit: usize) -> Arc<Bridge> {
        Arc::new(Bridge::new(
            "sw0",
            BridgeLimits {
                max_ports: 8,
                batch_limit,
                hw_retry_limit: 2,
            },
        ))
    }

    fn attach(bridge: &Arc<Bridge>, name: &str, spec: &PortSpec, slot_size: usize) -> Arc<VirtualPort> {
        let port = Arc::new(VirtualPort::new(name, spec, slot_size).unwrap());
        bridge.attach(port.clone()).unwrap();
        port
    }

    fn three_ports(batch_limit: usize) -> (Arc<Bridge>, Vec<Arc<VirtualPort>>) {
        let bridge = bridge(batch_limit);
        let spec = PortSpecBuilder::new(1, 64).build();
        let ports = ["sw0:a", "sw0:b", "sw0:c"]
            .iter()
            .map(|name| attach(&bridge, name, &spec, 256))
            .collect();
        (bridge, ports)
    }

    #[test]
    fn test_unknown_destination_floods_then_learns() {
        let (_bridge, ports) = three_ports(64);
        let (a, b, c) = (&ports[0], &ports[1], &ports[2]);

        let to_b = ethernet_frame(mac(2), mac(1), b"hello");
        a.send(0, &[&to_b]);
        assert_eq!(b.recv(0), vec![to_b.clone()]);
        assert_eq!(c.recv(0), vec![to_b]);
        assert!(a.recv(0).is_empty());

        let to_a = ethernet_frame(mac(1), mac(2), b"reply");
        b.send(0, &[&to_a]);
        assert_eq!(a.recv(0), vec![to_a]);
        assert!(c.recv(0).is_empty());
        assert_eq!(a.stats().snapshot().tx_frames, 1);
        assert_eq!(a.stats().snapshot().rx_frames, 1);
    }

    #[test]
    fn test_broadcast_skips_source() {
        let (_bridge, ports) = three_ports(64);
        let frame = ethernet_frame(BROADCAST, mac(1), b"who-has");
        ports[1].send(0, &[&frame]);
        assert_eq!(ports[0].recv(0), vec![frame.clone()]);
        assert_eq!(ports[2].recv(0), vec![frame]);
        assert!(ports[1].recv(0).is_empty());
    }

    #[test]
    fn test_unicast_to_self_dropped() {
        let (bridge, ports) = three_ports(64);
        bridge.learning().observe(mac(9), PortIndex::new(0));
        let frame = ethernet_frame(mac(9), mac(1), b"loop");
        ports[0].send(0, &[&frame]);
        for port in &ports {
            assert!(port.recv(0).is_empty());
        }
        assert_eq!(ports[0].tx_ring(0).unwrap().owner_cursor(), 1);
    }

    #[test]
    fn test_batches_split_across_flushes() {
        let (_bridge, ports) = three_ports(4);
        let frames: Vec<_> = (0..10u8)
            .map(|i| ethernet_frame(BROADCAST, mac(1), &[i; 20]))
            .collect();
        assert_eq!(ports[0].send(0, &frames), 10);
        assert_eq!(ports[1].recv(0), frames);
        assert_eq!(ports[2].recv(0), frames);
    }

    #[test]
    fn test_frame_larger_than_batch_dropped() {
        let bridge = bridge(2);
        let spec = PortSpecBuilder::new(1, 32).build();
        let a = attach(&bridge, "sw0:a", &spec, 64);
        let b = attach(&bridge, "sw0:b", &spec, 64);

        // Three slots at 64 bytes each
        let big = ethernet_frame(BROADCAST, mac(1), &[7; 150]);
        let small = ethernet_frame(BROADCAST, mac(1), &[1; 20]);
        a.send(0, &[&big, &small]);

        assert_eq!(b.recv(0), vec![small]);
        assert_eq!(a.stats().snapshot().dropped, 1);
        let tx = a.tx_ring(0).unwrap();
        assert_eq!(tx.owner_cursor(), tx.published_tail());
    }

    #[test]
    fn test_multi_slot_frames_keep_fragments() {
        let bridge = bridge(64);
        let spec = PortSpecBuilder::new(1, 32).build();
        let a = attach(&bridge, "sw0:a", &spec, 64);
        let b = attach(&bridge, "sw0:b", &spec, 64);

        let big = ethernet_frame(BROADCAST, mac(1), &[3; 200]);
        a.send(0, &[&big]);
        assert_eq!(b.recv(0), vec![big]);
    }

    #[test]
    fn test_incomplete_frame_left_in_ring() {
        let (bridge, ports) = three_ports(64);
        let a = &ports[0];
        let tx = a.tx_ring(0).unwrap();
        let frame = ethernet_frame(BROADCAST, mac(1), &[5; 40]);

        let mut writer = tx.begin_lease(2).unwrap();
        writer.push_fragment(&frame[..30], true);
        writer.finish();
        let cursor = bridge.push(PortIndex::new(0), 0, LockMode::MaySleep);
        assert_eq!(cursor, 0);
        assert!(ports[1].recv(0).is_empty());

        let mut writer = tx.begin_lease(1).unwrap();
        writer.push_fragment(&frame[30..], false);
        writer.finish();
        let cursor = bridge.push(PortIndex::new(0), 0, LockMode::MaySleep);
        assert_eq!(cursor, 2);
        assert_eq!(ports[1].recv(0), vec![frame]);
    }

    #[test]
    fn test_full_destination_counts_drops() {
        let bridge = bridge(64);
        let a = attach(&bridge, "sw0:a", &PortSpecBuilder::new(1, 64).build(), 256);
        let b = attach(&bridge, "sw0:b", &PortSpecBuilder::new(1, 4).build(), 256);

        let frames: Vec<_> = (0..6u8)
            .map(|i| ethernet_frame(BROADCAST, mac(1), &[i; 20]))
            .collect();
        a.send(0, &frames);

        // A ring of four slots holds three frames
        assert_eq!(b.recv(0), frames[..3].to_vec());
        let stats = b.stats().snapshot();
        assert_eq!(stats.rx_frames, 3);
        assert_eq!(stats.dropped, 3);
        assert_eq!(b.rx_ring(0).unwrap().dropped(), 3);
    }

    #[test]
    fn test_source_ring_maps_to_destination_ring() {
        let bridge = bridge(64);
        let a = attach(&bridge, "sw0:a", &PortSpecBuilder::new(3, 16).build(), 256);
        let b = attach(&bridge, "sw0:b", &PortSpecBuilder::new(2, 16).build(), 256);
        bridge.learning().observe(mac(2), PortIndex::new(1));

        let frame = ethernet_frame(mac(2), mac(1), b"ring2");
        a.send(2, &[&frame]);
        assert!(b.recv(1).is_empty());
        assert_eq!(b.recv(0), vec![frame.clone()]);

        a.send(1, &[&frame]);
        assert_eq!(b.recv(1), vec![frame]);
    }

    #[test]
    fn test_stopped_destination_drops() {
        let (_bridge, ports) = three_ports(64);
        ports[2].rx_ring(0).unwrap().stop();
        let frame = ethernet_frame(BROADCAST, mac(1), b"x");
        ports[0].send(0, &[&frame]);
        assert_eq!(ports[1].recv(0), vec![frame]);
        assert_eq!(ports[2].stats().snapshot().dropped, 1);
    }

    #[test]
    fn test_header_mismatch_strips_and_segments() {
        let bridge = bridge(64);
        let spec = PortSpecBuilder::new(1, 64).header_len(10).mfs(65535).build();
        let a = attach(&bridge, "sw0:a", &spec, 2048);
        let b = attach(&bridge, "sw0:b", &PortSpecBuilder::new(1, 64).build(), 2048);

        let payload = vec![0x5a; 3000];
        let frame = tcp_gso_frame(mac(2), mac(1), 1000, 1, &payload);
        a.send(0, &[&frame]);

        let out = b.recv(0);
        assert_eq!(out.len(), 3);
        for segment in &out {
            assert!(segment.len() <= 1514);
            assert_eq!(&segment[..6], mac(2).as_bytes());
        }
        assert_eq!(b.stats().snapshot().rx_frames, 1);
    }

    #[test]
    fn test_empty_slots_skipped() {
        let (_bridge, ports) = three_ports(64);
        let tx = ports[0].tx_ring(0).unwrap();
        let frame = ethernet_frame(BROADCAST, mac(1), b"after");

        let mut writer = tx.begin_lease(1).unwrap();
        writer.push_fragment(&[], false);
        writer.finish();
        assert!(tx.begin_lease(1).unwrap().write_frame(&frame));
        ports[0].sync_tx(0, tx.published_tail());

        assert_eq!(ports[1].recv(0), vec![frame]);
    }
}
