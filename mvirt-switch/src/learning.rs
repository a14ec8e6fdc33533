//! MAC learning table and the default bridge lookup function.
//!
//! The table is a fixed array of 1024 single-word entries, indexed by a hash
//! of the MAC address. Each entry packs the 48-bit address with a port tag
//! (`port + 1`, zero meaning empty) and is overwritten with one atomic store,
//! so observing and looking up never block and never allocate.

use smoltcp::wire::{EthernetAddress, EthernetFrame};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::port::PortIndex;

pub const LEARNING_TABLE_SIZE: usize = 1024;

const HASH_MASK: u32 = (LEARNING_TABLE_SIZE - 1) as u32;
const MAC_BITS: u32 = 48;
const MAC_MASK: u64 = (1 << MAC_BITS) - 1;

/// Where a frame goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(PortIndex),
    Broadcast,
    Drop,
}

/// Per-bridge forwarding decision, replaceable through SET_LOOKUP.
///
/// `frame` starts with the source port's virtio-net header of `header_len`
/// bytes. Implementations run on the forwarding path and must not block.
pub trait LookupFn: Send + Sync {
    fn lookup(
        &self,
        frame: &[u8],
        header_len: usize,
        src: PortIndex,
        table: &LearningTable,
    ) -> Destination;
}

/// Learn the source, then forward on the destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct LearningLookup;

impl LookupFn for LearningLookup {
    fn lookup(
        &self,
        frame: &[u8],
        header_len: usize,
        src: PortIndex,
        table: &LearningTable,
    ) -> Destination {
        let Some(eth) = frame.get(header_len..) else {
            return Destination::Drop;
        };
        let Ok(eth) = EthernetFrame::new_checked(eth) else {
            return Destination::Drop;
        };

        let src_mac = eth.src_addr();
        if src_mac.is_unicast() {
            table.observe(src_mac, src);
        }
        table.lookup(eth.dst_addr())
    }
}

pub struct LearningTable {
    entries: Box<[AtomicU64]>,
}

impl LearningTable {
    pub fn new() -> Self {
        Self {
            entries: (0..LEARNING_TABLE_SIZE).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Remember that `mac` was last seen on `port`.
    pub fn observe(&self, mac: EthernetAddress, port: PortIndex) {
        let slot = &self.entries[mac_hash(&mac.0) as usize];
        slot.store(pack(&mac, port), Ordering::Relaxed);
    }

    pub fn lookup(&self, mac: EthernetAddress) -> Destination {
        if mac.is_multicast() {
            return Destination::Broadcast;
        }
        match self.entry(mac) {
            Some(port) => Destination::Unicast(port),
            None => Destination::Broadcast,
        }
    }

    /// Port currently learned for `mac`, if its entry was not overwritten.
    pub fn entry(&self, mac: EthernetAddress) -> Option<PortIndex> {
        let word = self.entries[mac_hash(&mac.0) as usize].load(Ordering::Relaxed);
        let tag = (word >> MAC_BITS) as u16;
        if tag == 0 || word & MAC_MASK != mac_bits(&mac) {
            return None;
        }
        Some(PortIndex::new(tag - 1))
    }

    /// Forget everything.
    pub fn clear(&self) {
        for entry in self.entries.iter() {
            entry.store(0, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.load(Ordering::Relaxed) >> MAC_BITS != 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LearningTable {
    fn default() -> Self {
        Self::new()
    }
}

fn mac_bits(mac: &EthernetAddress) -> u64 {
    mac.0.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

fn pack(mac: &EthernetAddress, port: PortIndex) -> u64 {
    ((port.as_u16() as u64 + 1) << MAC_BITS) | mac_bits(mac)
}

/// Bob Jenkins' 96-bit mix.
#[inline]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*b).wrapping_sub(*c) ^ (*c >> 13);
    *b = b.wrapping_sub(*c).wrapping_sub(*a) ^ (*a << 8);
    *c = c.wrapping_sub(*a).wrapping_sub(*b) ^ (*b >> 13);
    *a = a.wrapping_sub(*b).wrapping_sub(*c) ^ (*c >> 12);
    *b = b.wrapping_sub(*c).wrapping_sub(*a) ^ (*a << 16);
    *c = c.wrapping_sub(*a).wrapping_sub(*b) ^ (*b >> 5);
    *a = a.wrapping_sub(*b).wrapping_sub(*c) ^ (*c >> 3);
    *b = b.wrapping_sub(*c).wrapping_sub(*a) ^ (*a << 10);
    *c = c.wrapping_sub(*a).wrapping_sub(*b) ^ (*b >> 15);
}

/// Table index for a MAC address.
pub fn mac_hash(addr: &[u8; 6]) -> u32 {
    let mut a: u32 = 0x9e37_79b9;
    let mut b: u32 = 0x9e37_79b9;
    let mut c: u32 = 0;

    b = b.wrapping_add((addr[5] as u32) << 8);
    b = b.wrapping_add(addr[4] as u32);
    a = a.wrapping_add((addr[3] as u32) << 24);
    a = a.wrapping_add((addr[2] as u32) << 16);
    a = a.wrapping_add((addr[1] as u32) << 8);
    a = a.wrapping_add(addr[0] as u32);

    mix(&mut a, &mut b, &mut c);
    c & HASH_MASK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::frames::ethernet_frame;

    const MAC_A: EthernetAddress = EthernetAddress([0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa]);
    const MAC_B: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x0b]);

    #[test]
    fn test_hash_in_range_and_stable() {
        let h = mac_hash(&MAC_A.0);
        assert!(h < LEARNING_TABLE_SIZE as u32);
        assert_eq!(h, mac_hash(&MAC_A.0));
    }

    #[test]
    fn test_hash_spreads() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..64u8 {
            seen.insert(mac_hash(&[0x02, 0, 0, 0, 0, i]));
        }
        assert!(seen.len() > 48, "only {} distinct buckets", seen.len());
    }

    #[test]
    fn test_observe_then_lookup() {
        let table = LearningTable::new();
        assert_eq!(table.lookup(MAC_A), Destination::Broadcast);

        table.observe(MAC_A, PortIndex::new(3));
        assert_eq!(table.lookup(MAC_A), Destination::Unicast(PortIndex::new(3)));

        // Last writer wins
        table.observe(MAC_A, PortIndex::new(7));
        assert_eq!(table.lookup(MAC_A), Destination::Unicast(PortIndex::new(7)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_port_zero_is_not_empty() {
        let table = LearningTable::new();
        table.observe(MAC_B, PortIndex::new(0));
        assert_eq!(table.entry(MAC_B), Some(PortIndex::new(0)));
    }

    #[test]
    fn test_multicast_always_broadcast() {
        let table = LearningTable::new();
        let mcast = EthernetAddress([0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);
        table.observe(mcast, PortIndex::new(1));
        assert_eq!(table.lookup(mcast), Destination::Broadcast);
        assert_eq!(table.lookup(EthernetAddress::BROADCAST), Destination::Broadcast);
    }

    #[test]
    fn test_clear() {
        let table = LearningTable::new();
        table.observe(MAC_A, PortIndex::new(1));
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.lookup(MAC_A), Destination::Broadcast);
    }

    #[test]
    fn test_learning_lookup_learns_source() {
        let table = LearningTable::new();
        let frame = ethernet_frame(MAC_B, MAC_A, &[0u8; 46]);

        let dst = LearningLookup.lookup(&frame, 0, PortIndex::new(2), &table);
        assert_eq!(dst, Destination::Broadcast);
        assert_eq!(table.entry(MAC_A), Some(PortIndex::new(2)));

        let reply = ethernet_frame(MAC_A, MAC_B, &[0u8; 46]);
        let dst = LearningLookup.lookup(&reply, 0, PortIndex::new(5), &table);
        assert_eq!(dst, Destination::Unicast(PortIndex::new(2)));
    }

    #[test]
    fn test_learning_lookup_skips_header() {
        let table = LearningTable::new();
        let mut frame = vec![0u8; 12];
        frame.extend(ethernet_frame(MAC_B, MAC_A, &[0u8; 46]));

        LearningLookup.lookup(&frame, 12, PortIndex::new(4), &table);
        assert_eq!(table.entry(MAC_A), Some(PortIndex::new(4)));
    }

    #[test]
    fn test_learning_lookup_drops_runts() {
        let table = LearningTable::new();
        assert_eq!(
            LearningLookup.lookup(&[0u8; 13], 0, PortIndex::new(0), &table),
            Destination::Drop
        );
        assert_eq!(
            LearningLookup.lookup(&[0u8; 20], 10, PortIndex::new(0), &table),
            Destination::Drop
        );
        assert_eq!(
            LearningLookup.lookup(&[0u8; 4], 10, PortIndex::new(0), &table),
            Destination::Drop
        );
    }

    #[test]
    fn test_multicast_source_not_learned() {
        let table = LearningTable::new();
        let mcast = EthernetAddress([0x01, 0, 0, 0, 0, 9]);
        let frame = ethernet_frame(MAC_B, mcast, &[0u8; 46]);
        LearningLookup.lookup(&frame, 0, PortIndex::new(1), &table);
        assert!(table.is_empty());
    }
}
