//! Virtio-net header conversion between ports with different header lengths.
//!
//! Ports carry a 0, 10 or 12 byte virtio-net header in front of every
//! Ethernet frame. When source and destination disagree, flush sends the
//! frame through [`convert`], which rewrites the header and, when the
//! destination cannot take the offload, finishes the work in software:
//! partial checksums are completed and TCP GSO frames are segmented.

use smoltcp::wire::{
    EthernetFrame, EthernetProtocol, IpAddress, IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket,
};
use thiserror::Error;

/// Plain virtio-net header
pub const VIRTIO_NET_HDR_LEN: usize = 10;
/// Header with `num_buffers` (mergeable rx buffers)
pub const VIRTIO_NET_HDR_MRG_LEN: usize = 12;

/// Ethernet + IPv6 + TCP with maximum options
pub const WORST_CASE_GSO_HEADER: usize = 14 + 40 + 60;

pub const VIRTIO_NET_HDR_F_NEEDS_CSUM: u8 = 1;
pub const VIRTIO_NET_HDR_F_DATA_VALID: u8 = 2;

pub const VIRTIO_NET_HDR_GSO_NONE: u8 = 0;
pub const VIRTIO_NET_HDR_GSO_TCPV4: u8 = 1;
pub const VIRTIO_NET_HDR_GSO_UDP: u8 = 3;
pub const VIRTIO_NET_HDR_GSO_TCPV6: u8 = 4;
pub const VIRTIO_NET_HDR_GSO_ECN: u8 = 0x80;

const ETH_HDR_LEN: usize = 14;
const IPV6_HDR_LEN: usize = 40;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OffloadError {
    #[error("frame shorter than its {0}-byte virtio-net header")]
    Truncated(usize),

    #[error("unsupported GSO type {0:#x}")]
    UnsupportedGso(u8),

    #[error("malformed {0} header")]
    Malformed(&'static str),

    #[error("checksum offset {0} beyond frame")]
    BadChecksumOffset(usize),
}

pub fn valid_header_len(len: usize) -> bool {
    matches!(len, 0 | VIRTIO_NET_HDR_LEN | VIRTIO_NET_HDR_MRG_LEN)
}

/// Virtio net header, host byte order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

impl VirtioNetHdr {
    /// Parse a header of `buf.len()` bytes (0, 10 or 12). An empty buffer
    /// yields the all-zero header.
    pub fn parse(buf: &[u8]) -> Self {
        let le = |at: usize| {
            buf.get(at..at + 2)
                .map_or(0, |b| u16::from_le_bytes([b[0], b[1]]))
        };
        if buf.len() < VIRTIO_NET_HDR_LEN {
            return Self::default();
        }
        Self {
            flags: buf[0],
            gso_type: buf[1],
            hdr_len: le(2),
            gso_size: le(4),
            csum_start: le(6),
            csum_offset: le(8),
            num_buffers: if buf.len() >= VIRTIO_NET_HDR_MRG_LEN { le(10) } else { 0 },
        }
    }

    /// Append the `len`-byte encoding to `out`.
    pub fn emit(&self, len: usize, out: &mut Vec<u8>) {
        if len == 0 {
            return;
        }
        out.push(self.flags);
        out.push(self.gso_type);
        for field in [self.hdr_len, self.gso_size, self.csum_start, self.csum_offset] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        if len >= VIRTIO_NET_HDR_MRG_LEN {
            out.extend_from_slice(&self.num_buffers.to_le_bytes());
        }
    }

    fn gso(&self) -> u8 {
        self.gso_type & !VIRTIO_NET_HDR_GSO_ECN
    }
}

/// Slots to lease toward a destination whose header differs from the
/// source's. Segmentation toward a smaller frame size can multiply the
/// slot count; this is a heuristic upper bound, not an exact figure.
pub fn mismatch_slots(needed: u32, src_mfs: usize, dst_mfs: usize) -> u32 {
    if dst_mfs >= src_mfs || dst_mfs <= WORST_CASE_GSO_HEADER {
        return needed;
    }
    let scaled = needed as u64 * src_mfs as u64 / (dst_mfs - WORST_CASE_GSO_HEADER) as u64 + 1;
    scaled.min(u32::MAX as u64) as u32
}

/// Re-encode `frame` (prefixed by a `src_hdr_len` header) for a port with
/// `dst_hdr_len` and maximum frame size `dst_mfs`. Output frames are pushed
/// onto `out`.
pub fn convert(
    frame: &[u8],
    src_hdr_len: usize,
    dst_hdr_len: usize,
    dst_mfs: usize,
    out: &mut Vec<Vec<u8>>,
) -> Result<(), OffloadError> {
    if frame.len() < src_hdr_len {
        return Err(OffloadError::Truncated(src_hdr_len));
    }
    let hdr = VirtioNetHdr::parse(&frame[..src_hdr_len]);
    let eth = &frame[src_hdr_len..];
    let gso = hdr.gso();

    if gso == VIRTIO_NET_HDR_GSO_NONE || eth.len() <= dst_mfs {
        let mut buf = Vec::with_capacity(dst_hdr_len + eth.len());
        if dst_hdr_len > 0 {
            let mut out_hdr = hdr;
            out_hdr.num_buffers = 1;
            out_hdr.emit(dst_hdr_len, &mut buf);
            buf.extend_from_slice(eth);
        } else {
            buf.extend_from_slice(eth);
            if hdr.flags & VIRTIO_NET_HDR_F_NEEDS_CSUM != 0 {
                finalize_checksum(&mut buf, hdr.csum_start, hdr.csum_offset)?;
            }
        }
        out.push(buf);
        return Ok(());
    }

    match gso {
        VIRTIO_NET_HDR_GSO_TCPV4 | VIRTIO_NET_HDR_GSO_TCPV6 => {
            segment_tcp(eth, hdr.gso_size as usize, dst_hdr_len, dst_mfs, out)
        }
        other => Err(OffloadError::UnsupportedGso(other)),
    }
}

/// Write the one's complement checksum of `packet[csum_start..]` at
/// `csum_start + csum_offset`. The field holds the pseudo-header sum on
/// entry.
pub fn finalize_checksum(
    packet: &mut [u8],
    csum_start: u16,
    csum_offset: u16,
) -> Result<(), OffloadError> {
    let start = csum_start as usize;
    let pos = start + csum_offset as usize;
    if pos + 2 > packet.len() {
        return Err(OffloadError::BadChecksumOffset(pos));
    }

    let checksum = !fold(sum_words(&packet[start..]));
    packet[pos..pos + 2].copy_from_slice(&checksum.to_be_bytes());
    Ok(())
}

fn sum_words(data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u32 = chunks
        .by_ref()
        .map(|w| u16::from_be_bytes([w[0], w[1]]) as u32)
        .fold(0, u32::wrapping_add);
    if let [odd] = chunks.remainder() {
        sum = sum.wrapping_add((*odd as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

#[derive(Clone, Copy)]
enum L3 {
    V4 { header_len: usize, ident: u16 },
    V6,
}

/// Split a TCP GSO frame into MSS-sized segments.
fn segment_tcp(
    eth: &[u8],
    gso_size: usize,
    dst_hdr_len: usize,
    dst_mfs: usize,
    out: &mut Vec<Vec<u8>>,
) -> Result<(), OffloadError> {
    let frame = EthernetFrame::new_checked(eth).map_err(|_| OffloadError::Malformed("ethernet"))?;
    let l3_bytes = &eth[ETH_HDR_LEN..];

    let (l3, tcp_off, addrs) = match frame.ethertype() {
        EthernetProtocol::Ipv4 => {
            let ip = Ipv4Packet::new_checked(l3_bytes).map_err(|_| OffloadError::Malformed("ipv4"))?;
            if ip.next_header() != IpProtocol::Tcp {
                return Err(OffloadError::Malformed("ipv4 payload"));
            }
            let header_len = ip.header_len() as usize;
            let addrs = (IpAddress::Ipv4(ip.src_addr()), IpAddress::Ipv4(ip.dst_addr()));
            (
                L3::V4 {
                    header_len,
                    ident: ip.ident(),
                },
                ETH_HDR_LEN + header_len,
                addrs,
            )
        }
        EthernetProtocol::Ipv6 => {
            let ip = Ipv6Packet::new_checked(l3_bytes).map_err(|_| OffloadError::Malformed("ipv6"))?;
            // Extension headers are not walked
            if ip.next_header() != IpProtocol::Tcp {
                return Err(OffloadError::Malformed("ipv6 payload"));
            }
            let addrs = (IpAddress::Ipv6(ip.src_addr()), IpAddress::Ipv6(ip.dst_addr()));
            (L3::V6, ETH_HDR_LEN + IPV6_HDR_LEN, addrs)
        }
        _ => return Err(OffloadError::Malformed("ethertype")),
    };

    let tcp = TcpPacket::new_checked(&eth[tcp_off..]).map_err(|_| OffloadError::Malformed("tcp"))?;
    let tcp_hdr_len = tcp.header_len() as usize;
    let seq = tcp.seq_number();
    let (fin, psh) = (tcp.fin(), tcp.psh());
    let headers_len = tcp_off + tcp_hdr_len;

    let room = dst_mfs.saturating_sub(headers_len);
    let mss = if gso_size == 0 { room } else { gso_size.min(room) };
    if mss == 0 {
        return Err(OffloadError::Malformed("gso_size"));
    }

    let payload = &eth[headers_len..];
    let seg_hdr = VirtioNetHdr {
        flags: VIRTIO_NET_HDR_F_DATA_VALID,
        num_buffers: 1,
        ..Default::default()
    };
    let count = payload.len().div_ceil(mss).max(1);
    for (k, chunk) in payload.chunks(mss).enumerate() {
        let last = k + 1 == count;
        let mut seg = Vec::with_capacity(dst_hdr_len + headers_len + chunk.len());
        seg_hdr.emit(dst_hdr_len, &mut seg);
        seg.extend_from_slice(&eth[..headers_len]);
        seg.extend_from_slice(chunk);

        let l3_start = dst_hdr_len + ETH_HDR_LEN;
        match l3 {
            L3::V4 { header_len, ident } => {
                let mut ip = Ipv4Packet::new_unchecked(&mut seg[l3_start..]);
                ip.set_total_len((header_len + tcp_hdr_len + chunk.len()) as u16);
                ip.set_ident(ident.wrapping_add(k as u16));
                ip.fill_checksum();
            }
            L3::V6 => {
                let mut ip = Ipv6Packet::new_unchecked(&mut seg[l3_start..]);
                ip.set_payload_len((tcp_hdr_len + chunk.len()) as u16);
            }
        }

        let mut tcp = TcpPacket::new_unchecked(&mut seg[dst_hdr_len + tcp_off..]);
        tcp.set_seq_number(seq + k * mss);
        tcp.set_fin(fin && last);
        tcp.set_psh(psh && last);
        tcp.fill_checksum(&addrs.0, &addrs.1);

        out.push(seg);
    }
    Ok(())
}
