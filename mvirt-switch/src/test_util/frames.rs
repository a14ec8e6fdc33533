//! Frame builders for tests
//!
//! Uses smoltcp for packet construction, matching the offload code.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpAddress, IpProtocol,
    Ipv4Address, Ipv4Packet, Ipv4Repr, TcpPacket, TcpSeqNumber, UdpPacket, UdpRepr,
};

use crate::offload::{
    VIRTIO_NET_HDR_F_NEEDS_CSUM, VIRTIO_NET_HDR_GSO_TCPV4, VIRTIO_NET_HDR_LEN, VirtioNetHdr,
};

pub const ETHERNET_HDR_SIZE: usize = 14;
pub const IP_HDR_SIZE: usize = 20;
pub const TCP_HDR_SIZE: usize = 20;
pub const UDP_HDR_SIZE: usize = 8;

/// Experimental ethertype used for opaque test payloads
pub const TEST_ETHERTYPE: u16 = 0x88b5;

pub const BROADCAST: EthernetAddress = EthernetAddress::BROADCAST;

pub const SRC_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
pub const DST_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);

/// Locally administered unicast address ending in `n`
pub fn mac(n: u8) -> EthernetAddress {
    EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, n])
}

/// Plain Ethernet frame carrying `payload`.
pub fn ethernet_frame(dst: EthernetAddress, src: EthernetAddress, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HDR_SIZE + payload.len()];
    let repr = EthernetRepr {
        src_addr: src,
        dst_addr: dst,
        ethertype: EthernetProtocol::Unknown(TEST_ETHERTYPE),
    };
    let mut eth = EthernetFrame::new_unchecked(&mut frame[..]);
    repr.emit(&mut eth);
    eth.payload_mut().copy_from_slice(payload);
    frame
}

/// Ethernet/IPv4/UDP frame with `payload_len` bytes of counting payload.
pub fn udp_frame(dst: EthernetAddress, src: EthernetAddress, payload_len: usize) -> Vec<u8> {
    let udp_len = UDP_HDR_SIZE + payload_len;
    let mut frame = vec![0u8; ETHERNET_HDR_SIZE + IP_HDR_SIZE + udp_len];
    let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();

    let eth_repr = EthernetRepr {
        src_addr: src,
        dst_addr: dst,
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth);

    let ip_repr = Ipv4Repr {
        src_addr: SRC_IP,
        dst_addr: DST_IP,
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip_repr.emit(&mut ip, &ChecksumCapabilities::default());

    let udp_repr = UdpRepr {
        src_port: 4000,
        dst_port: 4001,
    };
    let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
    udp_repr.emit(
        &mut udp,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        payload_len,
        |buf| buf.copy_from_slice(&payload),
        &ChecksumCapabilities::default(),
    );
    frame
}

/// TCPv4 segment larger than one wire frame, prefixed with a 10-byte
/// virtio-net header requesting segmentation at `gso_size`. PSH is set.
pub fn tcp_gso_frame(
    dst: EthernetAddress,
    src: EthernetAddress,
    gso_size: u16,
    seq: i32,
    payload: &[u8],
) -> Vec<u8> {
    let headers = ETHERNET_HDR_SIZE + IP_HDR_SIZE + TCP_HDR_SIZE;
    let hdr = VirtioNetHdr {
        flags: VIRTIO_NET_HDR_F_NEEDS_CSUM,
        gso_type: VIRTIO_NET_HDR_GSO_TCPV4,
        hdr_len: headers as u16,
        gso_size,
        csum_start: (ETHERNET_HDR_SIZE + IP_HDR_SIZE) as u16,
        csum_offset: 16,
        num_buffers: 0,
    };
    let mut frame = Vec::with_capacity(VIRTIO_NET_HDR_LEN + headers + payload.len());
    hdr.emit(VIRTIO_NET_HDR_LEN, &mut frame);
    frame.resize(VIRTIO_NET_HDR_LEN + headers + payload.len(), 0);

    let eth_repr = EthernetRepr {
        src_addr: src,
        dst_addr: dst,
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth = EthernetFrame::new_unchecked(&mut frame[VIRTIO_NET_HDR_LEN..]);
    eth_repr.emit(&mut eth);

    let ip_repr = Ipv4Repr {
        src_addr: SRC_IP,
        dst_addr: DST_IP,
        next_header: IpProtocol::Tcp,
        payload_len: TCP_HDR_SIZE + payload.len(),
        hop_limit: 64,
    };
    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip_repr.emit(&mut ip, &ChecksumCapabilities::default());

    let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
    tcp.set_src_port(40000);
    tcp.set_dst_port(5201);
    tcp.set_seq_number(TcpSeqNumber(seq));
    tcp.set_ack_number(TcpSeqNumber(1));
    tcp.set_header_len(TCP_HDR_SIZE as u8);
    tcp.clear_flags();
    tcp.set_ack(true);
    tcp.set_psh(true);
    tcp.set_window_len(65535);
    tcp.set_urgent_at(0);
    tcp.payload_mut().copy_from_slice(payload);
    tcp.fill_checksum(&IpAddress::Ipv4(SRC_IP), &IpAddress::Ipv4(DST_IP));
    frame
}
