//! Builders and parsers for driving the stack the way the guest's kernel
//! would. Used by the integration tests.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetFrame, EthernetProtocol, EthernetRepr, IpAddress, IpProtocol, Ipv4Address, Ipv4Packet,
    Ipv4Repr, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber, UdpPacket, UdpRepr,
};

use crate::packet::{GUEST_IP, MacPlan};
use crate::stack::NetStack;

/// Decoded view of a TCP segment the stack produced for the guest.
#[derive(Debug, Clone)]
pub struct TcpMeta {
    pub src_ip: Ipv4Address,
    pub dst_ip: Ipv4Address,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: Option<u32>,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub payload: Vec<u8>,
}

/// Prepend the NIC stream's 4-byte big-endian length prefix.
pub fn frame_with_prefix(frame: &[u8]) -> Vec<u8> {
    let mut out = (frame.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(frame);
    out
}

/// Split a NIC byte stream back into frames. Panics on a torn stream.
pub fn split_frames(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut off = 0;
    while off + 4 <= bytes.len() {
        let len = u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
            as usize;
        assert!(off + 4 + len <= bytes.len(), "torn frame in NIC stream");
        frames.push(bytes[off + 4..off + 4 + len].to_vec());
        off += 4 + len;
    }
    assert_eq!(off, bytes.len(), "trailing garbage in NIC stream");
    frames
}

/// Pull everything currently queued for the guest and split it.
pub fn drain_stack_frames(stack: &mut NetStack) -> Vec<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stack.pull_guest_bytes(&mut buf);
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&buf[..n]);
    }
    split_frames(&bytes)
}

/// Build a guest-originated TCP segment (guest IP toward `dst_ip`).
#[allow(clippy::too_many_arguments)]
pub fn guest_tcp_frame(
    macs: &MacPlan,
    dst_ip: Ipv4Address,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: Option<u32>,
    control: TcpControl,
    payload: &[u8],
) -> Vec<u8> {
    let checksums = ChecksumCapabilities::default();
    let tcp_repr = TcpRepr {
        src_port,
        dst_port,
        control,
        seq_number: TcpSeqNumber(seq as i32),
        ack_number: ack.map(|a| TcpSeqNumber(a as i32)),
        window_len: 65535,
        window_scale: None,
        max_seg_size: None,
        sack_permitted: false,
        sack_ranges: [None; 3],
        payload,
    };
    let ip_repr = Ipv4Repr {
        src_addr: GUEST_IP,
        dst_addr: dst_ip,
        next_header: IpProtocol::Tcp,
        payload_len: tcp_repr.header_len() + payload.len(),
        hop_limit: 64,
    };
    let eth_repr = EthernetRepr {
        src_addr: macs.guest,
        dst_addr: macs.gateway,
        ethertype: EthernetProtocol::Ipv4,
    };

    let total = eth_repr.buffer_len() + ip_repr.buffer_len() + ip_repr.payload_len;
    let mut buffer = vec![0u8; total];
    let mut eth = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut eth);
    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip_repr.emit(&mut ip, &checksums);
    let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
    tcp_repr.emit(&mut tcp, &IpAddress::Ipv4(GUEST_IP), &IpAddress::Ipv4(dst_ip), &checksums);
    buffer
}

/// Build a guest-originated UDP datagram.
pub fn guest_udp_frame(
    macs: &MacPlan,
    dst_ip: Ipv4Address,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let checksums = ChecksumCapabilities::default();
    let udp_repr = UdpRepr { src_port, dst_port };
    let ip_repr = Ipv4Repr {
        src_addr: GUEST_IP,
        dst_addr: dst_ip,
        next_header: IpProtocol::Udp,
        payload_len: udp_repr.header_len() + payload.len(),
        hop_limit: 64,
    };
    let eth_repr = EthernetRepr {
        src_addr: macs.guest,
        dst_addr: macs.gateway,
        ethertype: EthernetProtocol::Ipv4,
    };

    let total = eth_repr.buffer_len() + ip_repr.buffer_len() + ip_repr.payload_len;
    let mut buffer = vec![0u8; total];
    let mut eth = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut eth);
    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip_repr.emit(&mut ip, &checksums);
    let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
    udp_repr.emit(
        &mut udp,
        &IpAddress::Ipv4(GUEST_IP),
        &IpAddress::Ipv4(dst_ip),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &checksums,
    );
    buffer
}

/// Parse a stack-produced frame as a TCP segment.
pub fn parse_tcp_frame(frame: &[u8]) -> Option<TcpMeta> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ip.next_header() != IpProtocol::Tcp {
        return None;
    }
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    Some(TcpMeta {
        src_ip: ip.src_addr(),
        dst_ip: ip.dst_addr(),
        src_port: tcp.src_port(),
        dst_port: tcp.dst_port(),
        seq: tcp.seq_number().0 as u32,
        ack: if tcp.ack() { Some(tcp.ack_number().0 as u32) } else { None },
        syn: tcp.syn(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        psh: tcp.psh(),
        payload: tcp.payload().to_vec(),
    })
}

/// Parse a stack-produced frame as a UDP datagram, returning
/// `(src_ip, src_port, dst_ip, dst_port, payload)`.
pub fn parse_udp_frame(frame: &[u8]) -> Option<(Ipv4Address, u16, Ipv4Address, u16, Vec<u8>)> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ip.next_header() != IpProtocol::Udp {
        return None;
    }
    let udp = UdpPacket::new_checked(ip.payload()).ok()?;
    Some((ip.src_addr(), udp.src_port(), ip.dst_addr(), udp.dst_port(), udp.payload().to_vec()))
}
