//! Packet parsing and building using smoltcp, plus the virtual network
//! addressing plan.
//!
//! Network layout:
//! - Guest IP:  192.168.127.3/24
//! - Gateway:   192.168.127.1 (also the advertised DHCP/DNS server)
//! - Resolver:  8.8.8.8
//!
//! The gateway MAC is generated once per VM instance; the guest MAC is
//! always the configured one and never learned from traffic.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket,
    TcpRepr, TcpSeqNumber, UdpPacket, UdpRepr,
};

/// Guest address handed out by the DHCP server.
pub const GUEST_IP: Ipv4Address = Ipv4Address([192, 168, 127, 3]);

/// Virtual gateway; also the DHCP server identifier and the loopback alias
/// for host-resident services.
pub const GATEWAY_IP: Ipv4Address = Ipv4Address([192, 168, 127, 1]);

/// Recursive resolver advertised to the guest.
pub const DNS_IP: Ipv4Address = Ipv4Address([8, 8, 8, 8]);

/// Prefix length of the virtual subnet.
pub const PREFIX_LEN: u8 = 24;

/// DHCP lease time in seconds.
pub const LEASE_SECS: u32 = 86400;

/// Maximum TCP payload per segment toward the guest.
pub const MSS: usize = 1460;

/// Fixed receive window advertised to the guest.
pub const TCP_WINDOW: u16 = 65535;

/// Default guest MAC when the caller does not configure one.
pub const DEFAULT_GUEST_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// Per-instance MAC addressing.
#[derive(Debug, Clone, Copy)]
pub struct MacPlan {
    pub guest: EthernetAddress,
    pub gateway: EthernetAddress,
}

impl MacPlan {
    /// Build the plan from the configured guest MAC, drawing a fresh
    /// locally-administered gateway MAC.
    pub fn new(guest_mac: [u8; 6]) -> Self {
        Self {
            guest: EthernetAddress(guest_mac),
            gateway: random_gateway_mac(),
        }
    }
}

/// Generate a locally-administered, unicast gateway MAC.
fn random_gateway_mac() -> EthernetAddress {
    let tail: u32 = rand::random();
    let bytes = tail.to_be_bytes();
    EthernetAddress([0x02, 0x00, bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn to_std(ip: Ipv4Address) -> std::net::Ipv4Addr {
    std::net::Ipv4Addr::from(ip.0)
}

pub fn from_std(ip: std::net::Ipv4Addr) -> Ipv4Address {
    Ipv4Address(ip.octets())
}

/// Parse an Ethernet frame.
pub fn parse_ethernet(data: &[u8]) -> Option<EthernetFrame<&[u8]>> {
    EthernetFrame::new_checked(data).ok()
}

/// Build an Ethernet frame with the given payload.
pub fn build_ethernet_frame(
    dst_mac: EthernetAddress,
    src_mac: EthernetAddress,
    ethertype: EthernetProtocol,
    payload: &[u8],
) -> Vec<u8> {
    let repr = EthernetRepr { src_addr: src_mac, dst_addr: dst_mac, ethertype };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buffer
}

/// Build a complete ARP reply frame from the gateway.
pub fn build_arp_reply_frame(
    gateway_mac: EthernetAddress,
    requester_mac: EthernetAddress,
    requested_ip: Ipv4Address,
    requester_ip: Ipv4Address,
) -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: gateway_mac,
        source_protocol_addr: requested_ip,
        target_hardware_addr: requester_mac,
        target_protocol_addr: requester_ip,
    };

    let mut payload = vec![0u8; arp_repr.buffer_len()];
    let mut packet = ArpPacket::new_unchecked(&mut payload);
    arp_repr.emit(&mut packet);

    build_ethernet_frame(requester_mac, gateway_mac, EthernetProtocol::Arp, &payload)
}

/// Build an Ethernet/IPv4/UDP frame for the guest.
pub fn build_udp_frame(
    macs: &MacPlan,
    src_ip: Ipv4Address,
    src_port: u16,
    dst_ip: Ipv4Address,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let checksums = ChecksumCapabilities::default();

    let udp_repr = UdpRepr { src_port, dst_port };
    let ip_repr = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Udp,
        payload_len: udp_repr.header_len() + payload.len(),
        hop_limit: 64,
    };
    let eth_repr = EthernetRepr {
        src_addr: macs.gateway,
        dst_addr: macs.guest,
        ethertype: EthernetProtocol::Ipv4,
    };

    let total = eth_repr.buffer_len() + ip_repr.buffer_len() + ip_repr.payload_len;
    let mut buffer = vec![0u8; total];

    let mut eth_frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut eth_frame);
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &checksums);
    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &IpAddress::Ipv4(src_ip),
        &IpAddress::Ipv4(dst_ip),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &checksums,
    );

    buffer
}

/// Build an Ethernet/IPv4/TCP segment for the guest.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_frame(
    macs: &MacPlan,
    src_ip: Ipv4Address,
    src_port: u16,
    dst_ip: Ipv4Address,
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
        window_len: TCP_WINDOW,
        window_scale: None,
        max_seg_size: if control == TcpControl::Syn { Some(MSS as u16) } else { None },
        sack_permitted: false,
        sack_ranges: [None; 3],
        payload,
    };
    let ip_repr = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Tcp,
        payload_len: tcp_repr.header_len() + payload.len(),
        hop_limit: 64,
    };
    let eth_repr = EthernetRepr {
        src_addr: macs.gateway,
        dst_addr: macs.guest,
        ethertype: EthernetProtocol::Ipv4,
    };

    let total = eth_repr.buffer_len() + ip_repr.buffer_len() + ip_repr.payload_len;
    let mut buffer = vec![0u8; total];

    let mut eth_frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut eth_frame);
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &checksums);
    let mut tcp_packet = TcpPacket::new_unchecked(ip_packet.payload_mut());
    tcp_repr.emit(
        &mut tcp_packet,
        &IpAddress::Ipv4(src_ip),
        &IpAddress::Ipv4(dst_ip),
        &checksums,
    );

    buffer
}
