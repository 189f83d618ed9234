//! Authoritative DHCPv4 server for the guest.
//!
//! There is exactly one client and one lease: DISCOVER is answered with an
//! OFFER and REQUEST with an ACK, both carrying the fixed guest address,
//! gateway, DNS and lease time. Replies are unicast to the client MAC
//! unless the client set the broadcast flag.

use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use ipnet::Ipv4Net;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};
use tracing::debug;

use crate::packet::{GATEWAY_IP, GUEST_IP, LEASE_SECS, MacPlan, PREFIX_LEN, parse_ethernet, to_std};

/// DHCP server port.
const DHCP_SERVER_PORT: u16 = 67;

/// DHCP client port.
const DHCP_CLIENT_PORT: u16 = 68;

/// BOOTP-compatible minimum payload size; replies are padded up to this.
const MIN_DHCP_PAYLOAD: usize = 300;

/// DHCPv4 server answering the guest's lease traffic.
pub struct DhcpServer {
    macs: MacPlan,
}

impl DhcpServer {
    pub fn new(macs: MacPlan) -> Self {
        Self { macs }
    }

    /// Process an incoming frame and potentially generate a DHCP reply.
    ///
    /// Returns `Some(frame)` when the frame was a DISCOVER or REQUEST we
    /// answer; `None` for anything else (including other DHCP types).
    pub fn process(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let eth = parse_ethernet(frame)?;
        if eth.ethertype() != EthernetProtocol::Ipv4 {
            return None;
        }
        let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
        if ip.next_header() != IpProtocol::Udp {
            return None;
        }
        let udp = UdpPacket::new_checked(ip.payload()).ok()?;
        if udp.dst_port() != DHCP_SERVER_PORT || udp.src_port() != DHCP_CLIENT_PORT {
            return None;
        }

        // Decoding validates the 0x63825363 magic cookie.
        let mut decoder = Decoder::new(udp.payload());
        let request = Message::decode(&mut decoder).ok()?;
        if request.opcode() != Opcode::BootRequest {
            return None;
        }

        let msg_type = message_type(&request)?;
        debug!(
            msg_type = ?msg_type,
            xid = request.xid(),
            client_mac = ?request.chaddr(),
            "DHCP message received"
        );

        let reply_type = match msg_type {
            MessageType::Discover => MessageType::Offer,
            MessageType::Request => {
                // A client requesting an address other than its lease is
                // refused; it will restart from DISCOVER.
                if let Some(requested) = requested_ip(&request)
                    && requested != to_std(GUEST_IP)
                {
                    debug!(
                        requested = %requested,
                        leased = %to_std(GUEST_IP),
                        "client requested wrong address, sending NAK"
                    );
                    return self.build_nak(&request);
                }
                MessageType::Ack
            }
            other => {
                debug!(msg_type = ?other, "ignoring DHCP message type");
                return None;
            }
        };

        self.build_reply(&request, reply_type)
    }

    /// NAKs are always broadcast; the client has no usable address.
    fn build_nak(&self, request: &Message) -> Option<Vec<u8>> {
        let gateway_ip = to_std(GATEWAY_IP);

        let mut reply = Message::default();
        reply.set_opcode(Opcode::BootReply);
        reply.set_htype(request.htype());
        reply.set_xid(request.xid());
        reply.set_chaddr(request.chaddr());

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(MessageType::Nak));
        opts.insert(DhcpOption::ServerIdentifier(gateway_ip));

        let mut payload = Vec::new();
        let mut encoder = Encoder::new(&mut payload);
        reply.encode(&mut encoder).ok()?;
        if payload.len() < MIN_DHCP_PAYLOAD {
            payload.resize(MIN_DHCP_PAYLOAD, 0);
        }

        Some(self.build_envelope(EthernetAddress::BROADCAST, Ipv4Address::BROADCAST, &payload))
    }

    fn build_reply(&self, request: &Message, reply_type: MessageType) -> Option<Vec<u8>> {
        let guest_ip = to_std(GUEST_IP);
        let gateway_ip = to_std(GATEWAY_IP);
        let subnet = Ipv4Net::new(gateway_ip, PREFIX_LEN).unwrap();

        let mut reply = Message::default();
        reply.set_opcode(Opcode::BootReply);
        reply.set_htype(request.htype());
        reply.set_xid(request.xid());
        reply.set_flags(request.flags());
        reply.set_yiaddr(guest_ip);
        reply.set_siaddr(gateway_ip);
        reply.set_chaddr(request.chaddr());

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(reply_type));
        opts.insert(DhcpOption::ServerIdentifier(gateway_ip));
        opts.insert(DhcpOption::AddressLeaseTime(LEASE_SECS));
        opts.insert(DhcpOption::SubnetMask(subnet.netmask()));
        opts.insert(DhcpOption::Router(vec![gateway_ip]));
        opts.insert(DhcpOption::DomainNameServer(vec![to_std(crate::packet::DNS_IP)]));
        opts.insert(DhcpOption::BroadcastAddr(subnet.broadcast()));

        let mut payload = Vec::new();
        let mut encoder = Encoder::new(&mut payload);
        reply.encode(&mut encoder).ok()?;
        if payload.len() < MIN_DHCP_PAYLOAD {
            payload.resize(MIN_DHCP_PAYLOAD, 0);
        }

        let broadcast = request.flags().broadcast();
        let (dst_mac, dst_ip) = if broadcast {
            (EthernetAddress::BROADCAST, Ipv4Address::BROADCAST)
        } else {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(request.chaddr().get(..6)?);
            (EthernetAddress(mac), GUEST_IP)
        };

        debug!(
            reply_type = ?reply_type,
            xid = request.xid(),
            broadcast,
            yiaddr = %guest_ip,
            "DHCP reply built"
        );

        Some(self.build_envelope(dst_mac, dst_ip, &payload))
    }

    fn build_envelope(
        &self,
        dst_mac: EthernetAddress,
        dst_ip: Ipv4Address,
        payload: &[u8],
    ) -> Vec<u8> {
        let checksums = smoltcp::phy::ChecksumCapabilities::default();

        let udp_repr = UdpRepr { src_port: DHCP_SERVER_PORT, dst_port: DHCP_CLIENT_PORT };
        let ip_repr = Ipv4Repr {
            src_addr: GATEWAY_IP,
            dst_addr: dst_ip,
            next_header: IpProtocol::Udp,
            payload_len: udp_repr.header_len() + payload.len(),
            hop_limit: 64,
        };
        let eth_repr = EthernetRepr {
            src_addr: self.macs.gateway,
            dst_addr: dst_mac,
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
            &GATEWAY_IP.into(),
            &dst_ip.into(),
            payload.len(),
            |buf| buf.copy_from_slice(payload),
            &checksums,
        );

        buffer
    }
}

fn message_type(msg: &Message) -> Option<MessageType> {
    msg.opts().get(OptionCode::MessageType).and_then(|opt| {
        if let DhcpOption::MessageType(mt) = opt { Some(*mt) } else { None }
    })
}

fn requested_ip(msg: &Message) -> Option<std::net::Ipv4Addr> {
    msg.opts().get(OptionCode::RequestedIpAddress).and_then(|opt| {
        if let DhcpOption::RequestedIpAddress(ip) = opt { Some(*ip) } else { None }
    })
}
