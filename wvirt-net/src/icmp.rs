//! ICMP echo responder.
//!
//! Every well-formed echo request from the guest is answered locally with
//! an echo reply carrying the same identifier, sequence number and
//! payload. The NAT does not forward ICMP; from the guest's point of view
//! the whole Internet answers pings.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetFrame, EthernetProtocol, EthernetRepr, Icmpv4Packet, Icmpv4Repr, IpProtocol,
    Ipv4Address, Ipv4Packet, Ipv4Repr,
};
use tracing::debug;

use crate::packet::{MacPlan, parse_ethernet};

/// ICMP echo responder.
pub struct IcmpResponder {
    macs: MacPlan,
}

impl IcmpResponder {
    pub fn new(macs: MacPlan) -> Self {
        Self { macs }
    }

    /// Process an incoming frame and potentially generate an echo reply.
    pub fn process(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let eth = parse_ethernet(frame)?;
        if eth.ethertype() != EthernetProtocol::Ipv4 {
            return None;
        }

        let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
        if ip.next_header() != IpProtocol::Icmp {
            return None;
        }

        let icmp = Icmpv4Packet::new_checked(ip.payload()).ok()?;
        let repr = Icmpv4Repr::parse(&icmp, &ChecksumCapabilities::default()).ok()?;

        if let Icmpv4Repr::EchoRequest { ident, seq_no, data } = repr {
            debug!(
                src_ip = %ip.src_addr(),
                dst_ip = %ip.dst_addr(),
                ident,
                seq_no,
                "ICMP echo request, sending reply"
            );
            return Some(self.build_echo_reply(ip.dst_addr(), ip.src_addr(), ident, seq_no, data));
        }

        None
    }

    /// Build the reply frame; the reply's source is whatever address the
    /// guest pinged.
    fn build_echo_reply(
        &self,
        src_ip: Ipv4Address,
        dst_ip: Ipv4Address,
        ident: u16,
        seq_no: u16,
        data: &[u8],
    ) -> Vec<u8> {
        let checksums = ChecksumCapabilities::default();

        let icmp_repr = Icmpv4Repr::EchoReply { ident, seq_no, data };
        let ip_repr = Ipv4Repr {
            src_addr: src_ip,
            dst_addr: dst_ip,
            next_header: IpProtocol::Icmp,
            payload_len: icmp_repr.buffer_len(),
            hop_limit: 64,
        };
        let eth_repr = EthernetRepr {
            src_addr: self.macs.gateway,
            dst_addr: self.macs.guest,
            ethertype: EthernetProtocol::Ipv4,
        };

        let total = eth_repr.buffer_len() + ip_repr.buffer_len() + ip_repr.payload_len;
        let mut buffer = vec![0u8; total];

        let mut eth_frame = EthernetFrame::new_unchecked(&mut buffer);
        eth_repr.emit(&mut eth_frame);
        let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
        ip_repr.emit(&mut ip_packet, &checksums);
        let mut icmp_packet = Icmpv4Packet::new_unchecked(ip_packet.payload_mut());
        icmp_repr.emit(&mut icmp_packet, &checksums);

        buffer
    }
}
