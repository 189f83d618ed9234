//! ARP responder for the virtual gateway.
//!
//! Responds to ARP requests whose target protocol address is the gateway
//! IP with the per-instance gateway MAC. Requests for any other address
//! are ignored.

use smoltcp::wire::{ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetProtocol};
use tracing::debug;

use crate::packet::{GATEWAY_IP, build_arp_reply_frame, parse_ethernet};

/// ARP responder for the gateway address.
pub struct ArpResponder {
    gateway_mac: EthernetAddress,
}

impl ArpResponder {
    pub fn new(gateway_mac: EthernetAddress) -> Self {
        Self { gateway_mac }
    }

    /// Process an incoming frame and potentially generate an ARP reply.
    ///
    /// Returns `Some(frame)` if an ARP reply should be sent, `None` otherwise.
    pub fn process(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let eth = parse_ethernet(frame)?;
        if eth.ethertype() != EthernetProtocol::Arp {
            return None;
        }

        let packet = ArpPacket::new_checked(eth.payload()).ok()?;
        let repr = ArpRepr::parse(&packet).ok()?;

        if let ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        } = repr
        {
            if target_protocol_addr != GATEWAY_IP {
                return None;
            }

            debug!(
                requester_mac = %source_hardware_addr,
                requester_ip = %source_protocol_addr,
                "ARP request for gateway, sending reply"
            );

            return Some(build_arp_reply_frame(
                self.gateway_mac,
                source_hardware_addr,
                target_protocol_addr,
                source_protocol_addr,
            ));
        }

        None
    }
}
