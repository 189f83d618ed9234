//! Flow keys identifying NAT-ed connections across both domains.
//!
//! The guest-side flow and the host-side session never hold references to
//! each other; each side looks the other up by the 5-tuple key. The key
//! also has a canonical UTF-8 form used inside ring records.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowProto {
    Tcp,
    Udp,
}

impl FlowProto {
    fn as_str(&self) -> &'static str {
        match self {
            FlowProto::Tcp => "tcp",
            FlowProto::Udp => "udp",
        }
    }
}

/// 5-tuple identifying a flow, from the guest's perspective.
///
/// `src` is always the guest endpoint, `dst` the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub proto: FlowProto,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn tcp(src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> Self {
        Self { proto: FlowProto::Tcp, src_ip, src_port, dst_ip, dst_port }
    }

    pub fn udp(src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16) -> Self {
        Self { proto: FlowProto::Udp, src_ip, src_port, dst_ip, dst_port }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.proto.as_str(),
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port
        )
    }
}

/// Error parsing the canonical key form.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid flow key: {0}")]
pub struct KeyParseError(String);

impl FromStr for FlowKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || KeyParseError(s.to_string());

        let mut parts = s.split(':');
        let proto = match parts.next() {
            Some("tcp") => FlowProto::Tcp,
            Some("udp") => FlowProto::Udp,
            _ => return Err(bad()),
        };
        let src_ip: Ipv4Addr = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let src_port: u16 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let dst_ip: Ipv4Addr = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let dst_port: u16 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        if parts.next().is_some() {
            return Err(bad());
        }

        Ok(FlowKey { proto, src_ip, src_port, dst_ip, dst_port })
    }
}
