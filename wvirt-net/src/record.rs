//! Typed records carried by the shared-memory ring.
//!
//! The host reactor is the only producer; the guest worker is the only
//! consumer. Each record is `u16 LE payload-length | u8 type | payload`;
//! this module defines the payload shapes and their codec.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::key::FlowKey;

/// Record type tags on the wire.
pub const TCP_CONNECTED: u8 = 1;
pub const TCP_DATA: u8 = 2;
pub const TCP_END: u8 = 3;
pub const TCP_ERROR: u8 = 4;
pub const TCP_CLOSE: u8 = 5;
pub const UDP_RECV: u8 = 6;

/// Host-to-guest network event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// The outbound connect for `key` completed.
    TcpConnected { key: FlowKey },
    /// Payload bytes received from the remote side of `key`.
    TcpData { key: FlowKey, data: Vec<u8> },
    /// The remote side sent FIN; always ordered after all of its data.
    TcpEnd { key: FlowKey },
    /// The OS socket failed; the flow must be reset.
    TcpError { key: FlowKey, message: String },
    /// The OS socket is fully closed.
    TcpClose { key: FlowKey },
    /// A UDP datagram arrived for the guest.
    UdpRecv {
        src_ip: Ipv4Addr,
        src_port: u16,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        data: Vec<u8>,
    },
}

/// Error decoding a ring record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("unknown record type {0}")]
    UnknownType(u8),
    #[error("truncated record payload")]
    Truncated,
    #[error("record field is not valid UTF-8")]
    BadUtf8,
    #[error("record carries an unparseable key or address")]
    BadField,
}

impl NetEvent {
    /// Wire type tag for this event.
    pub fn kind(&self) -> u8 {
        match self {
            NetEvent::TcpConnected { .. } => TCP_CONNECTED,
            NetEvent::TcpData { .. } => TCP_DATA,
            NetEvent::TcpEnd { .. } => TCP_END,
            NetEvent::TcpError { .. } => TCP_ERROR,
            NetEvent::TcpClose { .. } => TCP_CLOSE,
            NetEvent::UdpRecv { .. } => UDP_RECV,
        }
    }

    /// Append the payload bytes (everything after the type tag) to `out`.
    pub fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            NetEvent::TcpConnected { key } | NetEvent::TcpEnd { key } | NetEvent::TcpClose { key } => {
                out.extend_from_slice(key.to_string().as_bytes());
            }
            NetEvent::TcpData { key, data } => {
                let key = key.to_string();
                out.push(key.len() as u8);
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(data);
            }
            NetEvent::TcpError { key, message } => {
                let key = key.to_string();
                out.push(key.len() as u8);
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(message.as_bytes());
            }
            NetEvent::UdpRecv { src_ip, src_port, dst_ip, dst_port, data } => {
                let src = src_ip.to_string();
                out.push(src.len() as u8);
                out.extend_from_slice(src.as_bytes());
                out.extend_from_slice(&src_port.to_le_bytes());
                let dst = dst_ip.to_string();
                out.push(dst.len() as u8);
                out.extend_from_slice(dst.as_bytes());
                out.extend_from_slice(&dst_port.to_le_bytes());
                out.extend_from_slice(data);
            }
        }
    }

    /// Decode a record from its type tag and payload.
    pub fn decode(kind: u8, payload: &[u8]) -> Result<NetEvent, RecordError> {
        match kind {
            TCP_CONNECTED => Ok(NetEvent::TcpConnected { key: parse_key(payload)? }),
            TCP_END => Ok(NetEvent::TcpEnd { key: parse_key(payload)? }),
            TCP_CLOSE => Ok(NetEvent::TcpClose { key: parse_key(payload)? }),
            TCP_DATA => {
                let (key, rest) = take_prefixed_key(payload)?;
                Ok(NetEvent::TcpData { key, data: rest.to_vec() })
            }
            TCP_ERROR => {
                let (key, rest) = take_prefixed_key(payload)?;
                let message =
                    std::str::from_utf8(rest).map_err(|_| RecordError::BadUtf8)?.to_string();
                Ok(NetEvent::TcpError { key, message })
            }
            UDP_RECV => {
                let (src_ip, rest) = take_prefixed_addr(payload)?;
                let (src_port, rest) = take_port(rest)?;
                let (dst_ip, rest) = take_prefixed_addr(rest)?;
                let (dst_port, rest) = take_port(rest)?;
                Ok(NetEvent::UdpRecv {
                    src_ip,
                    src_port,
                    dst_ip,
                    dst_port,
                    data: rest.to_vec(),
                })
            }
            other => Err(RecordError::UnknownType(other)),
        }
    }
}

fn parse_key(payload: &[u8]) -> Result<FlowKey, RecordError> {
    std::str::from_utf8(payload)
        .map_err(|_| RecordError::BadUtf8)?
        .parse()
        .map_err(|_| RecordError::BadField)
}

fn take_prefixed_key(payload: &[u8]) -> Result<(FlowKey, &[u8]), RecordError> {
    let (&len, rest) = payload.split_first().ok_or(RecordError::Truncated)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(RecordError::Truncated);
    }
    Ok((parse_key(&rest[..len])?, &rest[len..]))
}

fn take_prefixed_addr(payload: &[u8]) -> Result<(Ipv4Addr, &[u8]), RecordError> {
    let (&len, rest) = payload.split_first().ok_or(RecordError::Truncated)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(RecordError::Truncated);
    }
    let addr = std::str::from_utf8(&rest[..len])
        .map_err(|_| RecordError::BadUtf8)?
        .parse()
        .map_err(|_| RecordError::BadField)?;
    Ok((addr, &rest[len..]))
}

fn take_port(payload: &[u8]) -> Result<(u16, &[u8]), RecordError> {
    if payload.len() < 2 {
        return Err(RecordError::Truncated);
    }
    Ok((u16::from_le_bytes([payload[0], payload[1]]), &payload[2..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(ev: NetEvent) {
        let mut payload = Vec::new();
        ev.encode_payload(&mut payload);
        let decoded = NetEvent::decode(ev.kind(), &payload).unwrap();
        assert_eq!(decoded, ev);
    }

    fn test_key() -> FlowKey {
        FlowKey::tcp(
            Ipv4Addr::new(192, 168, 127, 3),
            40000,
            Ipv4Addr::new(1, 2, 3, 4),
            443,
        )
    }

    #[test]
    fn test_tcp_events_roundtrip() {
        roundtrip(NetEvent::TcpConnected { key: test_key() });
        roundtrip(NetEvent::TcpEnd { key: test_key() });
        roundtrip(NetEvent::TcpClose { key: test_key() });
        roundtrip(NetEvent::TcpData { key: test_key(), data: b"hello world".to_vec() });
        roundtrip(NetEvent::TcpError {
            key: test_key(),
            message: "connection refused".to_string(),
        });
    }

    #[test]
    fn test_tcp_data_empty_payload() {
        // Zero-byte data records are legal; they become pure ACKs downstream.
        roundtrip(NetEvent::TcpData { key: test_key(), data: Vec::new() });
    }

    #[test]
    fn test_udp_recv_roundtrip() {
        roundtrip(NetEvent::UdpRecv {
            src_ip: Ipv4Addr::new(8, 8, 8, 8),
            src_port: 53,
            dst_ip: Ipv4Addr::new(192, 168, 127, 3),
            dst_port: 5353,
            data: vec![0xab; 128],
        });
    }

    #[test]
    fn test_decode_unknown_type() {
        assert_eq!(NetEvent::decode(99, b""), Err(RecordError::UnknownType(99)));
    }

    #[test]
    fn test_decode_truncated() {
        // key_len claims more bytes than are present
        assert_eq!(NetEvent::decode(TCP_DATA, &[200, b'a']), Err(RecordError::Truncated));
        assert_eq!(NetEvent::decode(UDP_RECV, &[]), Err(RecordError::Truncated));
    }
}
