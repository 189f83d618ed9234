//! User-space network plane for a sandboxed guest VM.
//!
//! The guest's virtual NIC is a byte stream of length-prefixed Ethernet
//! frames. This crate terminates that NIC entirely in user space:
//! - ARP, ICMP echo and DHCP are answered locally by the stack
//! - TCP and UDP are NAT-ed onto real OS sockets owned by a host reactor
//!
//! Architecture:
//! - The guest worker owns a [`stack::NetStack`] and the consumer side of
//!   the shared-memory transport ([`shmem`])
//! - The host reactor ([`reactor::HostReactor`]) owns every OS socket and
//!   the producer side of the transport
//! - Guest-to-host requests travel over the control channel ([`control`]);
//!   host-to-guest events travel exclusively through the shared ring

pub mod arp;
pub mod control;
pub mod dhcp;
pub mod icmp;
pub mod key;
pub mod packet;
pub mod reactor;
pub mod record;
pub mod shmem;
pub mod stack;
pub mod tcp;
pub mod test_util;

pub use control::{ControlMsg, Inbox, Outbox};
pub use key::{FlowKey, FlowProto};
pub use reactor::{HostReactor, ReactorConfig, ReactorHandle};
pub use record::NetEvent;
pub use shmem::{GuestTransport, RingProducer, StdinWriter, TransportError, shared_region};
pub use stack::{NetConfig, NetStack};
