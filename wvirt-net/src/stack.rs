//! Guest-side network stack terminating the virtual NIC.
//!
//! Inbound (guest writes to its NIC fd): length-prefixed Ethernet frames
//! are deframed, demultiplexed, and either answered locally (ARP, ICMP,
//! DHCP) or NAT-ed through the control channel. Outbound (guest reads from
//! its NIC fd): frames synthesized here are queued as the same
//! length-prefixed byte stream.
//!
//! The TX queue is unbounded; crossing the high watermark emits
//! `tcp-pause` for the flow that grew it and draining below the low
//! watermark emits `tcp-resume`.

use std::collections::{HashMap, HashSet, VecDeque};

use smoltcp::wire::{EthernetProtocol, IpProtocol, Ipv4Packet, TcpPacket, UdpPacket};
use tracing::{debug, trace, warn};

use crate::arp::ArpResponder;
use crate::control::{ControlMsg, Outbox};
use crate::dhcp::DhcpServer;
use crate::icmp::IcmpResponder;
use crate::key::FlowKey;
use crate::packet::{DEFAULT_GUEST_MAC, MacPlan, build_udp_frame, from_std, parse_ethernet, to_std};
use crate::record::NetEvent;
use crate::tcp::{FlowState, TcpFlow, rst_for_unknown};

/// Pause flows once the guest TX queue grows past this.
const TX_PAUSE_HIGH: usize = 256 * 1024;

/// Resume paused flows once the queue drains below this.
const TX_RESUME_LOW: usize = 64 * 1024;

/// Upper bound on a declared guest frame; larger prefixes mean the stream
/// is corrupt.
const MAX_FRAME_LEN: usize = 64 * 1024;

/// DHCP ports, used to split lease traffic from NAT-ed UDP.
const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// Stack construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    /// The guest's MAC address. Never learned from traffic.
    pub guest_mac: [u8; 6],
}

impl Default for NetConfig {
    fn default() -> Self {
        Self { guest_mac: DEFAULT_GUEST_MAC }
    }
}

/// The guest-side stack: deframer, responders, flow table, TX queue.
pub struct NetStack {
    macs: MacPlan,
    outbox: Outbox,
    arp: ArpResponder,
    icmp: IcmpResponder,
    dhcp: DhcpServer,
    /// Deframer accumulator for bytes written by the guest.
    rx_buf: Vec<u8>,
    /// Length-prefixed frames queued for the guest to read.
    tx: VecDeque<u8>,
    flows: HashMap<FlowKey, TcpFlow>,
    /// Flows we have paused for TX-queue pressure.
    paused: HashSet<FlowKey>,
    fin_observed: bool,
}

impl NetStack {
    pub fn new(config: NetConfig, outbox: Outbox) -> Self {
        let macs = MacPlan::new(config.guest_mac);
        Self {
            macs,
            outbox,
            arp: ArpResponder::new(macs.gateway),
            icmp: IcmpResponder::new(macs),
            dhcp: DhcpServer::new(macs),
            rx_buf: Vec::new(),
            tx: VecDeque::new(),
            flows: HashMap::new(),
            paused: HashSet::new(),
            fin_observed: false,
        }
    }

    pub fn macs(&self) -> &MacPlan {
        &self.macs
    }

    /// Bytes the guest wrote to its NIC fd: accumulate and process every
    /// complete length-prefixed frame.
    pub fn push_guest_bytes(&mut self, bytes: &[u8]) {
        self.rx_buf.extend_from_slice(bytes);
        loop {
            if self.rx_buf.len() < 4 {
                return;
            }
            let declared =
                u32::from_be_bytes([self.rx_buf[0], self.rx_buf[1], self.rx_buf[2], self.rx_buf[3]])
                    as usize;
            if declared == 0 || declared > MAX_FRAME_LEN {
                warn!(declared, "invalid frame length from guest, resetting deframer");
                self.rx_buf.clear();
                return;
            }
            if self.rx_buf.len() < 4 + declared {
                return;
            }
            let frame: Vec<u8> = self.rx_buf[4..4 + declared].to_vec();
            self.rx_buf.drain(..4 + declared);
            self.handle_frame(&frame);
        }
    }

    /// Copy queued guest-bound bytes out. Draining below the low watermark
    /// resumes every pressure-paused flow.
    pub fn pull_guest_bytes(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.tx.len());
        for (slot, byte) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *slot = byte;
        }
        if n > 0 && self.tx.len() < TX_RESUME_LOW && !self.paused.is_empty() {
            for key in self.paused.drain() {
                debug!(key = %key, "guest TX queue drained, resuming flow");
                self.outbox.send(ControlMsg::TcpResume { key });
            }
        }
        n
    }

    /// True when the guest has NIC bytes to read.
    pub fn pending_guest_bytes(&self) -> bool {
        !self.tx.is_empty()
    }

    /// True once any flow has seen its remote side end.
    pub fn fin_observed(&self) -> bool {
        self.fin_observed
    }

    /// Apply one host-to-guest event from the ring.
    pub fn handle_event(&mut self, event: NetEvent) {
        let macs = self.macs;
        match event {
            NetEvent::TcpConnected { key } => {
                let Some(flow) = self.flows.get_mut(&key) else {
                    trace!(key = %key, "connect event for unknown flow");
                    return;
                };
                if flow.state != FlowState::SynSent {
                    trace!(key = %key, state = ?flow.state, "connect event ignored");
                    return;
                }
                let syn_ack = flow.handle_connected(&macs);
                self.enqueue_frame(syn_ack, None);
            }
            NetEvent::TcpData { key, data } => {
                // Data may still arrive for a flow in FIN_WAIT; it is
                // delivered ahead of the final FIN.
                let Some(flow) = self.flows.get_mut(&key) else {
                    trace!(key = %key, len = data.len(), "data for unknown flow dropped");
                    return;
                };
                let frames = flow.data_segments(&macs, &data);
                for frame in frames {
                    self.enqueue_frame(frame, Some(key));
                }
            }
            NetEvent::TcpEnd { key } => {
                let Some(flow) = self.flows.get_mut(&key) else {
                    return;
                };
                // The TX queue is FIFO, so the FIN lands behind any data
                // already queued for the guest.
                let fin = flow.fin(&macs);
                self.fin_observed = true;
                let remove = match flow.state {
                    FlowState::FinSent => true,
                    _ => {
                        flow.state = FlowState::FinWait;
                        false
                    }
                };
                self.enqueue_frame(fin, None);
                if remove {
                    self.flows.remove(&key);
                }
            }
            NetEvent::TcpError { key, message } => {
                let Some(flow) = self.flows.remove(&key) else {
                    return;
                };
                warn!(key = %key, error = %message, "session failed, resetting guest flow");
                self.fin_observed = true;
                let rst = flow.rst(&macs);
                self.enqueue_frame(rst, None);
                self.paused.remove(&key);
            }
            NetEvent::TcpClose { key } => {
                let Some(flow) = self.flows.get_mut(&key) else {
                    return;
                };
                let remove = match flow.state {
                    FlowState::FinSent | FlowState::FinWait | FlowState::Closed => true,
                    _ => {
                        flow.state = FlowState::ClosedByRemote;
                        false
                    }
                };
                if remove {
                    self.flows.remove(&key);
                }
                self.paused.remove(&key);
            }
            NetEvent::UdpRecv { src_ip, src_port, dst_ip, dst_port, data } => {
                let frame = build_udp_frame(
                    &macs,
                    from_std(src_ip),
                    src_port,
                    from_std(dst_ip),
                    dst_port,
                    &data,
                );
                self.enqueue_frame(frame, None);
            }
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let Some(eth) = parse_ethernet(frame) else {
            return;
        };
        match eth.ethertype() {
            EthernetProtocol::Arp => {
                if let Some(reply) = self.arp.process(frame) {
                    self.enqueue_frame(reply, None);
                }
            }
            EthernetProtocol::Ipv4 => self.handle_ipv4(frame),
            other => trace!(ethertype = ?other, "ignoring ethertype"),
        }
    }

    fn handle_ipv4(&mut self, frame: &[u8]) {
        let Some(eth) = parse_ethernet(frame) else {
            return;
        };
        let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else {
            return;
        };
        if ip.version() != 4 {
            return;
        }

        match ip.next_header() {
            IpProtocol::Icmp => {
                if let Some(reply) = self.icmp.process(frame) {
                    self.enqueue_frame(reply, None);
                }
            }
            IpProtocol::Udp => self.handle_guest_udp(frame),
            IpProtocol::Tcp => self.handle_guest_tcp(frame),
            other => trace!(protocol = ?other, "ignoring IPv4 protocol"),
        }
    }

    fn handle_guest_udp(&mut self, frame: &[u8]) {
        let Some(eth) = parse_ethernet(frame) else {
            return;
        };
        let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else {
            return;
        };
        let Ok(udp) = UdpPacket::new_checked(ip.payload()) else {
            return;
        };

        if udp.dst_port() == DHCP_SERVER_PORT && udp.src_port() == DHCP_CLIENT_PORT {
            if let Some(reply) = self.dhcp.process(frame) {
                self.enqueue_frame(reply, None);
            }
            return;
        }

        let key = FlowKey::udp(
            to_std(ip.src_addr()),
            udp.src_port(),
            to_std(ip.dst_addr()),
            udp.dst_port(),
        );
        trace!(key = %key, len = udp.payload().len(), "forwarding UDP datagram");
        self.outbox.send(ControlMsg::UdpSend { key, data: udp.payload().to_vec() });
    }

    fn handle_guest_tcp(&mut self, frame: &[u8]) {
        let macs = self.macs;
        let Some(eth) = parse_ethernet(frame) else {
            return;
        };
        let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else {
            return;
        };
        let Ok(tcp) = TcpPacket::new_checked(ip.payload()) else {
            return;
        };

        let key = FlowKey::tcp(
            to_std(ip.src_addr()),
            tcp.src_port(),
            to_std(ip.dst_addr()),
            tcp.dst_port(),
        );
        let seq = tcp.seq_number().0 as u32;
        let ack = if tcp.ack() { Some(tcp.ack_number().0 as u32) } else { None };
        let (syn, fin, rst) = (tcp.syn(), tcp.fin(), tcp.rst());
        let payload = tcp.payload().to_vec();

        if rst {
            if self.flows.remove(&key).is_some() {
                debug!(key = %key, "guest RST, destroying session");
                self.paused.remove(&key);
                self.outbox.send(ControlMsg::TcpClose { key, destroy: true });
            }
            return;
        }

        if syn && ack.is_none() {
            // A SYN for a key that already has a flow replaces the stale one.
            self.flows.insert(key, TcpFlow::new(key, seq));
            self.paused.remove(&key);
            self.outbox.send(ControlMsg::TcpConnect { key });
            return;
        }

        let mut out_frames: Vec<Vec<u8>> = Vec::new();
        let mut forward_payload = false;
        let mut close = false;
        let mut remove = false;
        {
            let Some(flow) = self.flows.get_mut(&key) else {
                debug!(key = %key, "segment for unknown flow, sending RST");
                let reset = rst_for_unknown(&macs, &key, seq, ack, payload.len());
                self.enqueue_frame(reset, None);
                return;
            };
            flow.note_guest_seq(seq);

            if !payload.is_empty() {
                forward_payload = true;
                out_frames.push(flow.ack_guest_payload(&macs, payload.len()));
            }

            if fin {
                out_frames.push(flow.ack_guest_fin(&macs));
                match flow.state {
                    FlowState::FinWait => {
                        remove = true;
                        close = true;
                    }
                    FlowState::ClosedByRemote => {
                        remove = true;
                    }
                    _ => {
                        flow.state = FlowState::FinSent;
                        close = true;
                    }
                }
                debug!(key = %key, remove, "guest FIN");
            }
        }

        if forward_payload {
            self.outbox.send(ControlMsg::TcpSend { key, data: payload });
        }
        for frame in out_frames {
            self.enqueue_frame(frame, None);
        }
        if close {
            self.outbox.send(ControlMsg::TcpClose { key, destroy: false });
        }
        if remove {
            self.flows.remove(&key);
            self.paused.remove(&key);
        }
    }

    /// Queue a frame for the guest, length-prefixed. When `cause` is a TCP
    /// flow and the queue has grown past the high watermark, pause it.
    fn enqueue_frame(&mut self, frame: Vec<u8>, cause: Option<FlowKey>) {
        self.tx.extend((frame.len() as u32).to_be_bytes());
        self.tx.extend(frame);

        if let Some(key) = cause
            && self.tx.len() > TX_PAUSE_HIGH
            && self.paused.insert(key)
        {
            debug!(key = %key, queued = self.tx.len(), "guest TX queue over watermark, pausing");
            self.outbox.send(ControlMsg::TcpPause { key });
        }
    }

    /// Number of live flows (teardown diagnostics).
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}
