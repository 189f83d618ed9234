//! Per-flow TCP state, owned by the guest-side stack.
//!
//! The stack plays the remote endpoint toward the guest: it answers the
//! guest's SYN with a SYN-ACK once the reactor reports the real connect,
//! ACKs guest payload, and re-segments inbound payload into MSS-sized
//! segments. The guest kernel owns retransmission; this side only tracks
//! the two sequence cursors.

use smoltcp::wire::TcpControl;
use tracing::debug;

use crate::key::FlowKey;
use crate::packet::{MSS, MacPlan, build_tcp_frame, from_std};

/// Flow lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Guest SYN seen, connect requested from the reactor.
    SynSent,
    /// Handshake complete toward the guest.
    Established,
    /// Remote FIN delivered to the guest; waiting for the guest's FIN.
    FinWait,
    /// The reactor reported the session closed; waiting for the guest.
    ClosedByRemote,
    /// Guest FIN seen and forwarded; waiting for the remote side.
    FinSent,
    /// Terminal; the flow is removed from the table.
    Closed,
}

/// Guest-side state for one TCP connection.
pub struct TcpFlow {
    pub key: FlowKey,
    pub state: FlowState,
    /// Our next sequence number toward the guest.
    my_seq: u32,
    /// Next guest byte we expect (our ACK).
    my_ack: u32,
    /// Last sequence number observed from the guest.
    vm_seq: u32,
}

impl TcpFlow {
    /// Create a flow for a guest SYN carrying `guest_isn`.
    pub fn new(key: FlowKey, guest_isn: u32) -> Self {
        let isn: u32 = rand::random();
        debug!(key = %key, guest_isn, isn, "TCP flow created");
        Self {
            key,
            state: FlowState::SynSent,
            my_seq: isn,
            my_ack: guest_isn.wrapping_add(1),
            vm_seq: guest_isn,
        }
    }

    pub fn note_guest_seq(&mut self, seq: u32) {
        self.vm_seq = seq;
    }

    /// The reactor's connect completed: SYN-ACK toward the guest.
    pub fn handle_connected(&mut self, macs: &MacPlan) -> Vec<u8> {
        self.state = FlowState::Established;
        let frame = self.frame(macs, self.my_seq, TcpControl::Syn, &[]);
        // The SYN consumes one sequence number.
        self.my_seq = self.my_seq.wrapping_add(1);
        frame
    }

    /// Guest payload accepted and forwarded: advance the ACK cursor and
    /// acknowledge.
    pub fn ack_guest_payload(&mut self, macs: &MacPlan, len: usize) -> Vec<u8> {
        self.my_ack = self.my_ack.wrapping_add(len as u32);
        self.pure_ack(macs)
    }

    /// Acknowledge the guest's FIN (which consumes one sequence number).
    pub fn ack_guest_fin(&mut self, macs: &MacPlan) -> Vec<u8> {
        self.my_ack = self.my_ack.wrapping_add(1);
        self.pure_ack(macs)
    }

    /// An ACK-only segment at the current cursors.
    pub fn pure_ack(&self, macs: &MacPlan) -> Vec<u8> {
        self.frame(macs, self.my_seq, TcpControl::None, &[])
    }

    /// Re-segment remote payload into MSS-sized segments; PSH on the last.
    /// Empty payload degenerates to a single pure ACK.
    pub fn data_segments(&mut self, macs: &MacPlan, data: &[u8]) -> Vec<Vec<u8>> {
        if data.is_empty() {
            return vec![self.pure_ack(macs)];
        }

        let mut frames = Vec::with_capacity(data.len().div_ceil(MSS));
        let mut chunks = data.chunks(MSS).peekable();
        while let Some(chunk) = chunks.next() {
            let control = if chunks.peek().is_none() { TcpControl::Psh } else { TcpControl::None };
            frames.push(self.frame(macs, self.my_seq, control, chunk));
            self.my_seq = self.my_seq.wrapping_add(chunk.len() as u32);
        }
        frames
    }

    /// FIN toward the guest (consumes one sequence number).
    pub fn fin(&mut self, macs: &MacPlan) -> Vec<u8> {
        let frame = self.frame(macs, self.my_seq, TcpControl::Fin, &[]);
        self.my_seq = self.my_seq.wrapping_add(1);
        frame
    }

    /// RST toward the guest at the current cursor.
    pub fn rst(&self, macs: &MacPlan) -> Vec<u8> {
        self.frame(macs, self.my_seq, TcpControl::Rst, &[])
    }

    fn frame(&self, macs: &MacPlan, seq: u32, control: TcpControl, payload: &[u8]) -> Vec<u8> {
        build_tcp_frame(
            macs,
            from_std(self.key.dst_ip),
            self.key.dst_port,
            from_std(self.key.src_ip),
            self.key.src_port,
            seq,
            Some(self.my_ack),
            control,
            payload,
        )
    }
}

/// RST for a segment that matches no flow. The reset takes the peer's ACK
/// as its sequence number when present, otherwise acknowledges the
/// offending segment.
pub fn rst_for_unknown(
    macs: &MacPlan,
    key: &FlowKey,
    their_seq: u32,
    their_ack: Option<u32>,
    segment_len: usize,
) -> Vec<u8> {
    let (seq, ack) = match their_ack {
        Some(ack) => (ack, None),
        None => (0, Some(their_seq.wrapping_add(segment_len as u32).wrapping_add(1))),
    };
    build_tcp_frame(
        macs,
        from_std(key.dst_ip),
        key.dst_port,
        from_std(key.src_ip),
        key.src_port,
        seq,
        ack,
        TcpControl::Rst,
        &[],
    )
}
