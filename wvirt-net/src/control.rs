//! Control channel from the guest worker to the host reactor.
//!
//! Couples a crossbeam channel with the reactor's `mio::Waker` so that a
//! send from the guest thread both enqueues the message and pulls the
//! reactor out of its poll. Delivery is FIFO per sender and reliable while
//! both endpoints live; the reverse direction uses the shared-memory ring
//! exclusively, so the guest never blocks on host-to-guest traffic.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use mio::Waker;
use tracing::trace;

use crate::key::FlowKey;

/// Guest-to-host request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    /// Open a real TCP connection for `key`.
    TcpConnect { key: FlowKey },
    /// Forward guest payload bytes to the remote side of `key`.
    TcpSend { key: FlowKey, data: Vec<u8> },
    /// Close the session: graceful FIN when `destroy` is false, abortive
    /// teardown when true.
    TcpClose { key: FlowKey, destroy: bool },
    /// The guest TX buffer is over its high watermark; stop reading.
    TcpPause { key: FlowKey },
    /// The guest TX buffer drained; reading may resume.
    TcpResume { key: FlowKey },
    /// Send one UDP datagram through the NAT session for `key`.
    UdpSend { key: FlowKey, data: Vec<u8> },
}

/// Receiving end, owned by the reactor.
pub struct Inbox {
    rx: Receiver<ControlMsg>,
}

/// Sending end, cloned into the guest worker.
#[derive(Clone)]
pub struct Outbox {
    tx: Sender<ControlMsg>,
    waker: Arc<Waker>,
}

/// Create a channel pair wired to the given reactor waker.
pub fn channel(waker: Arc<Waker>) -> (Inbox, Outbox) {
    let (tx, rx) = unbounded();
    (Inbox { rx }, Outbox { tx, waker })
}

impl Inbox {
    /// Take one message without blocking.
    pub fn try_recv(&self) -> Result<ControlMsg, TryRecvError> {
        self.rx.try_recv()
    }

    /// Drain all currently queued messages.
    pub fn drain(&self) -> impl Iterator<Item = ControlMsg> + '_ {
        std::iter::from_fn(|| self.rx.try_recv().ok())
    }
}

impl Outbox {
    /// Enqueue a message and wake the reactor. A send after the reactor is
    /// gone is a benign no-op (teardown window).
    pub fn send(&self, msg: ControlMsg) {
        if self.tx.send(msg).is_err() {
            trace!("control message dropped, reactor inbox closed");
            return;
        }
        let _ = self.waker.wake();
    }
}
