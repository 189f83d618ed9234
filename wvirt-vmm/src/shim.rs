//! Syscall shim mapping guest fd operations onto the transport and the
//! network stack.
//!
//! The guest worker is single-threaded, so the shim services two event
//! sources from one seat: the shared-memory transport (stdin slot and net
//! ring) and the stack it drives. Blocking operations sleep on the
//! transport wake counter in short slices, draining the ring each slice so
//! inbound traffic becomes visible without a dedicated thread. The slice
//! ceiling bounds the worst-case latency between a record landing in the
//! ring and the guest observing it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::trace;
use wvirt_net::NetStack;
use wvirt_net::shmem::GuestTransport;

use crate::guest::{
    FD_LISTENER, FD_NIC, FD_STDERR, FD_STDIN, FD_STDOUT, FdInterest, GuestIo, IoResult,
    IoShimError, PollEvent, PollEventKind, PollSub, ShutdownHow,
};

/// Upper bound on one blocking wait slice.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Byte sink for guest stdout/stderr.
pub type OutputSink = Box<dyn FnMut(&[u8]) + Send>;

/// The shim: owns the guest-side transport handle and the stack.
pub struct IoShim {
    transport: GuestTransport,
    stack: NetStack,
    stop: Arc<AtomicBool>,
    stdin_residual: VecDeque<u8>,
    accepted: bool,
    nic_shutdown: bool,
    stdout: OutputSink,
    stderr: OutputSink,
}

impl IoShim {
    pub fn new(
        transport: GuestTransport,
        stack: NetStack,
        stop: Arc<AtomicBool>,
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Self {
        Self {
            transport,
            stack,
            stop,
            stdin_residual: VecDeque::new(),
            accepted: false,
            nic_shutdown: false,
            stdout,
            stderr,
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.transport.is_stopped()
    }

    /// Feed every pending ring record into the stack.
    fn drain_ring(&mut self) {
        while let Some(event) = self.transport.read_event() {
            self.stack.handle_event(event);
        }
    }

    fn read_stdin(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        loop {
            self.drain_ring();

            if !self.stdin_residual.is_empty() {
                let n = buf.len().min(self.stdin_residual.len());
                for (slot, byte) in buf.iter_mut().zip(self.stdin_residual.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if let Some(bytes) = self.transport.read_stdin() {
                self.stdin_residual.extend(bytes);
                continue;
            }
            if self.stopping() {
                return Err(IoShimError::Stopped);
            }
            self.transport.wait_for_io(WAIT_SLICE);
        }
    }

    fn read_nic(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        self.drain_ring();
        let n = self.stack.pull_guest_bytes(buf);
        if n > 0 {
            return Ok(n);
        }
        if self.stopping() {
            return Err(IoShimError::Stopped);
        }
        if self.stack.fin_observed() || self.nic_shutdown {
            return Ok(0);
        }
        Err(IoShimError::WouldBlock)
    }

    /// Readiness of one fd subscription right now. Clocks are handled by
    /// the poll loop, which anchors them at entry.
    fn sub_ready(&self, sub: &PollSub) -> Option<PollEventKind> {
        match *sub {
            PollSub::Fd { fd: FD_STDIN, interest: FdInterest::Read } => {
                (!self.stdin_residual.is_empty() || self.transport.stdin_ready())
                    .then_some(PollEventKind::Readable)
            }
            PollSub::Fd { fd: FD_LISTENER, interest: FdInterest::Read } => {
                (!self.accepted).then_some(PollEventKind::Readable)
            }
            PollSub::Fd { fd: FD_NIC, interest: FdInterest::Read } => {
                (self.stack.pending_guest_bytes() || self.stack.fin_observed() || self.nic_shutdown)
                    .then_some(PollEventKind::Readable)
            }
            PollSub::Fd { fd: FD_NIC | FD_STDOUT | FD_STDERR, interest: FdInterest::Write } => {
                Some(PollEventKind::Writable)
            }
            PollSub::Fd { .. } => None,
            PollSub::After(_) | PollSub::At(_) => None,
        }
    }
}

/// Absolute deadline of a clock subscription. Relative clocks are anchored
/// at `anchor` (the time poll was entered).
fn clock_deadline(sub: &PollSub, anchor: Instant) -> Option<Instant> {
    match *sub {
        PollSub::After(delay) => Some(anchor + delay),
        PollSub::At(deadline) => Some(deadline),
        PollSub::Fd { .. } => None,
    }
}

impl GuestIo for IoShim {
    fn read(&mut self, fd: u32, buf: &mut [u8]) -> IoResult<usize> {
        match fd {
            FD_STDIN => self.read_stdin(buf),
            FD_NIC => self.read_nic(buf),
            other => Err(IoShimError::BadFd(other)),
        }
    }

    fn write(&mut self, fd: u32, buf: &[u8]) -> IoResult<usize> {
        match fd {
            FD_STDOUT => {
                (self.stdout)(buf);
                Ok(buf.len())
            }
            FD_STDERR => {
                (self.stderr)(buf);
                Ok(buf.len())
            }
            FD_NIC => {
                self.stack.push_guest_bytes(buf);
                Ok(buf.len())
            }
            other => Err(IoShimError::BadFd(other)),
        }
    }

    fn accept(&mut self, fd: u32) -> IoResult<u32> {
        if fd != FD_LISTENER {
            return Err(IoShimError::BadFd(fd));
        }
        if self.accepted {
            return Err(IoShimError::WouldBlock);
        }
        self.accepted = true;
        trace!("guest accepted NIC connection");
        Ok(FD_NIC)
    }

    fn recv(&mut self, fd: u32, buf: &mut [u8]) -> IoResult<usize> {
        if fd != FD_NIC {
            return Err(IoShimError::BadFd(fd));
        }
        self.read_nic(buf)
    }

    fn shutdown(&mut self, fd: u32, _how: ShutdownHow) -> IoResult<()> {
        if fd != FD_NIC {
            return Err(IoShimError::BadFd(fd));
        }
        self.nic_shutdown = true;
        Ok(())
    }

    fn poll(&mut self, subs: &[PollSub]) -> IoResult<Vec<PollEvent>> {
        let anchor = Instant::now();
        let deadline = subs.iter().filter_map(|s| clock_deadline(s, anchor)).min();

        loop {
            self.drain_ring();
            if self.stopping() {
                return Err(IoShimError::Stopped);
            }

            let now = Instant::now();
            let mut events = Vec::new();
            for (index, sub) in subs.iter().enumerate() {
                let kind = match *sub {
                    PollSub::After(_) | PollSub::At(_) => {
                        // Relative clocks are measured from poll entry.
                        clock_deadline(sub, anchor)
                            .is_some_and(|d| d <= now)
                            .then_some(PollEventKind::Clock)
                    }
                    _ => self.sub_ready(sub),
                };
                if let Some(kind) = kind {
                    events.push(PollEvent { subscription: index, kind });
                }
            }
            if !events.is_empty() {
                return Ok(events);
            }

            let slice = match deadline {
                Some(d) => d.saturating_duration_since(now).min(WAIT_SLICE),
                None => WAIT_SLICE,
            };
            self.transport.wait_for_io(slice.max(Duration::from_millis(1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use wvirt_net::NetConfig;
    use wvirt_net::shmem::{RingProducer, StdinWriter, shared_region};

    fn test_shim() -> (IoShim, StdinWriter, RingProducer, Arc<AtomicBool>) {
        let (stdin, ring, transport) = shared_region();
        let poll = mio::Poll::new().unwrap();
        let waker = Arc::new(mio::Waker::new(poll.registry(), mio::Token(0)).unwrap());
        let (_inbox, outbox) = wvirt_net::control::channel(waker);
        let stack = NetStack::new(NetConfig::default(), outbox);
        let stop = Arc::new(AtomicBool::new(false));
        let shim = IoShim::new(
            transport,
            stack,
            Arc::clone(&stop),
            Box::new(|_| {}),
            Box::new(|_| {}),
        );
        (shim, stdin, ring, stop)
    }

    #[test]
    fn test_stdin_read_order_and_residual() {
        let (mut shim, mut stdin, _ring, _stop) = test_shim();
        stdin.write_stdin(b"hello world").unwrap();

        // A short buffer leaves a residual that the next read picks up.
        let mut buf = [0u8; 6];
        assert_eq!(shim.read(FD_STDIN, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"hello ");
        let mut buf = [0u8; 16];
        assert_eq!(shim.read(FD_STDIN, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"world");
    }

    #[test]
    fn test_stdin_read_blocks_until_written() {
        let (mut shim, mut stdin, _ring, _stop) = test_shim();

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            stdin.write_stdin(b"late").unwrap();
        });

        let mut buf = [0u8; 16];
        let n = shim.read(FD_STDIN, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"late");
        writer.join().unwrap();
    }

    #[test]
    fn test_accept_succeeds_exactly_once() {
        let (mut shim, _stdin, _ring, _stop) = test_shim();
        assert_eq!(shim.accept(FD_LISTENER).unwrap(), FD_NIC);
        assert_eq!(shim.accept(FD_LISTENER), Err(IoShimError::WouldBlock));
        assert_eq!(shim.accept(FD_NIC), Err(IoShimError::BadFd(FD_NIC)));
    }

    #[test]
    fn test_recv_wouldblock_then_eof_after_shutdown() {
        let (mut shim, _stdin, _ring, _stop) = test_shim();
        let mut buf = [0u8; 64];
        assert_eq!(shim.recv(FD_NIC, &mut buf), Err(IoShimError::WouldBlock));

        shim.shutdown(FD_NIC, ShutdownHow::Both).unwrap();
        assert_eq!(shim.recv(FD_NIC, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_bad_fd_rejected() {
        let (mut shim, _stdin, _ring, _stop) = test_shim();
        let mut buf = [0u8; 8];
        assert_eq!(shim.read(9, &mut buf), Err(IoShimError::BadFd(9)));
        assert_eq!(shim.write(9, b"x"), Err(IoShimError::BadFd(9)));
        assert_eq!(shim.write(FD_STDIN, b"x"), Err(IoShimError::BadFd(FD_STDIN)));
    }

    #[test]
    fn test_poll_clock_fires() {
        let (mut shim, _stdin, _ring, _stop) = test_shim();
        let start = Instant::now();
        let events = shim.poll(&[PollSub::After(Duration::from_millis(40))]).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(events, vec![PollEvent { subscription: 0, kind: PollEventKind::Clock }]);
    }

    #[test]
    fn test_poll_absolute_clock_fires() {
        let (mut shim, _stdin, _ring, _stop) = test_shim();
        let deadline = Instant::now() + Duration::from_millis(30);
        let events = shim.poll(&[PollSub::At(deadline)]).unwrap();
        assert!(Instant::now() >= deadline);
        assert_eq!(events, vec![PollEvent { subscription: 0, kind: PollEventKind::Clock }]);

        // A deadline already in the past fires immediately.
        let start = Instant::now();
        let events = shim.poll(&[PollSub::At(start - Duration::from_millis(1))]).unwrap();
        assert_eq!(events[0].kind, PollEventKind::Clock);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_poll_earliest_clock_wins() {
        let (mut shim, _stdin, _ring, _stop) = test_shim();
        let start = Instant::now();
        let events = shim
            .poll(&[
                PollSub::After(Duration::from_secs(5)),
                PollSub::After(Duration::from_millis(30)),
            ])
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(events, vec![PollEvent { subscription: 1, kind: PollEventKind::Clock }]);
    }

    #[test]
    fn test_poll_listener_readable_until_accept() {
        let (mut shim, _stdin, _ring, _stop) = test_shim();
        let subs = [PollSub::Fd { fd: FD_LISTENER, interest: FdInterest::Read }];
        let events = shim.poll(&subs).unwrap();
        assert_eq!(events[0].kind, PollEventKind::Readable);

        let _ = shim.accept(FD_LISTENER).unwrap();
        // The listener never becomes readable again; only the clock fires.
        let events = shim
            .poll(&[
                PollSub::Fd { fd: FD_LISTENER, interest: FdInterest::Read },
                PollSub::After(Duration::from_millis(20)),
            ])
            .unwrap();
        assert_eq!(events, vec![PollEvent { subscription: 1, kind: PollEventKind::Clock }]);
    }

    #[test]
    fn test_poll_wakes_on_stdin() {
        let (mut shim, mut stdin, _ring, _stop) = test_shim();

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stdin.write_stdin(b"wake").unwrap();
        });

        let events = shim
            .poll(&[
                PollSub::Fd { fd: FD_STDIN, interest: FdInterest::Read },
                PollSub::After(Duration::from_secs(5)),
            ])
            .unwrap();
        assert_eq!(events, vec![PollEvent { subscription: 0, kind: PollEventKind::Readable }]);
        writer.join().unwrap();
    }

    #[test]
    fn test_nic_always_writable() {
        let (mut shim, _stdin, _ring, _stop) = test_shim();
        let events =
            shim.poll(&[PollSub::Fd { fd: FD_NIC, interest: FdInterest::Write }]).unwrap();
        assert_eq!(events[0].kind, PollEventKind::Writable);
    }

    #[test]
    fn test_stop_flag_fails_blocking_calls() {
        let (mut shim, _stdin, _ring, stop) = test_shim();
        stop.store(true, Ordering::Release);

        let mut buf = [0u8; 8];
        assert_eq!(shim.read(FD_STDIN, &mut buf), Err(IoShimError::Stopped));
        assert_eq!(
            shim.poll(&[PollSub::After(Duration::from_secs(60))]),
            Err(IoShimError::Stopped)
        );
    }
}
