//! Contract between the VM and the opaque guest emulator.
//!
//! The emulator runs synchronously on its worker thread and performs all
//! I/O through [`GuestIo`], which the syscall shim implements. File
//! descriptors are fixed by convention: 0/1/2 are the standard streams,
//! 3 is the preopened listening socket, and 4 is the single accepted
//! connection carrying the NIC byte stream.

use std::time::{Duration, Instant};

use thiserror::Error;

/// Guest stdin.
pub const FD_STDIN: u32 = 0;
/// Guest stdout.
pub const FD_STDOUT: u32 = 1;
/// Guest stderr.
pub const FD_STDERR: u32 = 2;
/// The preopened listening socket; accepting on it yields the NIC fd.
pub const FD_LISTENER: u32 = 3;
/// The NIC byte stream (length-prefixed Ethernet frames).
pub const FD_NIC: u32 = 4;

/// Errors surfaced to the guest through the shim.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IoShimError {
    #[error("operation would block")]
    WouldBlock,
    #[error("bad file descriptor {0}")]
    BadFd(u32),
    #[error("vm is stopping")]
    Stopped,
}

pub type IoResult<T> = Result<T, IoShimError>;

/// Readiness direction for an fd subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdInterest {
    Read,
    Write,
}

/// One poll subscription: an fd readiness watch or a clock.
#[derive(Debug, Clone, Copy)]
pub enum PollSub {
    Fd { fd: u32, interest: FdInterest },
    /// Wake after a relative delay.
    After(Duration),
    /// Wake at an absolute deadline.
    At(Instant),
}

/// Why a subscription fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEventKind {
    Readable,
    Writable,
    Clock,
}

/// A fired subscription, identified by its index in the input set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub subscription: usize,
    pub kind: PollEventKind,
}

/// Which direction to shut down on the NIC stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

/// The syscall surface the shim presents to the guest emulator.
pub trait GuestIo {
    /// Blocking on fd 0, non-blocking elsewhere.
    fn read(&mut self, fd: u32, buf: &mut [u8]) -> IoResult<usize>;
    fn write(&mut self, fd: u32, buf: &[u8]) -> IoResult<usize>;
    /// Succeeds exactly once, on fd 3, yielding fd 4.
    fn accept(&mut self, fd: u32) -> IoResult<u32>;
    /// Like `read(4)`, plus EOF (0) once a FIN has been observed.
    fn recv(&mut self, fd: u32, buf: &mut [u8]) -> IoResult<usize>;
    fn shutdown(&mut self, fd: u32, how: ShutdownHow) -> IoResult<()>;
    /// Wait for any subscription; returns the fired set.
    fn poll(&mut self, subs: &[PollSub]) -> IoResult<Vec<PollEvent>>;
}

/// Failure reported by a guest runtime.
#[derive(Debug, Error)]
pub enum GuestError {
    #[error("guest runtime failed: {0}")]
    Runtime(String),
    #[error(transparent)]
    Io(#[from] IoShimError),
}

/// The opaque guest emulator: runs synchronously until the guest exits.
pub trait GuestRuntime: Send {
    fn run(&mut self, io: &mut dyn GuestIo) -> Result<i32, GuestError>;
}
