//! Embeds a sandboxed guest and exposes it as a programmable shell.
//!
//! The guest emulator is an opaque collaborator behind
//! [`guest::GuestRuntime`]; this crate provides the syscall shim it runs
//! against, the worker thread that hosts it, and the [`vm::Vm`] façade
//! external callers consume. All networking lives in `wvirt-net`.

pub mod guest;
pub mod shim;
pub mod vm;
pub mod worker;

pub use guest::{
    FD_LISTENER, FD_NIC, FD_STDERR, FD_STDIN, FD_STDOUT, FdInterest, GuestError, GuestIo,
    GuestRuntime, IoResult, IoShimError, PollEvent, PollEventKind, PollSub, ShutdownHow,
};
pub use shim::{IoShim, OutputSink};
pub use vm::{Vm, VmConfig, VmError, VmExit};
pub use worker::WorkerHandle;
