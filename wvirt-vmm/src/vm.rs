//! Public VM façade: lifecycle, stdin delivery, output callbacks.
//!
//! `Vm::start` wires the shared region, the control channel, the host
//! reactor thread and the guest worker thread; `stop` tears everything
//! down in the reverse order. With networking disabled no reactor thread
//! is started: the stack still answers ARP, ICMP and DHCP locally, and
//! NAT requests go nowhere.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, info};
use wvirt_net::shmem::{STDIN_SLOT_SIZE, StdinWriter, TransportError, shared_region};
use wvirt_net::{HostReactor, NetConfig, NetStack, ReactorConfig, ReactorHandle, control};

use crate::guest::GuestRuntime;
use crate::shim::{IoShim, OutputSink};
use crate::worker::{WorkerHandle, spawn_worker};

/// How the guest ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmExit {
    /// The guest exited with the given code.
    Exited(i32),
    /// The VM was stopped from the host side.
    Stopped,
    /// The runtime died unexpectedly.
    Failed(String),
}

/// VM startup / runtime errors.
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Construction options for a VM instance.
pub struct VmConfig {
    guest_mac: [u8; 6],
    networking: bool,
    rate_limit: u64,
    stdout: Option<OutputSink>,
    stderr: Option<OutputSink>,
    on_exit: Option<Box<dyn FnOnce(VmExit) + Send>>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl VmConfig {
    pub fn new() -> Self {
        Self {
            guest_mac: wvirt_net::packet::DEFAULT_GUEST_MAC,
            networking: true,
            rate_limit: 0,
            stdout: None,
            stderr: None,
            on_exit: None,
        }
    }

    /// Set the guest's MAC address.
    pub fn guest_mac(mut self, mac: [u8; 6]) -> Self {
        self.guest_mac = mac;
        self
    }

    /// Enable or disable outbound networking (default: enabled).
    pub fn networking(mut self, enabled: bool) -> Self {
        self.networking = enabled;
        self
    }

    /// Per-TCP-session inbound byte/s cap; 0 means unlimited.
    pub fn rate_limit(mut self, bytes_per_second: u64) -> Self {
        self.rate_limit = bytes_per_second;
        self
    }

    /// Receive the guest's stdout byte stream.
    pub fn on_stdout(mut self, sink: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.stdout = Some(Box::new(sink));
        self
    }

    /// Receive the guest's stderr byte stream.
    pub fn on_stderr(mut self, sink: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.stderr = Some(Box::new(sink));
        self
    }

    /// Called exactly once when the guest ends, however it ends.
    pub fn on_exit(mut self, callback: impl FnOnce(VmExit) + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(callback));
        self
    }
}

/// A running VM instance.
pub struct Vm {
    stdin: StdinWriter,
    reactor: Option<(ReactorHandle, JoinHandle<()>)>,
    worker: Option<WorkerHandle>,
    stop: Arc<AtomicBool>,
    stopped: bool,
}

impl Vm {
    /// Start the VM: spawn the reactor (if networking is on) and the guest
    /// worker running `runtime`.
    pub fn start(runtime: Box<dyn GuestRuntime>, config: VmConfig) -> Result<Vm, VmError> {
        let (stdin, ring, transport) = shared_region();
        let stop = Arc::new(AtomicBool::new(false));

        let (reactor, outbox) = if config.networking {
            let (mut reactor, handle, outbox) =
                HostReactor::new(ring, ReactorConfig { rate_limit: config.rate_limit })?;
            let thread =
                thread::Builder::new().name("host-reactor".to_string()).spawn(move || reactor.run())?;
            (Some((handle, thread)), outbox)
        } else {
            // No reactor: keep a live waker for the outbox, drop the inbox
            // so every NAT request is a no-op.
            let poll = mio::Poll::new()?;
            let waker = Arc::new(mio::Waker::new(poll.registry(), mio::Token(0))?);
            let (_inbox, outbox) = control::channel(waker);
            debug!("networking disabled, NAT requests will be dropped");
            (None, outbox)
        };

        let stack = NetStack::new(NetConfig { guest_mac: config.guest_mac }, outbox);
        let stdout = config.stdout.unwrap_or_else(|| Box::new(|_: &[u8]| {}));
        let stderr = config.stderr.unwrap_or_else(|| Box::new(|_: &[u8]| {}));
        let shim = IoShim::new(transport, stack, Arc::clone(&stop), stdout, stderr);

        let on_exit = config.on_exit.unwrap_or_else(|| Box::new(|_| {}));
        let worker = spawn_worker(runtime, shim, Arc::clone(&stop), on_exit)?;

        info!(networking = config.networking, "vm started");
        Ok(Vm { stdin, reactor, worker: Some(worker), stop, stopped: false })
    }

    /// Deliver bytes to the guest's stdin, chunked through the 4 KiB slot.
    pub fn write_stdin(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        for chunk in bytes.chunks(STDIN_SLOT_SIZE) {
            self.stdin.write_stdin(chunk)?;
        }
        Ok(())
    }

    /// Stop the VM: tear down sockets, wake and join both threads.
    /// Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("vm stopping");

        self.stop.store(true, Ordering::Release);
        self.stdin.shutdown();

        if let Some((handle, thread)) = self.reactor.take() {
            handle.stop();
            let _ = thread.join();
        }
        if let Some(worker) = self.worker.take() {
            worker.stop();
            let _ = worker.join();
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.stop();
    }
}
