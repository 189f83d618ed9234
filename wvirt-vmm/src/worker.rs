//! Guest worker thread management.
//!
//! The guest emulator runs synchronously on its own thread; all its I/O
//! goes through the shim. Shutdown is cooperative: the stop flag and the
//! transport's stopped mark make every blocking shim call return
//! [`IoShimError::Stopped`](crate::guest::IoShimError::Stopped).

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::guest::{GuestError, GuestRuntime, IoShimError};
use crate::shim::IoShim;
use crate::vm::VmExit;

/// Handle to a running guest worker.
pub struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Signal the worker to stop at its next shim call.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for the worker to finish.
    pub fn join(mut self) -> Result<(), String> {
        match self.thread.take() {
            Some(handle) => handle.join().map_err(|_| "guest worker panicked".to_string()),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Spawn the worker thread running `runtime` against `shim`.
pub(crate) fn spawn_worker(
    mut runtime: Box<dyn GuestRuntime>,
    mut shim: IoShim,
    stop: Arc<AtomicBool>,
    on_exit: Box<dyn FnOnce(VmExit) + Send>,
) -> io::Result<WorkerHandle> {
    let stop_flag = Arc::clone(&stop);
    let thread = thread::Builder::new().name("guest-worker".to_string()).spawn(move || {
        let exit = match runtime.run(&mut shim) {
            Ok(code) => {
                info!(code, "guest exited");
                VmExit::Exited(code)
            }
            Err(GuestError::Io(IoShimError::Stopped)) => {
                info!("guest worker stopped");
                VmExit::Stopped
            }
            Err(e) => {
                warn!(error = %e, "guest runtime failed");
                VmExit::Failed(e.to_string())
            }
        };
        on_exit(exit);
    })?;

    Ok(WorkerHandle { thread: Some(thread), stop: stop_flag })
}
