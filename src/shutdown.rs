//! Cooperative shutdown on termination signals.
//!
//! The first SIGINT/SIGTERM flips a watch channel to `true`. The controller
//! checks it before every scheduled step, so an invocation that is already
//! running finishes on its own. A second signal exits immediately with
//! status 0; child processes are left alone.

use std::io;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

/// Shared shutdown flag.
///
/// Clones refer to the same flag. The flag goes from `false` to `true` once
/// and never back.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    /// Creates a handle in the running state.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Receiver to hand to the controller.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        *self.sender.borrow()
    }

    /// Requests shutdown.
    ///
    /// Returns `true` for the first request and `false` if one was already made.
    pub fn request(&self, reason: &str) -> bool {
        let already = self.sender.send_replace(true);
        if !already {
            info!("Received {}, shutting down gracefully...", reason);
        }
        !already
    }

    /// Installs the SIGINT/SIGTERM handler.
    ///
    /// Can only be installed once per process.
    pub fn install_signal_handler(&self) -> io::Result<()> {
        let handle = self.clone();

        ctrlc::set_handler(move || {
            if !handle.request("termination signal") {
                warn!("Second termination signal received, exiting immediately");
                std::process::exit(0);
            }
        })
        .map_err(|e| io::Error::other(e.to_string()))
    }
}
