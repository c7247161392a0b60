//! Background monitor for the restart signal file.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::io::process::ProcessHandle;
use crate::io::signal_file::SignalFile;
use crate::shutdown::Shutdown;

/// Polls the signal file while the worker is alive and cancels the iteration
/// when it appears.
///
/// On detection the watcher sets its flag, terminates the worker, deletes the
/// file, and only then posts to the single-slot restart channel. The runner can
/// therefore treat a received message as "worker gone, file consumed".
pub struct SignalWatcher {
    detected: Arc<AtomicBool>,
    restart_rx: Receiver<()>,
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

/// Settings for one watcher thread.
#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    pub poll_interval: Duration,
    pub terminate_grace: Duration,
}

impl SignalWatcher {
    pub fn spawn(
        process: Arc<ProcessHandle>,
        signal: SignalFile,
        shutdown: Arc<Shutdown>,
        settings: WatchSettings,
    ) -> Result<Self> {
        let detected = Arc::new(AtomicBool::new(false));
        let (restart_tx, restart_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel();

        let flag = Arc::clone(&detected);
        let thread = thread::Builder::new()
            .name("ralph-signal-watcher".to_string())
            .spawn(move || {
                watch(
                    &process, &signal, &shutdown, &flag, &restart_tx, &stop_rx, settings,
                );
            })
            .context("spawn signal watcher")?;

        Ok(Self {
            detected,
            restart_rx,
            stop_tx,
            thread: Some(thread),
        })
    }

    pub fn restart_detected(&self) -> bool {
        self.detected.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for a restart to be fully handled.
    ///
    /// Doubles as the control loop's polling sleep.
    pub fn wait_for_restart(&self, timeout: Duration) -> bool {
        match self.restart_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                // Watcher already finished; keep the caller's cadence.
                if !self.restart_detected() {
                    thread::sleep(timeout);
                }
                self.restart_detected()
            }
        }
    }

    /// Stop the watcher and wait for it. Returns whether a restart was detected.
    ///
    /// If the watcher is mid-way through handling a restart, this waits for the
    /// worker termination and file removal to finish.
    pub fn stop(mut self) -> bool {
        self.shutdown_thread();
        self.restart_detected()
    }

    fn shutdown_thread(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("signal watcher panicked");
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.shutdown_thread();
    }
}

fn watch(
    process: &ProcessHandle,
    signal: &SignalFile,
    shutdown: &Shutdown,
    detected: &AtomicBool,
    restart_tx: &SyncSender<()>,
    stop_rx: &Receiver<()>,
    settings: WatchSettings,
) {
    debug!(pid = process.pid(), path = %signal.path().display(), "signal watcher started");
    loop {
        if shutdown.is_interrupted() || detected.load(Ordering::SeqCst) || !process.is_alive() {
            break;
        }
        if signal.is_raised() {
            detected.store(true, Ordering::SeqCst);
            info!(pid = process.pid(), "restart signal detected, stopping worker");
            if let Err(err) = process.terminate(settings.terminate_grace) {
                warn!(err = %format!("{err:#}"), "failed to stop worker after restart signal");
            }
            if let Err(err) = signal.clear() {
                warn!(err = %format!("{err:#}"), "failed to remove restart signal");
            }
            // Single slot; a full or closed channel means the runner already knows.
            let _ = restart_tx.try_send(());
            break;
        }
        match stop_rx.recv_timeout(settings.poll_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(pid = process.pid(), "signal watcher stopped");
}
