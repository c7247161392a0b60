//! Process-wide interrupt handling.
//!
//! [`Shutdown::request`] is the single entry point for tearing down a run. The
//! OS signal listener and the normal control path both call it; the interrupted
//! flag is monotonic and the registry sweep runs at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::exit_codes;
use crate::io::process::ProcessRegistry;

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct Shutdown {
    interrupted: AtomicBool,
    sweep: Once,
    registry: Arc<ProcessRegistry>,
    grace: Duration,
}

impl Shutdown {
    pub fn new(registry: Arc<ProcessRegistry>, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            interrupted: AtomicBool::new(false),
            sweep: Once::new(),
            registry,
            grace,
        })
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Mark the run interrupted and terminate every registered process.
    ///
    /// Safe to call any number of times from any thread; never panics.
    pub fn request(&self) {
        if !self.interrupted.swap(true, Ordering::SeqCst) {
            info!("shutdown requested");
        }
        self.sweep.call_once(|| {
            debug!(live = self.registry.len(), "terminating registered processes");
            self.registry.terminate_all(self.grace);
        });
    }

    /// Sleep for `duration` unless interrupted first. Returns `false` if interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Route SIGINT and SIGTERM to [`Shutdown::request`].
///
/// Signals are received on a dedicated thread running a small current-thread
/// tokio runtime, so the rest of the supervisor stays synchronous. The sweep
/// runs off that thread; a second signal exits immediately with 130.
pub fn install_signal_handlers(shutdown: Arc<Shutdown>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    let signals = {
        let _entered = runtime.enter();
        Signals::register().context("register signal handlers")?
    };

    thread::Builder::new()
        .name("ralph-signals".to_string())
        .spawn(move || runtime.block_on(handle_signals(signals, shutdown)))
        .context("spawn signal thread")?;
    Ok(())
}

async fn handle_signals(mut signals: Signals, shutdown: Arc<Shutdown>) {
    signals.recv().await;
    eprintln!("\n\nReceived interrupt signal. Cleaning up...");
    let _sweep = tokio::task::spawn_blocking(move || shutdown.request());

    signals.recv().await;
    eprintln!("Received second interrupt signal. Exiting now.");
    warn!("forced exit before cleanup finished");
    std::process::exit(exit_codes::INTERRUPTED);
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => debug!("SIGINT received"),
            _ = self.terminate.recv() => debug!("SIGTERM received"),
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => debug!("ctrl-c received"),
            Err(err) => {
                warn!(err = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_monotonic_and_idempotent() {
        let shutdown = Shutdown::new(ProcessRegistry::new(), Duration::from_millis(100));
        assert!(!shutdown.is_interrupted());

        shutdown.request();
        shutdown.request();
        assert!(shutdown.is_interrupted());
    }

    #[test]
    fn concurrent_requests_do_not_panic() {
        let shutdown = Shutdown::new(ProcessRegistry::new(), Duration::from_millis(100));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let shutdown = Arc::clone(&shutdown);
                thread::spawn(move || shutdown.request())
            })
            .collect();
        for handle in threads {
            handle.join().expect("join");
        }
        assert!(shutdown.is_interrupted());
    }

    #[test]
    fn sleep_returns_early_when_interrupted() {
        let shutdown = Shutdown::new(ProcessRegistry::new(), Duration::from_millis(100));
        let trigger = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.request();
        });

        let started = Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().expect("join");
    }

    #[test]
    fn sleep_completes_without_interrupt() {
        let shutdown = Shutdown::new(ProcessRegistry::new(), Duration::from_millis(100));
        assert!(shutdown.sleep(Duration::from_millis(30)));
        assert!(shutdown.sleep(Duration::ZERO));
    }

    #[cfg(unix)]
    #[test]
    fn request_sweeps_live_processes() {
        use std::process::Command;

        let registry = ProcessRegistry::new();
        let shutdown = Shutdown::new(Arc::clone(&registry), Duration::from_secs(1));
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let handle = registry.spawn(cmd, "worker").expect("spawn");

        shutdown.request();
        assert!(!handle.is_alive());
        assert!(registry.is_empty());
    }
}
