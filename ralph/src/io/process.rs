//! Child process plumbing: the supervised worker handle, the registry of live
//! workers, and a bounded one-shot runner for short helper commands.

use std::io::{ErrorKind, PipeReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Sleep between exit checks while waiting on a handle.
const WAIT_POLL: Duration = Duration::from_millis(20);

/// A spawned worker process.
///
/// Shared between the control loop, the signal watcher and the shutdown sweep,
/// so every operation takes `&self`. Termination of an exited process is a no-op.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    label: String,
    child: Mutex<Child>,
    output: Mutex<Option<PipeReader>>,
    exit: OnceLock<ExitStatus>,
    registry: Weak<ProcessRegistry>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Take the merged stdout/stderr pipe. Only the first caller gets it.
    pub fn take_output(&self) -> Option<PipeReader> {
        lock(&self.output).take()
    }

    /// Non-blocking liveness check. Reaps the process if it has exited.
    pub fn is_alive(&self) -> bool {
        if self.exit.get().is_some() {
            return false;
        }
        let polled = lock(&self.child).try_wait();
        match polled {
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(pid = self.pid, err = %err, "failed to poll process");
                false
            }
        }
    }

    /// Block until the process exits.
    pub fn wait(&self) -> Result<ExitStatus> {
        loop {
            if let Some(status) = self.wait_for(Duration::from_secs(1))? {
                return Ok(status);
            }
        }
    }

    /// Wait up to `limit` for the process to exit.
    pub fn wait_for(&self, limit: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(status) = self.exit.get() {
                return Ok(Some(*status));
            }
            let polled = lock(&self.child)
                .try_wait()
                .with_context(|| format!("wait for {} (pid {})", self.label, self.pid))?;
            if let Some(status) = polled {
                self.record_exit(status);
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(WAIT_POLL);
        }
    }

    /// Ask the process to stop, then force-kill it after `grace`.
    ///
    /// Also stops anything still running in the process group, even when the
    /// leader itself has already exited.
    pub fn terminate(&self, grace: Duration) -> Result<()> {
        if self.is_alive() {
            debug!(pid = self.pid, label = %self.label, "requesting graceful termination");
            self.signal_terminate();
            if self.wait_for(grace)?.is_none() {
                warn!(
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "process ignored termination request, killing"
                );
                self.kill()?;
            }
        }
        self.stop_group(grace);
        Ok(())
    }

    /// Force-kill the process (and its process group) and reap it.
    pub fn kill(&self) -> Result<()> {
        #[cfg(unix)]
        signal_group(self.pid, nix::sys::signal::Signal::SIGKILL);
        if self.exit.get().is_some() {
            return Ok(());
        }
        let killed = lock(&self.child).kill();
        match killed {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::InvalidInput => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("kill {} (pid {})", self.label, self.pid));
            }
        }
        self.wait().map(|_| ())
    }

    /// Stop group members left behind by a leader that has exited.
    #[cfg(unix)]
    fn stop_group(&self, grace: Duration) {
        use nix::sys::signal::Signal;

        if !group_alive(self.pid) {
            return;
        }
        debug!(pid = self.pid, label = %self.label, "stopping leftover process group");
        signal_group(self.pid, Signal::SIGTERM);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !group_alive(self.pid) {
                return;
            }
            thread::sleep(WAIT_POLL);
        }
        warn!(pid = self.pid, "process group ignored termination request, killing");
        signal_group(self.pid, Signal::SIGKILL);
    }

    #[cfg(not(unix))]
    fn stop_group(&self, _grace: Duration) {}

    #[cfg(unix)]
    fn signal_terminate(&self) {
        signal_group(self.pid, nix::sys::signal::Signal::SIGTERM);
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) {
        if let Err(err) = lock(&self.child).kill() {
            debug!(pid = self.pid, err = %err, "terminate request failed");
        }
    }

    fn record_exit(&self, status: ExitStatus) {
        if self.exit.set(status).is_ok() {
            debug!(pid = self.pid, exit_code = ?status.code(), "process exited");
            if let Some(registry) = self.registry.upgrade() {
                registry.deregister(self.pid);
            }
        }
    }
}

/// Send `signal` to the process group led by `pid`. Missing groups are ignored.
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => debug!(pid, ?signal, err = %err, "failed to signal process group"),
    }
}

/// Whether any process is left in the group led by `pid`.
#[cfg(unix)]
fn group_alive(pid: u32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    killpg(Pid::from_raw(raw), None).is_ok()
}

/// Live processes started by the supervisor.
///
/// Written from the control loop (spawn, reap) and from the signal thread
/// (sweep), hence the mutex.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    live: Mutex<Vec<Arc<ProcessHandle>>>,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawn `cmd` with stdin closed and stderr merged into stdout, and register it.
    ///
    /// On unix the child leads its own process group so termination reaches
    /// anything it forks.
    #[instrument(skip_all, fields(label = label))]
    pub fn spawn(self: &Arc<Self>, mut cmd: Command, label: &str) -> Result<Arc<ProcessHandle>> {
        let (reader, writer) = std::io::pipe().context("create output pipe")?;
        let stderr_writer = writer.try_clone().context("clone output pipe")?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr_writer));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        debug!("spawning child process");
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).with_context(|| format!("spawn {label}"));
            }
        };
        // The command still owns the parent's copies of the pipe writer; the
        // reader only sees EOF once they are gone.
        drop(cmd);

        let handle = Arc::new(ProcessHandle {
            pid: child.id(),
            label: label.to_string(),
            child: Mutex::new(child),
            output: Mutex::new(Some(reader)),
            exit: OnceLock::new(),
            registry: Arc::downgrade(self),
        });
        lock(&self.live).push(Arc::clone(&handle));
        info!(pid = handle.pid, "process started");
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        lock(&self.live).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, pid: u32) -> bool {
        lock(&self.live).iter().any(|handle| handle.pid == pid)
    }

    /// Terminate every registered process in registration order.
    ///
    /// Best effort: failures are logged and the sweep continues.
    pub fn terminate_all(&self, grace: Duration) {
        let snapshot: Vec<Arc<ProcessHandle>> = lock(&self.live).clone();
        for handle in snapshot {
            if !handle.is_alive() {
                continue;
            }
            eprintln!("Killing process {}...", handle.pid);
            if let Err(err) = handle.terminate(grace) {
                error!(pid = handle.pid, err = %format!("{err:#}"), "failed to kill process");
            }
        }
        lock(&self.live).retain(|handle| handle.exit.get().is_none());
    }

    fn deregister(&self, pid: u32) {
        lock(&self.live).retain(|handle| handle.pid != pid);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Captured output of a short-lived helper command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
