//! Worker output consumption on a dedicated reader thread.

use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::stream_text::resolve_fragment;
use crate::io::iteration_log::IterationLog;

/// How output is consumed for one iteration.
#[derive(Debug)]
pub enum CollectMode {
    /// Accumulate the raw stream; shown once the iteration ends.
    Buffered,
    /// Resolve each line to its text fragment as it arrives; non-JSON lines
    /// pass through verbatim. Fragments go to the log and to stderr.
    Incremental(IterationLog),
}

/// Result of [`OutputCollector::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedOutput {
    pub text: String,
    /// `false` when the reader was still running after the bounded wait.
    pub drained: bool,
}

pub struct OutputCollector {
    buffer: Arc<Mutex<String>>,
    done_rx: Receiver<()>,
}

impl OutputCollector {
    pub fn start<R>(reader: R, mode: CollectMode) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(String::new()));
        let (done_tx, done_rx) = mpsc::channel();
        let shared = Arc::clone(&buffer);

        thread::Builder::new()
            .name("ralph-output".to_string())
            .spawn(move || {
                let result = match mode {
                    CollectMode::Buffered => read_buffered(reader, &shared),
                    CollectMode::Incremental(log) => read_incremental(reader, &shared, log),
                };
                if let Err(err) = result {
                    warn!(err = %format!("{err:#}"), "worker output reader failed");
                }
                let _ = done_tx.send(());
            })
            .context("spawn output reader")?;

        Ok(Self { buffer, done_rx })
    }

    /// Wait up to `wait` for the reader to reach end of stream, then return
    /// whatever was collected. A reader still blocked after the wait is
    /// abandoned; it ends by itself once the pipe closes.
    pub fn finish(self, wait: Duration) -> CollectedOutput {
        let drained = match self.done_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => {
                debug!(?wait, "output reader did not finish in time");
                false
            }
        };
        CollectedOutput {
            text: lock(&self.buffer).clone(),
            drained,
        }
    }
}

fn read_buffered<R: Read>(reader: R, buffer: &Mutex<String>) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut chunk = Vec::new();
    loop {
        chunk.clear();
        let read = reader
            .read_until(b'\n', &mut chunk)
            .context("read worker output")?;
        if read == 0 {
            return Ok(());
        }
        lock(buffer).push_str(&String::from_utf8_lossy(&chunk));
    }
}

fn read_incremental<R: Read>(
    reader: R,
    buffer: &Mutex<String>,
    mut log: IterationLog,
) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut chunk = Vec::new();
    loop {
        chunk.clear();
        let read = reader
            .read_until(b'\n', &mut chunk)
            .context("read worker output")?;
        if read == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&chunk);
        let fragment = resolve_fragment(&line);
        lock(buffer).push_str(&fragment);
        if let Err(err) = log.append(&fragment) {
            warn!(err = %format!("{err:#}"), "failed to write iteration log");
        }
        eprint!("{fragment}");
    }
}

fn lock(buffer: &Mutex<String>) -> std::sync::MutexGuard<'_, String> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}
