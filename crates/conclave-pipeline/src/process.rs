//! Supervision of external worker processes.
//!
//! Long-lived workers (the VM) are held as a [`WorkerProcess`] and observed
//! by polling. Run-to-completion workers (translator, symbolic engine) go
//! through [`run_to_completion`], which is only ever called from inside an
//! [`AsyncTask`](crate::task::AsyncTask).

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const LOG_TAIL_BYTES: u64 = 2048;

// ── ProcessSpec ───────────────────────────────────────────────────────────────

/// How to launch a worker.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    log: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            log: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Send stdout and stderr to `path` (truncated on launch).
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log = Some(path.into());
        self
    }

    fn command(&self) -> Result<Command> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        match &self.log {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let out = File::create(path)?;
                let err = out.try_clone()?;
                command.stdout(out).stderr(err);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        Ok(command)
    }
}

// ── WorkerProcess ─────────────────────────────────────────────────────────────

/// A running worker. Killed when dropped.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    program: String,
    log: Option<PathBuf>,
    status: Option<ExitStatus>,
}

impl WorkerProcess {
    pub fn spawn(spec: &ProcessSpec) -> Result<Self> {
        let program = spec.program.display().to_string();
        let child = spec
            .command()?
            .spawn()
            .map_err(|source| PipelineError::Spawn { program: program.clone(), source })?;

        info!(pid = child.id(), program = %program, "spawned worker process");
        Ok(Self {
            child,
            program,
            log: spec.log.clone(),
            status: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Non-blocking liveness check.
    pub fn is_running(&mut self) -> Result<bool> {
        if self.status.is_some() {
            return Ok(false);
        }
        self.status = self.child.try_wait()?;
        Ok(self.status.is_none())
    }

    /// Exit status, once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Tail of the worker's log for diagnostics.
    pub fn log_tail(&self) -> String {
        self.log.as_deref().map(log_tail).unwrap_or_default()
    }

    /// Kill the process (if still running) and reap it.
    pub fn terminate(&mut self) {
        if self.status.is_some() {
            return;
        }
        if let Err(err) = self.child.kill() {
            debug!(?err, pid = self.child.id(), "kill failed, process already gone");
        }
        match self.child.wait() {
            Ok(status) => {
                info!(pid = self.child.id(), %status, program = %self.program, "worker terminated");
                self.status = Some(status);
            }
            Err(err) => warn!(?err, pid = self.child.id(), "failed to reap worker process"),
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

// ── Run to completion ─────────────────────────────────────────────────────────

/// How a run-to-completion worker ended.
#[derive(Debug)]
pub struct Completion {
    /// `None` if the process was killed before exiting on its own.
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub log: String,
}

impl Completion {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }

    /// Short human-readable summary of a failed run.
    pub fn describe(&self) -> String {
        let how = if self.cancelled {
            "cancelled".to_string()
        } else if self.timed_out {
            "timed out".to_string()
        } else {
            match self.status {
                Some(status) => format!("exited with {status}"),
                None => "did not exit".to_string(),
            }
        };
        if self.log.is_empty() {
            how
        } else {
            format!("{how}: {}", self.log.trim_end())
        }
    }
}

/// Launch a worker and poll it until it exits, `timeout` elapses, or
/// `cancel` is raised. Blocks the calling thread.
pub fn run_to_completion(
    spec: &ProcessSpec,
    timeout: Option<Duration>,
    cancel: &AtomicBool,
) -> Result<Completion> {
    let mut process = WorkerProcess::spawn(spec)?;
    let deadline = timeout.map(|t| Instant::now() + t);

    let (timed_out, cancelled) = loop {
        if !process.is_running()? {
            break (false, false);
        }
        if cancel.load(Ordering::SeqCst) {
            break (false, true);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!(program = %process.program(), "worker timed out");
            break (true, false);
        }
        thread::sleep(POLL_INTERVAL);
    };

    let status = process.exit_status();
    if status.is_none() {
        process.terminate();
    }
    Ok(Completion {
        status,
        timed_out,
        cancelled,
        log: process.log_tail(),
    })
}

/// Last few KiB of a log file, lossily decoded. Empty if unreadable.
pub fn log_tail(path: &Path) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if file.seek(SeekFrom::Start(len.saturating_sub(LOG_TAIL_BYTES))).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
