//! SVM pipeline: turns one trace into new test cases.
//!
//! ```text
//! Start → NextTrace → Prepare → ExecuteConcolic → ExecuteSymbolic
//!       → StoreTests → Finished → NextTrace …
//! ```
//!
//! Each trace gets a private directory named by its id. `Prepare` unpacks
//! the capture there and runs the translator; both engine runs use it as
//! their working directory. A failed symbolic run still yields whatever
//! tests it wrote before failing, carried in [`PipelineError::Symbolic`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conclave_store::{archive, NodeLayout};
use conclave_types::{Mode, SvmOptions, TestCase, Trace};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::process::{run_to_completion, ProcessSpec};
use crate::region::{Fault, Liveness, Recovery};
use crate::task::{TaskPoll, TaskSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvmState {
    Start,
    /// Waiting for the node to feed a trace.
    NextTrace,
    Prepare,
    ExecuteConcolic,
    ExecuteSymbolic,
    StoreTests,
    Finished,
}

impl fmt::Display for SvmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start           => write!(f, "Start"),
            Self::NextTrace       => write!(f, "NextTrace"),
            Self::Prepare         => write!(f, "Prepare"),
            Self::ExecuteConcolic => write!(f, "ExecuteConcolic"),
            Self::ExecuteSymbolic => write!(f, "ExecuteSymbolic"),
            Self::StoreTests      => write!(f, "StoreTests"),
            Self::Finished        => write!(f, "Finished"),
        }
    }
}

#[derive(Debug)]
enum SvmStep {
    Ready,
    Prepared,
    ConcolicDone,
    SymbolicDone,
    Harvested(Vec<TestCase>),
}

#[derive(Debug, Clone)]
pub struct SvmContext {
    pub slot: usize,
    pub mode: Mode,
    pub options: SvmOptions,
    pub layout: NodeLayout,
}

#[derive(Debug)]
pub struct SvmPipeline {
    ctx: SvmContext,
    state: SvmState,
    liveness: Liveness,
    fault: Fault,
    task: TaskSlot<SvmStep>,
    pending_trace: Option<Trace>,
    /// Id of the trace in flight; names its private directory.
    current: Option<Uuid>,
    tests: Vec<TestCase>,
    /// Raised on terminate so an in-flight engine run is killed promptly.
    cancel: Arc<AtomicBool>,
}

impl SvmPipeline {
    pub fn new(ctx: SvmContext) -> Self {
        Self {
            ctx,
            state: SvmState::Start,
            liveness: Liveness::Active,
            fault: Fault::Valid,
            task: TaskSlot::default(),
            pending_trace: None,
            current: None,
            tests: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn context(&self) -> &SvmContext {
        &self.ctx
    }

    pub fn slot(&self) -> usize {
        self.ctx.slot
    }

    pub fn state(&self) -> SvmState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.liveness == Liveness::Terminated
    }

    pub fn is_error(&self) -> bool {
        self.fault.is_error()
    }

    pub fn recovery(&self) -> Recovery {
        Recovery::for_mode(self.ctx.mode)
    }

    pub fn wants_trace(&self) -> bool {
        !self.is_terminated()
            && !self.is_error()
            && self.state == SvmState::NextTrace
            && self.pending_trace.is_none()
    }

    pub fn feed_trace(&mut self, trace: Trace) -> Result<()> {
        if !self.wants_trace() {
            return Err(PipelineError::InvalidTransition {
                from: self.state.to_string(),
                to: "accepting a trace".into(),
            });
        }
        self.pending_trace = Some(trace);
        Ok(())
    }

    pub fn take_tests(&mut self) -> Vec<TestCase> {
        std::mem::take(&mut self.tests)
    }

    pub fn take_error(&mut self) -> Option<PipelineError> {
        self.fault.take()
    }

    /// Kill any running engine and stop ticking. Terminal.
    pub fn terminate(&mut self) {
        if self.is_terminated() {
            return;
        }
        self.liveness = Liveness::Terminated;
        self.cancel.store(true, Ordering::SeqCst);
        self.task.clear();
        // A failed slot already made its choice about the trace directory.
        if !self.is_error() {
            if let Some(dir) = self.current_dir() {
                if let Err(e) = remove_dir_if_exists(&dir) {
                    warn!(slot = self.ctx.slot, error = %e, "failed to remove trace directory");
                }
            }
            self.current = None;
        }
        info!(slot = self.ctx.slot, state = %self.state, "svm pipeline terminated");
    }

    /// Advance by at most one transition. Same contract as
    /// [`VmPipeline::tick`](crate::vm::VmPipeline::tick).
    pub fn tick(&mut self) -> bool {
        if self.is_terminated() || self.is_error() {
            return false;
        }
        match self.step() {
            Ok(active) => active,
            Err(err) => {
                self.fail(err);
                false
            }
        }
    }

    fn fail(&mut self, err: PipelineError) {
        error!(slot = self.ctx.slot, state = %self.state, error = %err, "svm pipeline failed");
        self.task.clear();
        // A replaced pipeline drops its trace; keep the directory only when
        // the slot is left for inspection.
        if self.recovery() == Recovery::Replace {
            if let Some(dir) = self.current_dir() {
                if let Err(e) = remove_dir_if_exists(&dir) {
                    warn!(slot = self.ctx.slot, error = %e, "failed to remove trace directory");
                }
            }
        }
        self.fault = Fault::Error(Some(err));
    }

    fn transition(&mut self, to: SvmState) {
        debug!(slot = self.ctx.slot, from = %self.state, to = %to, "svm pipeline transition");
        self.state = to;
    }

    fn unexpected(&self, step: SvmStep) -> PipelineError {
        PipelineError::Invariant(format!(
            "svm slot {}: step {step:?} completed in state {}",
            self.ctx.slot, self.state
        ))
    }

    fn current_dir(&self) -> Option<PathBuf> {
        self.current.map(|id| self.ctx.layout.trace_dir(id))
    }

    fn require_current_dir(&self) -> Result<PathBuf> {
        self.current_dir().ok_or_else(|| {
            PipelineError::Invariant(format!("svm slot {} has no trace in {}", self.ctx.slot, self.state))
        })
    }

    fn step(&mut self) -> Result<bool> {
        match self.state {
            SvmState::Start => self.step_start(),
            SvmState::NextTrace => {
                if self.pending_trace.is_some() {
                    self.transition(SvmState::Prepare);
                    return Ok(true);
                }
                Ok(false)
            }
            SvmState::Prepare => self.step_prepare(),
            SvmState::ExecuteConcolic => self.step_concolic(),
            SvmState::ExecuteSymbolic => self.step_symbolic(),
            SvmState::StoreTests => self.step_store_tests(),
            SvmState::Finished => {
                if self.tests.is_empty() {
                    self.transition(SvmState::NextTrace);
                }
                Ok(true)
            }
        }
    }

    // ── Steps ────────────────────────────────────────────────────────────

    fn step_start(&mut self) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle => {
                let staging = self.ctx.layout.staging_dir();
                self.task.start(move || {
                    fs::create_dir_all(&staging)?;
                    Ok(SvmStep::Ready)
                })?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(SvmStep::Ready) => self.transition(SvmState::NextTrace),
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    fn step_prepare(&mut self) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle => {
                let trace = self.pending_trace.take().ok_or_else(|| {
                    PipelineError::Invariant("entered Prepare without a trace".into())
                })?;
                let id = trace.id();
                self.current = Some(id);
                info!(slot = self.ctx.slot, trace_id = %id, "preparing trace");

                let dir = self.ctx.layout.trace_dir(id);
                let staging = self.ctx.layout.staging_dir();
                let options = self.ctx.options.clone();
                let cancel = Arc::clone(&self.cancel);
                self.task.start(move || {
                    archive::unpack(&trace.data, &staging, &id.to_string(), &dir)?;
                    let spec = ProcessSpec::new(&options.translator)
                        .args(options.translator_args.iter().cloned())
                        .current_dir(&dir)
                        .log_file(dir.join("translate.log"));
                    let done = run_to_completion(&spec, None, &cancel)?;
                    if !done.success() {
                        return Err(PipelineError::Translation(done.describe()));
                    }
                    if !dir.join(&options.translated_unit).exists() {
                        return Err(PipelineError::Translation(format!(
                            "translator produced no {}",
                            options.translated_unit
                        )));
                    }
                    Ok(SvmStep::Prepared)
                })?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(SvmStep::Prepared) => self.transition(SvmState::ExecuteConcolic),
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    fn step_concolic(&mut self) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle => {
                let spec = self.engine_spec(&self.ctx.options.concolic_args, "concolic.log")?;
                let cancel = Arc::clone(&self.cancel);
                self.task.start(move || {
                    let done = run_to_completion(&spec, None, &cancel)?;
                    if !done.success() {
                        return Err(PipelineError::Concolic(done.describe()));
                    }
                    Ok(SvmStep::ConcolicDone)
                })?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(SvmStep::ConcolicDone) => self.transition(SvmState::ExecuteSymbolic),
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    fn step_symbolic(&mut self) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle => {
                let spec = self.engine_spec(&self.ctx.options.symbolic_args, "symbolic.log")?;
                let test_dir = self.require_current_dir()?.join(&self.ctx.options.test_dir);
                let timeout = match self.ctx.options.symbolic_timeout_secs {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                };
                let cancel = Arc::clone(&self.cancel);
                self.task.start(move || {
                    let done = run_to_completion(&spec, timeout, &cancel)?;
                    if done.success() {
                        return Ok(SvmStep::SymbolicDone);
                    }
                    let salvaged = harvest_tests(&test_dir).unwrap_or_else(|e| {
                        warn!(error = %e, "could not salvage tests from failed symbolic run");
                        Vec::new()
                    });
                    Err(PipelineError::Symbolic { log: done.describe(), salvaged })
                })?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(SvmStep::SymbolicDone) => self.transition(SvmState::StoreTests),
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    fn step_store_tests(&mut self) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle => {
                let dir = self.require_current_dir()?;
                let test_dir = dir.join(&self.ctx.options.test_dir);
                self.task.start(move || {
                    let tests = harvest_tests(&test_dir)?;
                    fs::remove_dir_all(&dir)?;
                    Ok(SvmStep::Harvested(tests))
                })?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(SvmStep::Harvested(tests)) => {
                info!(
                    slot = self.ctx.slot,
                    trace_id = ?self.current,
                    tests = tests.len(),
                    "tests harvested"
                );
                self.tests = tests;
                self.current = None;
                self.transition(SvmState::Finished);
            }
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    fn engine_spec(&self, args: &[String], log: &str) -> Result<ProcessSpec> {
        let dir = self.require_current_dir()?;
        Ok(ProcessSpec::new(&self.ctx.options.symbolic)
            .args(args.iter().cloned())
            .log_file(dir.join(log))
            .current_dir(dir))
    }
}

/// Read every `*.test` file in `dir`, in file-name order. A missing
/// directory yields no tests.
pub fn harvest_tests(dir: &Path) -> Result<Vec<TestCase>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "test") {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .iter()
        .map(|p| TestCase::read_from_file(p).map_err(PipelineError::from))
        .collect()
}

fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
