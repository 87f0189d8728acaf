//! VM pipeline: supervises one instrumented VM process through
//! image provisioning, handshake and repeated test runs.
//!
//! ```text
//! Start → ValidateImage ─[stale]→ UpdateImage → StartVm → ConnectVm
//!                       └[valid]──────────────→ ┘
//! ConnectVm → RxGuestData (slot 0) → NextTest
//!           → NextTest (other slots)
//! NextTest → Testing → StoreTrace → Finished → NextTest …
//! ```
//!
//! Every step that touches the filesystem or launches a process runs as an
//! [`AsyncTask`](crate::task::AsyncTask); `tick` only polls. A tick performs
//! at most one transition.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use conclave_store::{archive, image, ImageStore, SlotLayout};
use conclave_types::{Mode, RunConfig, TestCase, Trace, VmOptions};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::process::{ProcessSpec, WorkerProcess};
use crate::region::{Fault, Liveness, Recovery};
use crate::task::{TaskPoll, TaskSlot};

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Start,
    ValidateImage,
    UpdateImage,
    StartVm,
    ConnectVm,
    /// First slot only: read the target's declared inputs from the guest.
    RxGuestData,
    /// Waiting for the node to feed a test case.
    NextTest,
    Testing,
    StoreTrace,
    Finished,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start         => write!(f, "Start"),
            Self::ValidateImage => write!(f, "ValidateImage"),
            Self::UpdateImage   => write!(f, "UpdateImage"),
            Self::StartVm       => write!(f, "StartVM"),
            Self::ConnectVm     => write!(f, "ConnectVM"),
            Self::RxGuestData   => write!(f, "RxGuestData"),
            Self::NextTest      => write!(f, "NextTest"),
            Self::Testing       => write!(f, "Testing"),
            Self::StoreTrace    => write!(f, "StoreTrace"),
            Self::Finished      => write!(f, "Finished"),
        }
    }
}

/// Output of a VM pipeline background step.
#[derive(Debug)]
enum VmStep {
    Prepared,
    ImageChecked { stale: bool },
    ImageUpdated,
    Launched(WorkerProcess),
    Connected,
    GuestData(Option<TestCase>),
    Injected,
    TraceStored(Trace),
}

// ── Context ───────────────────────────────────────────────────────────────────

/// Everything a VM pipeline needs to rebuild itself from scratch.
#[derive(Debug, Clone)]
pub struct VmContext {
    pub slot: usize,
    pub mode: Mode,
    pub options: VmOptions,
    pub layout: SlotLayout,
}

/// Node-owned state a VM pipeline reads while ticking.
#[derive(Debug, Clone, Copy)]
pub struct VmEnv<'a> {
    pub image: &'a ImageStore,
    pub run_config: Option<&'a RunConfig>,
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct VmPipeline {
    ctx: VmContext,
    state: VmState,
    liveness: Liveness,
    fault: Fault,
    task: TaskSlot<VmStep>,
    process: Option<WorkerProcess>,
    /// Handshake or test-run deadline for the current state.
    deadline: Option<Instant>,
    /// `Testing`: the run marker has been written.
    injected: bool,
    pending_test: Option<TestCase>,
    trace: Option<Trace>,
    guest_seed: Option<TestCase>,
}

impl VmPipeline {
    pub fn new(ctx: VmContext) -> Self {
        Self {
            ctx,
            state: VmState::Start,
            liveness: Liveness::Active,
            fault: Fault::Valid,
            task: TaskSlot::default(),
            process: None,
            deadline: None,
            injected: false,
            pending_test: None,
            trace: None,
            guest_seed: None,
        }
    }

    pub fn context(&self) -> &VmContext {
        &self.ctx
    }

    pub fn slot(&self) -> usize {
        self.ctx.slot
    }

    pub fn state(&self) -> VmState {
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

    /// Idle in `NextTest` with nothing fed yet.
    pub fn wants_test(&self) -> bool {
        !self.is_terminated()
            && !self.is_error()
            && self.state == VmState::NextTest
            && self.pending_test.is_none()
    }

    pub fn feed_test(&mut self, test: TestCase) -> Result<()> {
        if !self.wants_test() {
            return Err(PipelineError::InvalidTransition {
                from: self.state.to_string(),
                to: "accepting a test case".into(),
            });
        }
        self.pending_test = Some(test);
        Ok(())
    }

    pub fn take_trace(&mut self) -> Option<Trace> {
        self.trace.take()
    }

    /// Initial test case extracted from the guest's declared inputs.
    pub fn take_guest_seed(&mut self) -> Option<TestCase> {
        self.guest_seed.take()
    }

    pub fn take_error(&mut self) -> Option<PipelineError> {
        self.fault.take()
    }

    /// Kill the VM and stop ticking. Terminal.
    pub fn terminate(&mut self) {
        if self.is_terminated() {
            return;
        }
        self.liveness = Liveness::Terminated;
        self.task.clear();
        if let Some(process) = self.process.as_mut() {
            process.terminate();
        }
        self.process = None;
        info!(slot = self.ctx.slot, state = %self.state, "vm pipeline terminated");
    }

    /// Advance by at most one transition. Returns `true` while the pipeline
    /// is doing work or waiting on its VM, `false` when it is idle waiting
    /// for input, terminated, or failed.
    pub fn tick(&mut self, env: &VmEnv<'_>) -> bool {
        if self.is_terminated() || self.is_error() {
            return false;
        }
        match self.step(env) {
            Ok(active) => active,
            Err(err) => {
                self.fail(err);
                false
            }
        }
    }

    fn fail(&mut self, err: PipelineError) {
        error!(slot = self.ctx.slot, state = %self.state, error = %err, "vm pipeline failed");
        self.task.clear();
        self.fault = Fault::Error(Some(err));
    }

    fn transition(&mut self, to: VmState) {
        debug!(slot = self.ctx.slot, from = %self.state, to = %to, "vm pipeline transition");
        self.state = to;
        self.deadline = None;
        self.injected = false;
    }

    fn unexpected(&self, step: VmStep) -> PipelineError {
        PipelineError::Invariant(format!(
            "vm slot {}: step {step:?} completed in state {}",
            self.ctx.slot, self.state
        ))
    }

    fn step(&mut self, env: &VmEnv<'_>) -> Result<bool> {
        match self.state {
            VmState::Start => self.step_start(),
            VmState::ValidateImage => self.step_validate_image(env),
            VmState::UpdateImage => self.step_update_image(env),
            VmState::StartVm => self.step_start_vm(env),
            VmState::ConnectVm => self.step_connect(),
            VmState::RxGuestData => self.step_guest_data(env),
            VmState::NextTest => {
                if self.pending_test.is_some() {
                    self.transition(VmState::Testing);
                    return Ok(true);
                }
                self.ensure_alive("while idle")?;
                Ok(false)
            }
            VmState::Testing => self.step_testing(),
            VmState::StoreTrace => self.step_store_trace(),
            VmState::Finished => {
                if self.trace.is_none() {
                    self.transition(VmState::NextTest);
                }
                Ok(true)
            }
        }
    }

    // ── Steps ────────────────────────────────────────────────────────────

    fn step_start(&mut self) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle => {
                let layout = self.ctx.layout.clone();
                self.task.start(move || {
                    layout.create()?;
                    Ok(VmStep::Prepared)
                })?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(VmStep::Prepared) => self.transition(VmState::ValidateImage),
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    fn step_validate_image(&mut self, env: &VmEnv<'_>) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle => {
                let target = env.image.target_info().cloned();
                let info_file = self.ctx.layout.image_info_file();
                self.task.start(move || {
                    // No image announced or stored: launch with whatever the
                    // VM options provide.
                    let Some(target) = target else {
                        return Ok(VmStep::ImageChecked { stale: false });
                    };
                    let current = image::read_info(&info_file)?;
                    Ok(VmStep::ImageChecked { stale: current.as_ref() != Some(&target) })
                })?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(VmStep::ImageChecked { stale }) => {
                if stale {
                    info!(slot = self.ctx.slot, "slot image is stale");
                    self.transition(VmState::UpdateImage);
                } else {
                    self.transition(VmState::StartVm);
                }
            }
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    fn step_update_image(&mut self, env: &VmEnv<'_>) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle => {
                // Wait for the dispatcher to push the announced image.
                if !env.image.is_ready() {
                    return Ok(false);
                }
                let archive_path = env.image.archive_path();
                let info = env.image.stored_info().cloned();
                let layout = self.ctx.layout.clone();
                self.task.start(move || {
                    archive::unpack_file(
                        &archive_path,
                        &layout.staging_dir(),
                        "image",
                        &layout.image_dir(),
                    )?;
                    if let Some(info) = &info {
                        image::write_info(&layout.image_info_file(), info)?;
                    }
                    Ok(VmStep::ImageUpdated)
                })?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(VmStep::ImageUpdated) => {
                info!(slot = self.ctx.slot, "slot image refreshed");
                self.transition(VmState::StartVm);
            }
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    fn step_start_vm(&mut self, env: &VmEnv<'_>) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle => {
                let layout = self.ctx.layout.clone();
                let options = self.ctx.options.clone();
                let run_config = env.run_config.cloned();
                let needs_disk = env.image.target_info().is_some();
                self.task.start(move || {
                    for marker in [
                        layout.ready_marker(),
                        layout.run_marker(),
                        layout.finished_marker(),
                        layout.guest_config_file(),
                    ] {
                        remove_if_exists(&marker)?;
                    }
                    if let Some(config) = &run_config {
                        config.save(&layout.run_config_file())?;
                    }

                    let mut spec = ProcessSpec::new(&options.executable)
                        .args(options.args.iter().cloned())
                        .current_dir(layout.root())
                        .log_file(layout.vm_log());
                    let disk = layout.image_dir().join(&options.image_file);
                    if disk.exists() {
                        spec = spec.arg("-hda").arg(disk.display().to_string());
                    } else if needs_disk {
                        return Err(PipelineError::MissingArtifact(disk));
                    }
                    if !options.snapshot.is_empty() {
                        spec = spec.arg("-loadvm").arg(&options.snapshot);
                    }
                    Ok(VmStep::Launched(WorkerProcess::spawn(&spec)?))
                })?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(VmStep::Launched(process)) => {
                info!(slot = self.ctx.slot, pid = process.id(), "vm launched");
                self.process = Some(process);
                self.transition(VmState::ConnectVm);
                self.deadline = timeout_from(self.ctx.options.handshake_timeout_secs);
            }
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    fn step_connect(&mut self) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle => {
                let ready = self.ctx.layout.ready_marker();
                if ready.exists() {
                    self.task.start(move || {
                        fs::remove_file(&ready)?;
                        Ok(VmStep::Connected)
                    })?;
                    return Ok(true);
                }
                self.ensure_alive("before the handshake")?;
                self.ensure_before_deadline("vm handshake")?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(VmStep::Connected) => {
                info!(slot = self.ctx.slot, "vm handshake complete");
                if self.ctx.slot == 0 {
                    self.transition(VmState::RxGuestData);
                } else {
                    self.transition(VmState::NextTest);
                }
            }
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    fn step_guest_data(&mut self, env: &VmEnv<'_>) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle => {
                let guest = self.ctx.layout.guest_config_file();
                let pushed = env.run_config.cloned();
                self.task.start(move || {
                    let config = if guest.exists() {
                        Some(RunConfig::load(&guest)?)
                    } else {
                        pushed
                    };
                    let seed = config
                        .map(|c| c.initial_test_case())
                        .filter(|t| !t.elements.is_empty());
                    Ok(VmStep::GuestData(seed))
                })?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(VmStep::GuestData(seed)) => {
                if let Some(seed) = &seed {
                    info!(slot = self.ctx.slot, elements = seed.elements.len(), "guest inputs received");
                }
                self.guest_seed = seed;
                self.transition(VmState::NextTest);
            }
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    fn step_testing(&mut self) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle if !self.injected => {
                let test = self.pending_test.take().ok_or_else(|| {
                    PipelineError::Invariant("entered Testing without a test case".into())
                })?;
                let layout = self.ctx.layout.clone();
                self.task.start(move || {
                    remove_if_exists(&layout.finished_marker())?;
                    reset_dir(&layout.trace_dir())?;
                    test.write_to_file(&layout.test_case_file())?;
                    fs::write(layout.run_marker(), b"")?;
                    Ok(VmStep::Injected)
                })?;
            }
            TaskPoll::Idle => {
                let finished = self.ctx.layout.finished_marker();
                if finished.exists() {
                    self.transition(VmState::StoreTrace);
                    return Ok(true);
                }
                if !self.process_running()? {
                    // The VM may have written the marker just before exiting.
                    if finished.exists() {
                        self.transition(VmState::StoreTrace);
                        return Ok(true);
                    }
                    return Err(self.died("mid-test"));
                }
                self.ensure_before_deadline("test run")?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(VmStep::Injected) => {
                debug!(slot = self.ctx.slot, "test injected");
                self.injected = true;
                self.deadline = timeout_from(self.ctx.options.test_timeout_secs);
            }
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    fn step_store_trace(&mut self) -> Result<bool> {
        match self.task.poll()? {
            TaskPoll::Idle => {
                let layout = self.ctx.layout.clone();
                self.task.start(move || {
                    remove_if_exists(&layout.finished_marker())?;
                    let id = Uuid::new_v4();
                    let data =
                        archive::pack(&layout.trace_dir(), &layout.staging_dir(), &id.to_string())?;
                    fs::create_dir_all(layout.trace_dir())?;
                    Ok(VmStep::TraceStored(Trace::with_id(id, data)))
                })?;
            }
            TaskPoll::Pending => {}
            TaskPoll::Ready(VmStep::TraceStored(trace)) => {
                info!(slot = self.ctx.slot, trace_id = %trace.id(), bytes = trace.size(), "trace stored");
                self.trace = Some(trace);
                self.transition(VmState::Finished);
            }
            TaskPoll::Ready(other) => return Err(self.unexpected(other)),
        }
        Ok(true)
    }

    // ── Guards ───────────────────────────────────────────────────────────

    fn process_running(&mut self) -> Result<bool> {
        match self.process.as_mut() {
            Some(process) => process.is_running(),
            None => Err(PipelineError::Invariant(format!(
                "vm slot {} has no process in state {}",
                self.ctx.slot, self.state
            ))),
        }
    }

    fn ensure_alive(&mut self, when: &str) -> Result<()> {
        if self.process_running()? {
            Ok(())
        } else {
            Err(self.died(when))
        }
    }

    fn died(&self, when: &str) -> PipelineError {
        let (status, log) = match &self.process {
            Some(p) => (
                p.exit_status().map(|s| s.to_string()).unwrap_or_else(|| "unknown status".into()),
                p.log_tail(),
            ),
            None => ("no process".into(), String::new()),
        };
        PipelineError::WorkerDied(format!(
            "vm slot {} exited {when} ({status}): {}",
            self.ctx.slot,
            log.trim_end()
        ))
    }

    fn ensure_before_deadline(&self, what: &str) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(PipelineError::Timeout(format!(
                "vm slot {}: {what}",
                self.ctx.slot
            ))),
            _ => Ok(()),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Zero disables the timeout.
fn timeout_from(secs: u64) -> Option<Instant> {
    (secs > 0).then(|| Instant::now() + Duration::from_secs(secs))
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn reset_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    fs::create_dir_all(path)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
