//! VM node: a pool of VM pipelines fed from the test queue.

use std::sync::Mutex;

use conclave_store::{ImageStore, NodeLayout, StagedImage};
use conclave_types::{
    ImageInfo, Mode, NodeError, NodeKind, NodeOptions, NodeStatus, OSImage, RunConfig, TestCase,
    Trace,
};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::node::{byte_cap, lock, record_failure, Node};
use crate::queue::Queues;
use crate::region::Recovery;
use crate::vm::{VmContext, VmEnv, VmPipeline};

pub struct VmNode {
    inner: Mutex<VmInner>,
}

struct VmInner {
    options: NodeOptions,
    layout: NodeLayout,
    image: ImageStore,
    run_config: Option<RunConfig>,
    pipelines: Vec<VmPipeline>,
    queues: Queues,
    node_id: u64,
    commenced: bool,
    active: bool,
    /// The dispatcher pushed tests for the current target.
    dispatcher_seeded: bool,
    /// The guest's initial test case was already queued.
    guest_seeded: bool,
    target: Option<String>,
}

impl VmNode {
    /// Build the node and its pipeline pool. Developer-mode nodes commence
    /// immediately.
    pub fn new(options: NodeOptions) -> Result<Self> {
        if options.vm.slots == 0 {
            return Err(PipelineError::Invariant("vm node configured with zero slots".into()));
        }
        let layout = NodeLayout::new(&options.work_dir);
        layout.create()?;
        let image = ImageStore::open(layout.image_dir())?;

        let config_file = layout.run_config_file();
        let run_config = if config_file.exists() {
            Some(RunConfig::load(&config_file)?)
        } else {
            None
        };

        let pipelines = build_pool(&options, &layout);
        let commenced = options.mode == Mode::Developer;
        info!(slots = pipelines.len(), mode = ?options.mode, work_dir = %layout.root().display(), "vm node created");

        Ok(Self {
            inner: Mutex::new(VmInner {
                options,
                layout,
                image,
                run_config,
                pipelines,
                queues: Queues::default(),
                node_id: 0,
                commenced,
                active: false,
                dispatcher_seeded: false,
                guest_seeded: false,
                target: None,
            }),
        })
    }
}

fn build_pool(options: &NodeOptions, layout: &NodeLayout) -> Vec<VmPipeline> {
    (0..options.vm.slots as usize)
        .map(|slot| {
            VmPipeline::new(VmContext {
                slot,
                mode: options.mode,
                options: options.vm.clone(),
                layout: layout.slot(slot),
            })
        })
        .collect()
}

impl Node for VmNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Vm
    }

    fn poll(&self) -> Result<bool> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        if !inner.commenced {
            inner.active = false;
            return Ok(false);
        }
        let slots = inner.options.vm.slots as usize;
        if inner.pipelines.len() != slots {
            return Err(PipelineError::Invariant(format!(
                "vm node has {} pipelines for {slots} slots",
                inner.pipelines.len()
            )));
        }

        let env = VmEnv {
            image: &inner.image,
            run_config: inner.run_config.as_ref(),
        };
        let error_log = inner.layout.error_log();
        let mut active = false;

        for pipeline in inner.pipelines.iter_mut() {
            if pipeline.is_terminated() {
                continue;
            }
            let mut idle = false;
            if pipeline.wants_test() {
                // The idle tick checks the VM is still alive before a test
                // is handed over; a dead VM must not swallow one.
                pipeline.tick(&env);
                if pipeline.wants_test() {
                    match inner.queues.tests.pop() {
                        Some(test) => pipeline.feed_test(test)?,
                        None => idle = true,
                    }
                }
            }
            if !idle {
                active |= pipeline.tick(&env);
            }

            if let Some(trace) = pipeline.take_trace() {
                inner.queues.traces.push(trace);
            }
            if let Some(seed) = pipeline.take_guest_seed() {
                if !inner.guest_seeded && !inner.dispatcher_seeded {
                    info!(elements = seed.elements.len(), "queued initial test case");
                    inner.queues.tests.push_front(seed);
                }
                inner.guest_seeded = true;
            }

            if let Some(err) = pipeline.take_error() {
                let origin = format!("vm slot {}", pipeline.slot());
                record_failure(&mut inner.queues, &error_log, &origin, err);
                match pipeline.recovery() {
                    Recovery::Replace => {
                        let ctx = pipeline.context().clone();
                        pipeline.terminate();
                        *pipeline = VmPipeline::new(ctx);
                        info!(slot = pipeline.slot(), "vm pipeline replaced");
                    }
                    Recovery::Terminate => pipeline.terminate(),
                }
            }
        }

        inner.active = active;
        Ok(active)
    }

    fn status(&self) -> NodeStatus {
        let inner = lock(&self.inner);
        NodeStatus {
            kind: NodeKind::Vm,
            node_id: inner.node_id,
            commenced: inner.commenced,
            active: inner.active,
            slots: inner.pipelines.len() as u32,
            pipelines_in_error: inner.pipelines.iter().filter(|p| p.is_error()).count() as u32,
            traces: inner.queues.traces.len() as u32,
            tests: inner.queues.tests.len() as u32,
            errors: inner.queues.errors.len() as u32,
            image_outdated: inner.image.is_outdated(),
            target: inner.target.clone(),
        }
    }

    fn set_node_id(&self, node_id: u64) {
        lock(&self.inner).node_id = node_id;
    }

    fn commence(&self) {
        let mut inner = lock(&self.inner);
        if !inner.commenced {
            info!("vm node commenced");
        }
        inner.commenced = true;
    }

    fn reset(&self) -> Result<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        if inner.commenced {
            for pipeline in inner.pipelines.iter_mut() {
                pipeline.terminate();
            }
        }
        inner.pipelines = build_pool(&inner.options, &inner.layout);
        inner.commenced = inner.options.mode == Mode::Developer;
        inner.active = false;
        inner.queues.traces.clear();
        inner.queues.tests.clear();
        inner.dispatcher_seeded = false;
        inner.guest_seeded = false;
        info!(slots = inner.pipelines.len(), "vm node reset");
        Ok(())
    }

    fn next_target(&self, name: String) -> Result<()> {
        self.reset()?;
        info!(target = %name, "next target");
        lock(&self.inner).target = Some(name);
        Ok(())
    }

    /// Takes effect when each slot next launches its VM.
    fn push_config(&self, config: RunConfig) -> Result<()> {
        let mut inner = lock(&self.inner);
        config.save(&inner.layout.run_config_file())?;
        info!(executable = %config.executable, "target configuration received");
        inner.run_config = Some(config);
        Ok(())
    }

    fn pop_errors(&self) -> Vec<NodeError> {
        lock(&self.inner).queues.errors.drain_all()
    }

    fn terminate(&self) {
        for pipeline in lock(&self.inner).pipelines.iter_mut() {
            pipeline.terminate();
        }
    }

    fn pop_traces(&self, max_bytes: u64) -> Result<Vec<Trace>> {
        let mut inner = lock(&self.inner);
        let cap = byte_cap(max_bytes, inner.options.bandwidth_cap_bytes);
        Ok(inner.queues.traces.pop_capped(cap))
    }

    fn push_tests(&self, tests: Vec<TestCase>) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.dispatcher_seeded |= !tests.is_empty();
        inner.queues.tests.extend(tests);
        Ok(())
    }

    fn image_info(&self) -> Result<Option<ImageInfo>> {
        Ok(lock(&self.inner).image.stored_info().cloned())
    }

    fn push_image_info(&self, info: ImageInfo) -> Result<()> {
        lock(&self.inner).image.set_expected(info);
        Ok(())
    }

    /// Persisted for the next image check; running VMs are left alone. The
    /// archive is written without the node lock so polling carries on.
    fn push_image(&self, image: OSImage) -> Result<()> {
        let dir = lock(&self.inner).image.dir().to_path_buf();
        let staged = StagedImage::write(&dir, image)?;
        lock(&self.inner).image.commit(staged)?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
