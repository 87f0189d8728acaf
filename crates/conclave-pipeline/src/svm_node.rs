//! SVM node: a pool of SVM pipelines fed from the trace queue.

use std::sync::Mutex;

use conclave_store::NodeLayout;
use conclave_types::{Mode, NodeError, NodeKind, NodeOptions, NodeStatus, RunConfig, TestCase, Trace};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::node::{byte_cap, lock, record_failure, Node};
use crate::queue::Queues;
use crate::region::Recovery;
use crate::svm::{SvmContext, SvmPipeline};

pub struct SvmNode {
    inner: Mutex<SvmInner>,
}

struct SvmInner {
    options: NodeOptions,
    layout: NodeLayout,
    pipelines: Vec<SvmPipeline>,
    queues: Queues,
    node_id: u64,
    commenced: bool,
    active: bool,
    target: Option<String>,
}

impl SvmNode {
    pub fn new(options: NodeOptions) -> Result<Self> {
        if options.svm.slots == 0 {
            return Err(PipelineError::Invariant("svm node configured with zero slots".into()));
        }
        let layout = NodeLayout::new(&options.work_dir);
        layout.create()?;
        let pipelines = build_pool(&options, &layout);
        let commenced = options.mode == Mode::Developer;
        info!(slots = pipelines.len(), mode = ?options.mode, work_dir = %layout.root().display(), "svm node created");

        Ok(Self {
            inner: Mutex::new(SvmInner {
                options,
                layout,
                pipelines,
                queues: Queues::default(),
                node_id: 0,
                commenced,
                active: false,
                target: None,
            }),
        })
    }
}

fn build_pool(options: &NodeOptions, layout: &NodeLayout) -> Vec<SvmPipeline> {
    (0..options.svm.slots as usize)
        .map(|slot| {
            SvmPipeline::new(SvmContext {
                slot,
                mode: options.mode,
                options: options.svm.clone(),
                layout: layout.clone(),
            })
        })
        .collect()
}

impl Node for SvmNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Svm
    }

    fn poll(&self) -> Result<bool> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        if !inner.commenced {
            inner.active = false;
            return Ok(false);
        }
        let slots = inner.options.svm.slots as usize;
        if inner.pipelines.len() != slots {
            return Err(PipelineError::Invariant(format!(
                "svm node has {} pipelines for {slots} slots",
                inner.pipelines.len()
            )));
        }

        let error_log = inner.layout.error_log();
        let mut active = false;

        for pipeline in inner.pipelines.iter_mut() {
            if pipeline.is_terminated() {
                continue;
            }
            if pipeline.wants_trace() {
                match inner.queues.traces.pop() {
                    Some(trace) => pipeline.feed_trace(trace)?,
                    None => continue,
                }
            }

            active |= pipeline.tick();

            let tests = pipeline.take_tests();
            if !tests.is_empty() {
                inner.queues.tests.extend(tests);
            }

            if let Some(err) = pipeline.take_error() {
                let origin = format!("svm slot {}", pipeline.slot());
                let salvaged = record_failure(&mut inner.queues, &error_log, &origin, err);
                if !salvaged.is_empty() {
                    info!(slot = pipeline.slot(), tests = salvaged.len(), "salvaged tests from failed run");
                    inner.queues.tests.extend(salvaged);
                }
                match pipeline.recovery() {
                    Recovery::Replace => {
                        let ctx = pipeline.context().clone();
                        pipeline.terminate();
                        *pipeline = SvmPipeline::new(ctx);
                        info!(slot = pipeline.slot(), "svm pipeline replaced");
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
            kind: NodeKind::Svm,
            node_id: inner.node_id,
            commenced: inner.commenced,
            active: inner.active,
            slots: inner.pipelines.len() as u32,
            pipelines_in_error: inner.pipelines.iter().filter(|p| p.is_error()).count() as u32,
            traces: inner.queues.traces.len() as u32,
            tests: inner.queues.tests.len() as u32,
            errors: inner.queues.errors.len() as u32,
            image_outdated: false,
            target: inner.target.clone(),
        }
    }

    fn set_node_id(&self, node_id: u64) {
        lock(&self.inner).node_id = node_id;
    }

    fn commence(&self) {
        let mut inner = lock(&self.inner);
        if !inner.commenced {
            info!("svm node commenced");
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
        info!(slots = inner.pipelines.len(), "svm node reset");
        Ok(())
    }

    fn next_target(&self, name: String) -> Result<()> {
        self.reset()?;
        info!(target = %name, "next target");
        lock(&self.inner).target = Some(name);
        Ok(())
    }

    /// Kept next to the trace directories for the translator.
    fn push_config(&self, config: RunConfig) -> Result<()> {
        let inner = lock(&self.inner);
        config.save(&inner.layout.run_config_file())?;
        info!(executable = %config.executable, "target configuration received");
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

    fn push_traces(&self, traces: Vec<Trace>) -> Result<()> {
        lock(&self.inner).queues.traces.extend(traces);
        Ok(())
    }

    fn pop_tests(&self, max_bytes: u64) -> Result<Vec<TestCase>> {
        let mut inner = lock(&self.inner);
        let cap = byte_cap(max_bytes, inner.options.bandwidth_cap_bytes);
        Ok(inner.queues.tests.pop_capped(cap))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svm::SvmState;
    use conclave_store::archive;
    use conclave_types::{SvmOptions, TestCaseElement};
    use std::fs;
    use std::path::Path;
    use std::thread;
    use std::time::{Duration, Instant};

    fn generated(root: &Path, count: u8) -> String {
        let dir = root.join("generated");
        fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            TestCase::new(vec![TestCaseElement::new("stdin", vec![i; 3])])
                .write_to_file(&dir.join(format!("test{i:06}.test")))
                .unwrap();
        }
        dir.display().to_string()
    }

    fn options(root: &Path, mode: Mode, symbolic_exit: u8) -> NodeOptions {
        let engine = format!(
            r#"case "$1" in
  concolic) exit 0 ;;
  symbolic) mkdir -p tests && cp {}/*.test tests/ && exit {symbolic_exit} ;;
esac"#,
            generated(root, 2)
        );
        NodeOptions {
            mode,
            work_dir: root.join("node"),
            svm: SvmOptions {
                translator: "/bin/sh".into(),
                translator_args: vec!["-c".into(), "touch run.bc".into()],
                symbolic: "/bin/sh".into(),
                concolic_args: vec!["-c".into(), engine.clone(), "engine".into(), "concolic".into()],
                symbolic_args: vec!["-c".into(), engine, "engine".into(), "symbolic".into()],
                slots: 2,
                ..SvmOptions::default()
            },
            ..NodeOptions::default()
        }
    }

    fn trace(root: &Path, tag: &str) -> Trace {
        let capture = root.join(format!("capture-{tag}"));
        fs::create_dir_all(&capture).unwrap();
        fs::write(capture.join("input.bin"), tag).unwrap();
        Trace::new(archive::pack_copy(&capture, &root.join("pack"), tag).unwrap())
    }

    fn poll_until(node: &SvmNode, done: impl Fn(&SvmNode) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(15);
        while !done(node) {
            assert!(Instant::now() < deadline, "node made no progress: {:?}", node.status());
            node.poll().unwrap();
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn traces_in_tests_out() {
        let dir = tempfile::tempdir().unwrap();
        let node = SvmNode::new(options(dir.path(), Mode::Distributed, 0)).unwrap();
        node.push_traces(vec![trace(dir.path(), "a"), trace(dir.path(), "b")]).unwrap();
        node.commence();

        poll_until(&node, |n| n.status().tests == 4);
        assert_eq!(node.status().traces, 0);
        assert_eq!(node.status().errors, 0);
        assert_eq!(node.pop_tests(0).unwrap().len(), 4);
        poll_until(&node, |n| !n.poll().unwrap());
    }

    #[test]
    fn salvaged_tests_reach_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let node = SvmNode::new(options(dir.path(), Mode::Distributed, 3)).unwrap();
        node.push_traces(vec![trace(dir.path(), "a")]).unwrap();
        node.commence();

        poll_until(&node, |n| n.status().errors == 1);
        let status = node.status();
        assert_eq!(status.tests, 2);
        assert_eq!(status.pipelines_in_error, 0);

        let errors = node.pop_errors();
        assert!(errors[0].log.contains("svm slot"));
        assert!(errors[0].log.contains("2 tests salvaged"));
        assert!(node.pop_errors().is_empty());
    }

    #[test]
    fn developer_mode_keeps_failed_slot_down() {
        let dir = tempfile::tempdir().unwrap();
        let node = SvmNode::new(options(dir.path(), Mode::Developer, 3)).unwrap();
        node.push_traces(vec![trace(dir.path(), "a")]).unwrap();

        poll_until(&node, |n| n.status().errors == 1);
        assert_eq!(node.status().pipelines_in_error, 1);
        assert!(dir.path().join("node/log/errors.log").exists());
    }

    #[test]
    fn reset_twice_leaves_queues_alone() {
        let dir = tempfile::tempdir().unwrap();
        let node = SvmNode::new(options(dir.path(), Mode::Distributed, 0)).unwrap();
        node.push_traces(vec![trace(dir.path(), "a")]).unwrap();

        node.reset().unwrap();
        let first = node.status();
        assert_eq!(first.traces, 0);
        node.reset().unwrap();
        assert_eq!(node.status(), first);
        assert_eq!(first.slots, 2);
    }

    #[test]
    fn reset_removes_in_flight_trace_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path(), Mode::Distributed, 0);
        opts.svm.slots = 1;
        opts.svm.concolic_args = vec!["-c".into(), "sleep 30".into()];
        let node = SvmNode::new(opts).unwrap();
        let trace = trace(dir.path(), "busy");
        let trace_dir = NodeLayout::new(dir.path().join("node")).trace_dir(trace.id());
        node.push_traces(vec![trace]).unwrap();
        node.commence();

        poll_until(&node, |n| {
            lock(&n.inner).pipelines[0].state() == SvmState::ExecuteConcolic
        });
        assert!(trace_dir.is_dir());

        let started = Instant::now();
        node.reset().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10), "engine was not cancelled");
        assert!(!trace_dir.exists());
        node.reset().unwrap();
        assert!(!trace_dir.exists());
    }

    #[test]
    fn test_push_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let node = SvmNode::new(options(dir.path(), Mode::Distributed, 0)).unwrap();
        assert!(matches!(node.push_tests(Vec::new()), Err(PipelineError::Unsupported(_))));
        assert!(matches!(node.push_image_info(conclave_types::ImageInfo::new(
            "guest.img",
            chrono::Utc::now()
        )), Err(PipelineError::Unsupported(_))));
    }
}
