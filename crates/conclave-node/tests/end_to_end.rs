//! Full loop through the real wire protocol: a fake dispatcher feeds a test
//! case to a VM node, moves the resulting trace to an SVM node, and collects
//! the generated test cases.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use conclave_net::{assign_port, NodeClient, PortAssignment};
use conclave_node::NodeDriver;
use conclave_pipeline::{Node, SvmNode, VmNode};
use conclave_types::{
    Mode, NodeKind, NodeOptions, SvmOptions, TestCase, TestCaseElement, Trace, VmOptions,
};

const FAKE_VM: &str = r#"
touch hostfile/ready
while true; do
  if [ -f hostfile/run ]; then
    rm -f hostfile/run
    cp hostfile/test_case.bin trace/input.bin
    touch hostfile/finished
  fi
  sleep 0.01
done
"#;

/// Replays successfully, then "discovers" every test under `generated`.
fn fake_engine(generated: &Path) -> String {
    format!(
        r#"case "$1" in
  concolic) test -f run.bc && test -f input.bin ;;
  symbolic) mkdir -p tests && cp {}/*.test tests/ ;;
esac"#,
        generated.display()
    )
}

fn test_case(name: &str, data: &[u8]) -> TestCase {
    TestCase::new(vec![TestCaseElement::new(name, data.to_vec())])
}

/// Register one node on the master port and return the dispatcher's end of
/// its dedicated link.
async fn accept_node(
    master: &TcpListener,
    node_id: u64,
    expected: NodeKind,
) -> NodeClient<TcpStream> {
    let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = data.local_addr().unwrap().port();

    let (mut registration, _) = master.accept().await.unwrap();
    let request = assign_port(&mut registration, PortAssignment { node_id, port })
        .await
        .unwrap();
    assert_eq!(request.kind, expected);

    let (link, _) = data.accept().await.unwrap();
    NodeClient::new(link, node_id)
}

fn base_options(work_dir: &Path, dispatcher: &str) -> NodeOptions {
    NodeOptions {
        dispatcher: dispatcher.to_string(),
        mode: Mode::Distributed,
        work_dir: work_dir.to_path_buf(),
        tick_interval_ms: 5,
        ..NodeOptions::default()
    }
}

fn start(node: Arc<dyn Node>, options: NodeOptions) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(NodeDriver::new(node, options).run())
}

async fn pull_traces_until(client: &mut NodeClient<TcpStream>, count: usize) -> Vec<Trace> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut out = Vec::new();
    while out.len() < count {
        assert!(Instant::now() < deadline, "timed out waiting for traces");
        out.extend(client.pull_traces(0).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    out
}

async fn pull_tests_until(client: &mut NodeClient<TcpStream>, count: usize) -> Vec<TestCase> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut out = Vec::new();
    while out.len() < count {
        assert!(Instant::now() < deadline, "timed out waiting for tests");
        out.extend(client.pull_tests(0).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_case_to_trace_to_test_cases() {
    let dir = tempfile::tempdir().unwrap();
    let master = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dispatcher = master.local_addr().unwrap().to_string();

    // Tests the fake engine will report.
    let generated = dir.path().join("generated");
    std::fs::create_dir_all(&generated).unwrap();
    let t2 = test_case("stdin", b"T2");
    let t3 = test_case("stdin", b"T3");
    t2.write_to_file(&generated.join("test000001.test")).unwrap();
    t3.write_to_file(&generated.join("test000002.test")).unwrap();

    // ── VM node ──────────────────────────────────────────────────────────
    let vm_options = NodeOptions {
        vm: VmOptions {
            executable: "/bin/sh".into(),
            args: vec!["-c".into(), FAKE_VM.into(), "fake-vm".into()],
            slots: 1,
            ..VmOptions::default()
        },
        ..base_options(&dir.path().join("vm"), &dispatcher)
    };
    let vm_node: Arc<dyn Node> = Arc::new(VmNode::new(vm_options.clone()).unwrap());
    let vm_driver = start(vm_node, vm_options);
    let mut vm = accept_node(&master, 1, NodeKind::Vm).await;

    let t1 = test_case("stdin", b"T1");
    vm.push_tests(&[t1.clone()]).await.unwrap();
    vm.commence().await.unwrap();

    let traces = pull_traces_until(&mut vm, 1).await;
    assert_eq!(traces.len(), 1);
    let status = vm.status().await.unwrap();
    assert_eq!(status.node_id, 1);
    assert_eq!(status.tests, 0);
    assert!(vm.errors().await.unwrap().is_empty());

    // ── SVM node ─────────────────────────────────────────────────────────
    let engine = fake_engine(&generated);
    let svm_options = NodeOptions {
        svm: SvmOptions {
            translator: "/bin/sh".into(),
            translator_args: vec!["-c".into(), "test -f input.bin && touch run.bc".into()],
            symbolic: "/bin/sh".into(),
            concolic_args: vec!["-c".into(), engine.clone(), "engine".into(), "concolic".into()],
            symbolic_args: vec!["-c".into(), engine, "engine".into(), "symbolic".into()],
            slots: 1,
            ..SvmOptions::default()
        },
        ..base_options(&dir.path().join("svm"), &dispatcher)
    };
    let svm_node: Arc<dyn Node> = Arc::new(SvmNode::new(svm_options.clone()).unwrap());
    let svm_driver = start(svm_node, svm_options);
    let mut svm = accept_node(&master, 2, NodeKind::Svm).await;

    svm.push_traces(&traces).await.unwrap();
    svm.commence().await.unwrap();

    let tests = pull_tests_until(&mut svm, 2).await;
    assert_eq!(tests, vec![t2, t3]);

    // Nothing else crosses the wire.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(vm.pull_traces(0).await.unwrap().is_empty());
    assert!(svm.pull_tests(0).await.unwrap().is_empty());
    assert!(svm.errors().await.unwrap().is_empty());

    vm.shutdown().await.unwrap();
    svm.shutdown().await.unwrap();
    vm_driver.await.unwrap().unwrap();
    svm_driver.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_with_foreign_id_stops_the_node() {
    let dir = tempfile::tempdir().unwrap();
    let master = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let options = base_options(dir.path(), &master.local_addr().unwrap().to_string());
    let node: Arc<dyn Node> = Arc::new(SvmNode::new(options.clone()).unwrap());
    let driver = start(node, options);

    let client = accept_node(&master, 5, NodeKind::Svm).await;
    let mut impostor = NodeClient::new(client.into_inner(), 6);
    impostor.commence().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), driver)
        .await
        .expect("driver stopped")
        .unwrap();
    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("mismatch"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatcher_hangup_stops_the_node_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let master = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let options = NodeOptions {
        mode: Mode::Developer,
        ..base_options(dir.path(), &master.local_addr().unwrap().to_string())
    };
    let node: Arc<dyn Node> = Arc::new(SvmNode::new(options.clone()).unwrap());
    let driver = start(node, options);

    let mut client = accept_node(&master, 3, NodeKind::Svm).await;
    assert!(client.status().await.unwrap().commenced);
    drop(client);

    let result = tokio::time::timeout(Duration::from_secs(10), driver)
        .await
        .expect("driver stopped")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_packet_kind_stops_the_node() {
    use tokio::io::AsyncWriteExt;

    let dir = tempfile::tempdir().unwrap();
    let master = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let options = base_options(dir.path(), &master.local_addr().unwrap().to_string());
    let node: Arc<dyn Node> = Arc::new(SvmNode::new(options.clone()).unwrap());
    let driver = start(node, options);

    let client = accept_node(&master, 4, NodeKind::Svm).await;
    let mut link = client.into_inner();
    let mut frame = Vec::new();
    frame.extend_from_slice(&4u64.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.extend_from_slice(&0xFFFFu32.to_be_bytes());
    link.write_all(&frame).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), driver)
        .await
        .expect("driver stopped")
        .unwrap();
    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("protocol fault on dispatcher link"));
}
