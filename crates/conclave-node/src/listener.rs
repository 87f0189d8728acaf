//! Dispatcher request handling.
//!
//! Translates one inbound packet into calls on the node's push/pop/status
//! surface and, for requests, the reply packet. Anything the dispatcher
//! should never send (a reply kind, a request the node kind cannot serve, a
//! packet addressed to another node) is a protocol fault and ends the
//! listener.

use anyhow::{bail, Result};
use tracing::{debug, info};

use conclave_net::codec::{decode_binary, decode_text, decode_xml, encode_binary, encode_text};
use conclave_net::{NextTarget, Packet, PacketKind, PullRequest};
use conclave_pipeline::Node;
use conclave_types::{ImageInfo, OSImage, RunConfig, TestCase, Trace};

/// What the listener does after handling a packet.
#[derive(Debug)]
pub enum Reply {
    None,
    Packet(Packet),
    Shutdown,
}

pub fn handle_packet(node: &dyn Node, packet: &Packet, node_id: u64) -> Result<Reply> {
    packet.check_id(node_id)?;
    let kind = packet.kind();
    let payload = packet.payload.as_slice();
    debug!(?kind, bytes = payload.len(), "dispatcher request");

    let reply = |kind: PacketKind, payload: Vec<u8>| Reply::Packet(Packet::new(node_id, kind, payload));

    let outcome = match kind {
        PacketKind::StatusRequest => reply(PacketKind::Status, encode_binary(&node.status())?),

        PacketKind::ConfigPush => {
            let config: RunConfig = decode_xml(payload)?;
            node.push_config(config)?;
            Reply::None
        }

        PacketKind::ImageInfoRequest => {
            reply(PacketKind::ImageInfo, encode_binary(&node.image_info()?)?)
        }
        PacketKind::ImageInfoPush => {
            let info: ImageInfo = decode_binary(payload)?;
            node.push_image_info(info)?;
            Reply::None
        }
        PacketKind::ImagePush => {
            let image: OSImage = decode_binary(payload)?;
            node.push_image(image)?;
            Reply::None
        }

        PacketKind::TracePush => {
            let traces: Vec<Trace> = decode_binary(payload)?;
            debug!(count = traces.len(), "traces pushed");
            node.push_traces(traces)?;
            Reply::None
        }
        PacketKind::TraceRequest => {
            let request: PullRequest = decode_binary(payload)?;
            let traces = node.pop_traces(request.max_bytes)?;
            reply(PacketKind::Traces, encode_binary(&traces)?)
        }

        PacketKind::TestPush => {
            let tests: Vec<TestCase> = decode_binary(payload)?;
            debug!(count = tests.len(), "tests pushed");
            node.push_tests(tests)?;
            Reply::None
        }
        PacketKind::TestRequest => {
            let request: PullRequest = decode_binary(payload)?;
            let tests = node.pop_tests(request.max_bytes)?;
            reply(PacketKind::Tests, encode_binary(&tests)?)
        }

        PacketKind::Commence => {
            node.commence();
            Reply::None
        }
        PacketKind::Reset => {
            node.reset()?;
            Reply::None
        }
        PacketKind::NextTarget => {
            let next: NextTarget = decode_text(payload)?;
            node.next_target(next.name)?;
            Reply::None
        }

        PacketKind::ErrorLogRequest => reply(PacketKind::ErrorLog, encode_text(&node.pop_errors())?),

        PacketKind::Shutdown => {
            info!("dispatcher requested shutdown");
            Reply::Shutdown
        }

        PacketKind::PortRequest
        | PacketKind::PortAssignment
        | PacketKind::Status
        | PacketKind::ImageInfo
        | PacketKind::Traces
        | PacketKind::Tests
        | PacketKind::ErrorLog => bail!("dispatcher sent a {kind:?} packet"),
    };
    Ok(outcome)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_pipeline::{PipelineError, SvmNode, VmNode};
    use conclave_types::{NodeError, NodeKind, NodeOptions, NodeStatus, TestCaseElement};

    fn vm_node(dir: &std::path::Path) -> VmNode {
        VmNode::new(NodeOptions { work_dir: dir.to_path_buf(), ..NodeOptions::default() }).unwrap()
    }

    fn test_case() -> TestCase {
        TestCase::new(vec![TestCaseElement::new("stdin", b"seed".to_vec())])
    }

    #[test]
    fn status_request_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let node = vm_node(dir.path());
        node.set_node_id(4);

        let request = Packet::empty(4, PacketKind::StatusRequest);
        let Reply::Packet(reply) = handle_packet(&node, &request, 4).unwrap() else {
            panic!("expected a reply");
        };
        assert_eq!(reply.id(), 4);
        let status: NodeStatus = decode_binary(reply.expect(4, PacketKind::Status).unwrap()).unwrap();
        assert_eq!(status.kind, NodeKind::Vm);
        assert_eq!(status.node_id, 4);
    }

    #[test]
    fn pushes_reach_the_node() {
        let dir = tempfile::tempdir().unwrap();
        let node = vm_node(dir.path());

        let push = Packet::new(1, PacketKind::TestPush, encode_binary(&vec![test_case()]).unwrap());
        assert!(matches!(handle_packet(&node, &push, 1).unwrap(), Reply::None));
        assert_eq!(node.status().tests, 1);

        let commence = Packet::empty(1, PacketKind::Commence);
        handle_packet(&node, &commence, 1).unwrap();
        assert!(node.status().commenced);

        let next = Packet::new(
            1,
            PacketKind::NextTarget,
            encode_text(&NextTarget { name: "zlib".into() }).unwrap(),
        );
        handle_packet(&node, &next, 1).unwrap();
        assert_eq!(node.status().target.as_deref(), Some("zlib"));
        assert_eq!(node.status().tests, 0);
    }

    #[test]
    fn error_log_is_text() {
        let dir = tempfile::tempdir().unwrap();
        let node = vm_node(dir.path());
        let Reply::Packet(reply) =
            handle_packet(&node, &Packet::empty(2, PacketKind::ErrorLogRequest), 2).unwrap()
        else {
            panic!("expected a reply");
        };
        let errors: Vec<NodeError> = decode_text(&reply.payload).unwrap();
        assert!(errors.is_empty());
    }

    #[test]
    fn wrong_id_is_a_protocol_fault() {
        let dir = tempfile::tempdir().unwrap();
        let node = vm_node(dir.path());
        let err = handle_packet(&node, &Packet::empty(9, PacketKind::StatusRequest), 2).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn reply_kinds_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = vm_node(dir.path());
        assert!(handle_packet(&node, &Packet::empty(2, PacketKind::Traces), 2).is_err());
    }

    #[test]
    fn requests_for_the_wrong_node_kind_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = SvmNode::new(NodeOptions { work_dir: dir.path().to_path_buf(), ..NodeOptions::default() })
            .unwrap();
        let push = Packet::new(1, PacketKind::TestPush, encode_binary(&vec![test_case()]).unwrap());
        let err = handle_packet(&node, &push, 1).unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::Unsupported(_))));
    }

    #[test]
    fn shutdown_ends_the_listener() {
        let dir = tempfile::tempdir().unwrap();
        let node = vm_node(dir.path());
        assert!(matches!(
            handle_packet(&node, &Packet::empty(3, PacketKind::Shutdown), 3).unwrap(),
            Reply::Shutdown
        ));
    }
}
