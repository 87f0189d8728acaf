//! Both ends of a node ↔ dispatcher link.
//!
//! - [`request_port`] / [`assign_port`]: the registration exchange on the
//!   dispatcher's master port.
//! - [`NodeClient`]: the dispatcher's typed view of one node connection.
//!   Every reply is checked against the node id and the expected reply kind
//!   before its payload is decoded.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use conclave_types::{
    ImageInfo, NodeError, NodeKind, NodeStatus, OSImage, RunConfig, TestCase, Trace,
};

use crate::codec::{
    decode_binary, decode_text, encode_binary, encode_text, encode_xml, read_packet, write_packet,
    MAX_PACKET_BYTES,
};
use crate::error::{NetError, Result};
use crate::messages::{NextTarget, PortAssignment, PortRequest, PullRequest};
use crate::packet::{Packet, PacketKind};

/// Id used before a node has been assigned one.
pub const UNASSIGNED_ID: u64 = 0;

// ── Registration ──────────────────────────────────────────────────────────────

/// Node side: announce the node kind and wait for a port assignment.
pub async fn request_port<T>(io: &mut T, kind: NodeKind) -> Result<PortAssignment>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let payload = encode_binary(&PortRequest { kind })?;
    write_packet(io, &Packet::new(UNASSIGNED_ID, PacketKind::PortRequest, payload)).await?;

    let reply = read_packet(io, MAX_PACKET_BYTES).await?;
    if reply.kind() != PacketKind::PortAssignment {
        return Err(NetError::UnexpectedKind {
            expected: PacketKind::PortAssignment,
            actual: reply.kind(),
        });
    }
    let assignment: PortAssignment = decode_binary(&reply.payload)?;
    reply.check_id(assignment.node_id)?;
    Ok(assignment)
}

/// Dispatcher side: read a node's registration and answer with its
/// assignment.
pub async fn assign_port<T>(io: &mut T, assignment: PortAssignment) -> Result<PortRequest>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let packet = read_packet(io, MAX_PACKET_BYTES).await?;
    let request: PortRequest =
        decode_binary(packet.expect(UNASSIGNED_ID, PacketKind::PortRequest)?)?;

    let payload = encode_binary(&assignment)?;
    write_packet(io, &Packet::new(assignment.node_id, PacketKind::PortAssignment, payload)).await?;
    debug!(node_id = assignment.node_id, port = assignment.port, kind = %request.kind, "port assigned");
    Ok(request)
}

// ── NodeClient ────────────────────────────────────────────────────────────────

pub struct NodeClient<S> {
    stream: S,
    node_id: u64,
}

impl<S> NodeClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, node_id: u64) -> Self {
        Self { stream, node_id }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn status(&mut self) -> Result<NodeStatus> {
        let payload = self.request(PacketKind::StatusRequest, Vec::new()).await?;
        decode_binary(&payload)
    }

    pub async fn image_info(&mut self) -> Result<Option<ImageInfo>> {
        let payload = self.request(PacketKind::ImageInfoRequest, Vec::new()).await?;
        decode_binary(&payload)
    }

    pub async fn pull_traces(&mut self, max_bytes: u64) -> Result<Vec<Trace>> {
        let body = encode_binary(&PullRequest { max_bytes })?;
        let payload = self.request(PacketKind::TraceRequest, body).await?;
        decode_binary(&payload)
    }

    pub async fn pull_tests(&mut self, max_bytes: u64) -> Result<Vec<TestCase>> {
        let body = encode_binary(&PullRequest { max_bytes })?;
        let payload = self.request(PacketKind::TestRequest, body).await?;
        decode_binary(&payload)
    }

    pub async fn errors(&mut self) -> Result<Vec<NodeError>> {
        let payload = self.request(PacketKind::ErrorLogRequest, Vec::new()).await?;
        decode_text(&payload)
    }

    // ── Pushes ───────────────────────────────────────────────────────────

    pub async fn push_config(&mut self, config: &RunConfig) -> Result<()> {
        self.send(PacketKind::ConfigPush, encode_xml(config)?).await
    }

    pub async fn push_image_info(&mut self, info: &ImageInfo) -> Result<()> {
        self.send(PacketKind::ImageInfoPush, encode_binary(info)?).await
    }

    pub async fn push_image(&mut self, image: &OSImage) -> Result<()> {
        self.send(PacketKind::ImagePush, encode_binary(image)?).await
    }

    pub async fn push_traces(&mut self, traces: &[Trace]) -> Result<()> {
        self.send(PacketKind::TracePush, encode_binary(&traces)?).await
    }

    pub async fn push_tests(&mut self, tests: &[TestCase]) -> Result<()> {
        self.send(PacketKind::TestPush, encode_binary(&tests)?).await
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub async fn commence(&mut self) -> Result<()> {
        self.send(PacketKind::Commence, Vec::new()).await
    }

    pub async fn reset(&mut self) -> Result<()> {
        self.send(PacketKind::Reset, Vec::new()).await
    }

    pub async fn next_target(&mut self, name: &str) -> Result<()> {
        let body = encode_text(&NextTarget { name: name.to_string() })?;
        self.send(PacketKind::NextTarget, body).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.send(PacketKind::Shutdown, Vec::new()).await
    }

    // ── Transport ────────────────────────────────────────────────────────

    async fn send(&mut self, kind: PacketKind, payload: Vec<u8>) -> Result<()> {
        write_packet(&mut self.stream, &Packet::new(self.node_id, kind, payload)).await
    }

    async fn request(&mut self, kind: PacketKind, payload: Vec<u8>) -> Result<Vec<u8>> {
        let reply_kind = kind.reply().ok_or(NetError::Encoding(format!("{kind:?} has no reply")))?;
        self.send(kind, payload).await?;
        let reply = read_packet(&mut self.stream, MAX_PACKET_BYTES).await?;
        reply.expect(self.node_id, reply_kind)?;
        Ok(reply.payload)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn registration_exchange() {
        let (mut node_side, mut dispatcher_side) = duplex(4096);
        let assignment = PortAssignment { node_id: 9, port: 4100 };

        let dispatcher = tokio::spawn(async move {
            assign_port(&mut dispatcher_side, assignment).await.unwrap()
        });

        let got = request_port(&mut node_side, NodeKind::Svm).await.unwrap();
        assert_eq!(got, assignment);
        assert_eq!(dispatcher.await.unwrap().kind, NodeKind::Svm);
    }

    #[tokio::test]
    async fn reply_with_wrong_id_is_a_protocol_fault() {
        let (client_side, mut node_side) = duplex(4096);
        let mut client = NodeClient::new(client_side, 3);

        let node = tokio::spawn(async move {
            let req = read_packet(&mut node_side, MAX_PACKET_BYTES).await.unwrap();
            assert_eq!(req.kind(), PacketKind::TraceRequest);
            let body = encode_binary(&vec![Trace::new(vec![1])]).unwrap();
            write_packet(&mut node_side, &Packet::new(4, PacketKind::Traces, body))
                .await
                .unwrap();
        });

        let err = client.pull_traces(1024).await.unwrap_err();
        assert!(matches!(err, NetError::IdMismatch { expected: 3, actual: 4 }));
        assert!(err.is_protocol_fault());
        node.await.unwrap();
    }

    #[tokio::test]
    async fn reply_with_wrong_kind_is_rejected() {
        let (client_side, mut node_side) = duplex(4096);
        let mut client = NodeClient::new(client_side, 3);

        let node = tokio::spawn(async move {
            read_packet(&mut node_side, MAX_PACKET_BYTES).await.unwrap();
            write_packet(&mut node_side, &Packet::empty(3, PacketKind::Commence))
                .await
                .unwrap();
        });

        let err = client.status().await.unwrap_err();
        assert!(matches!(err, NetError::UnexpectedKind { .. }));
        node.await.unwrap();
    }

    #[tokio::test]
    async fn pushes_carry_the_node_id() {
        let (client_side, mut node_side) = duplex(4096);
        let mut client = NodeClient::new(client_side, 12);

        client.commence().await.unwrap();
        client.next_target("base64").await.unwrap();

        let first = read_packet(&mut node_side, MAX_PACKET_BYTES).await.unwrap();
        assert_eq!(first.expect(12, PacketKind::Commence).unwrap(), &[] as &[u8]);

        let second = read_packet(&mut node_side, MAX_PACKET_BYTES).await.unwrap();
        let target: NextTarget = decode_text(second.expect(12, PacketKind::NextTarget).unwrap()).unwrap();
        assert_eq!(target.name, "base64");
    }
}
