//! `conclave-net` — the node ↔ dispatcher wire protocol.
//!
//! One persistent, point-to-point connection per node. Each message is a
//! [`PacketHeader`] followed by a payload in one of three encodings chosen
//! by the packet kind (see [`Encoding`]).

pub mod client;
pub mod codec;
pub mod error;
pub mod messages;
pub mod packet;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use client::{assign_port, request_port, NodeClient, UNASSIGNED_ID};
pub use codec::{read_packet, write_packet, MAX_PACKET_BYTES};
pub use error::{NetError, Result};
pub use messages::{NextTarget, PortAssignment, PortRequest, PullRequest};
pub use packet::{Encoding, Packet, PacketHeader, PacketKind};
