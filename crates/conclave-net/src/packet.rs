//! Packet header and packet kinds.
//!
//! Every message on a node ↔ dispatcher connection is a fixed 16-byte header
//! followed by `size` payload bytes:
//!
//! ```text
//! | id: u64 BE | size: u32 BE | kind: u32 BE | payload ... |
//! ```
//!
//! `id` is the node identifier assigned during port negotiation; both sides
//! reject packets carrying any other id.

use crate::error::{NetError, Result};

pub const HEADER_LEN: usize = 16;

/// How a packet kind's payload is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// No payload.
    Empty,
    /// bincode — queues, images, status.
    Binary,
    /// JSON — small human-readable records.
    Text,
    /// Tagged XML — full configuration documents.
    Xml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketKind {
    PortRequest      = 1,
    PortAssignment   = 2,

    StatusRequest    = 10,
    Status           = 11,

    ConfigPush       = 20,

    ImageInfoRequest = 30,
    ImageInfo        = 31,
    ImageInfoPush    = 32,
    ImagePush        = 33,

    TracePush        = 40,
    TraceRequest     = 41,
    Traces           = 42,

    TestPush         = 50,
    TestRequest      = 51,
    Tests            = 52,

    Commence         = 60,
    Reset            = 61,
    NextTarget       = 62,

    ErrorLogRequest  = 70,
    ErrorLog         = 71,

    Shutdown         = 80,
}

impl PacketKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        use PacketKind::*;
        Some(match v {
            1 => PortRequest,
            2 => PortAssignment,
            10 => StatusRequest,
            11 => Status,
            20 => ConfigPush,
            30 => ImageInfoRequest,
            31 => ImageInfo,
            32 => ImageInfoPush,
            33 => ImagePush,
            40 => TracePush,
            41 => TraceRequest,
            42 => Traces,
            50 => TestPush,
            51 => TestRequest,
            52 => Tests,
            60 => Commence,
            61 => Reset,
            62 => NextTarget,
            70 => ErrorLogRequest,
            71 => ErrorLog,
            80 => Shutdown,
            _ => return None,
        })
    }

    pub fn encoding(self) -> Encoding {
        use PacketKind::*;
        match self {
            StatusRequest | ImageInfoRequest | Commence | Reset | ErrorLogRequest | Shutdown => {
                Encoding::Empty
            }
            ConfigPush => Encoding::Xml,
            NextTarget | ErrorLog => Encoding::Text,
            PortRequest | PortAssignment | Status | ImageInfo | ImageInfoPush | ImagePush
            | TracePush | TraceRequest | Traces | TestPush | TestRequest | Tests => Encoding::Binary,
        }
    }

    /// The kind a node answers this request with, if it answers at all.
    pub fn reply(self) -> Option<Self> {
        use PacketKind::*;
        match self {
            PortRequest => Some(PortAssignment),
            StatusRequest => Some(Status),
            ImageInfoRequest => Some(ImageInfo),
            TraceRequest => Some(Traces),
            TestRequest => Some(Tests),
            ErrorLogRequest => Some(ErrorLog),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub id: u64,
    pub size: u32,
    pub kind: PacketKind,
}

impl PacketHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(&self.id.to_be_bytes());
        out[8..12].copy_from_slice(&self.size.to_be_bytes());
        out[12..16].copy_from_slice(&(self.kind as u32).to_be_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        let [a, b, c, d, e, f, g, h, s0, s1, s2, s3, k0, k1, k2, k3] = *raw;
        let id = u64::from_be_bytes([a, b, c, d, e, f, g, h]);
        let size = u32::from_be_bytes([s0, s1, s2, s3]);
        let kind_raw = u32::from_be_bytes([k0, k1, k2, k3]);
        let kind = PacketKind::from_u32(kind_raw).ok_or(NetError::UnknownKind(kind_raw))?;
        Ok(Self { id, size, kind })
    }
}

/// A header plus its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(id: u64, kind: PacketKind, payload: Vec<u8>) -> Self {
        Self {
            header: PacketHeader { id, size: payload.len() as u32, kind },
            payload,
        }
    }

    pub fn empty(id: u64, kind: PacketKind) -> Self {
        Self::new(id, kind, Vec::new())
    }

    pub fn id(&self) -> u64 {
        self.header.id
    }

    pub fn kind(&self) -> PacketKind {
        self.header.kind
    }

    /// Check the id only.
    pub fn check_id(&self, expected: u64) -> Result<()> {
        if self.header.id != expected {
            return Err(NetError::IdMismatch { expected, actual: self.header.id });
        }
        Ok(())
    }

    /// Check id and kind, and hand out the payload only if both match.
    pub fn expect(&self, id: u64, kind: PacketKind) -> Result<&[u8]> {
        self.check_id(id)?;
        if self.header.kind != kind {
            return Err(NetError::UnexpectedKind { expected: kind, actual: self.header.kind });
        }
        Ok(&self.payload)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let h = PacketHeader { id: 7, size: 0x0102, kind: PacketKind::Traces };
        let raw = h.to_bytes();
        assert_eq!(&raw[0..8], &[0, 0, 0, 0, 0, 0, 0, 7]);
        assert_eq!(&raw[8..12], &[0, 0, 1, 2]);
        assert_eq!(&raw[12..16], &[0, 0, 0, 42]);
        assert_eq!(PacketHeader::from_bytes(&raw).unwrap(), h);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut raw = PacketHeader { id: 1, size: 0, kind: PacketKind::Reset }.to_bytes();
        raw[15] = 99;
        let err = PacketHeader::from_bytes(&raw).unwrap_err();
        assert!(matches!(err, NetError::UnknownKind(99)));
        assert!(err.is_protocol_fault());
    }

    #[test]
    fn every_kind_round_trips_through_u32() {
        for v in 0..100 {
            if let Some(kind) = PacketKind::from_u32(v) {
                assert_eq!(kind as u32, v);
            }
        }
    }

    #[test]
    fn requests_and_replies() {
        assert_eq!(PacketKind::TraceRequest.reply(), Some(PacketKind::Traces));
        assert_eq!(PacketKind::TestPush.reply(), None);
        assert_eq!(PacketKind::ConfigPush.encoding(), Encoding::Xml);
        assert_eq!(PacketKind::ErrorLog.encoding(), Encoding::Text);
        assert_eq!(PacketKind::Commence.encoding(), Encoding::Empty);
    }

    #[test]
    fn id_mismatch_never_yields_payload() {
        let p = Packet::new(5, PacketKind::Tests, vec![1, 2, 3]);
        let err = p.expect(6, PacketKind::Tests).unwrap_err();
        assert!(matches!(err, NetError::IdMismatch { expected: 6, actual: 5 }));
        assert_eq!(p.expect(5, PacketKind::Tests).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let p = Packet::empty(5, PacketKind::Status);
        let err = p.expect(5, PacketKind::Traces).unwrap_err();
        assert!(matches!(err, NetError::UnexpectedKind { .. }));
    }
}
