// conclave-net::codec — packet framing over a byte stream, plus the three
// payload encodings (binary, text, XML) selected per packet kind.
//
// Binary payloads use bincode: traces and images carry raw `Vec<u8>` archive
// data, which bincode writes as length + raw bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, Result};
use crate::packet::{Packet, PacketHeader, HEADER_LEN};

/// Safety limit: reject any single packet larger than 1 GiB. Disk images are
/// the largest payloads on the wire.
pub const MAX_PACKET_BYTES: usize = 1024 * 1024 * 1024;

// ── Framing ───────────────────────────────────────────────────────────────────

/// Read one packet. A clean EOF before the first header byte is reported as
/// [`NetError::Closed`].
pub async fn read_packet<T>(io: &mut T, max_bytes: usize) -> Result<Packet>
where
    T: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    match io.read_exact(&mut raw).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(NetError::Closed),
        Err(e) => return Err(e.into()),
    }

    let header = PacketHeader::from_bytes(&raw)?;
    let size = header.size as usize;
    if size > max_bytes {
        return Err(NetError::TooLarge { size, max: max_bytes });
    }

    let mut payload = vec![0u8; size];
    io.read_exact(&mut payload).await?;
    Ok(Packet { header, payload })
}

/// Write one packet and flush.
pub async fn write_packet<T>(io: &mut T, packet: &Packet) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let size = u32::try_from(packet.payload.len()).map_err(|_| NetError::TooLarge {
        size: packet.payload.len(),
        max: u32::MAX as usize,
    })?;
    let header = PacketHeader { size, ..packet.header };
    io.write_all(&header.to_bytes()).await?;
    io.write_all(&packet.payload).await?;
    io.flush().await?;
    Ok(())
}

// ── Payload encodings ─────────────────────────────────────────────────────────

pub fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| NetError::Encoding(e.to_string()))
}

pub fn decode_binary<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| NetError::Encoding(e.to_string()))?;
    Ok(value)
}

pub fn encode_text<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| NetError::Encoding(e.to_string()))
}

pub fn decode_text<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| NetError::Encoding(e.to_string()))
}

pub fn encode_xml<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    conclave_types::config::to_xml(value)
        .map(String::into_bytes)
        .map_err(|e| NetError::Encoding(e.to_string()))
}

pub fn decode_xml<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let text = std::str::from_utf8(data).map_err(|e| NetError::Encoding(e.to_string()))?;
    conclave_types::config::from_xml(text).map_err(|e| NetError::Encoding(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
