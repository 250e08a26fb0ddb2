//! Packet framing.
//!
//! Every packet starts with a 4-byte header: a 3-byte little-endian
//! payload length and a 1-byte sequence number. Payloads of 2^24 - 1
//! bytes or more are split into full-size chunks followed by a shorter
//! (possibly empty) terminating chunk; the receiver concatenates chunks
//! until it sees one shorter than the maximum.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};

/// Maximum payload size for a single packet chunk (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// A packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        Self {
            payload_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            sequence_id: bytes[3],
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// Classification of a server payload by its leading byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// OK packet (0x00)
    Ok,
    /// ERR packet (0xFF)
    Err,
    /// EOF packet (0xFE with fewer than 9 bytes)
    Eof,
    /// Anything else: column count, column definition or row data
    Data,
}

impl PacketKind {
    /// Classify a complete (reassembled) payload.
    pub fn classify(payload: &[u8]) -> Self {
        match payload.first() {
            Some(0x00) => PacketKind::Ok,
            Some(0xFF) => PacketKind::Err,
            Some(0xFE) if payload.len() < 9 => PacketKind::Eof,
            _ => PacketKind::Data,
        }
    }
}

/// One logical packet as received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence number of the last chunk that made up this packet
    pub sequence_id: u8,
    pub payload: Vec<u8>,
    pub kind: PacketKind,
}

impl Packet {
    /// Sequence number the reply to this packet must carry.
    pub fn next_sequence(&self) -> u8 {
        self.sequence_id.wrapping_add(1)
    }
}

/// Write `payload` framed as one or more packets starting at `sequence_id`.
///
/// Returns the sequence number following the last chunk written.
pub fn write_packet<W: Write + ?Sized>(
    writer: &mut W,
    payload: &[u8],
    mut sequence_id: u8,
) -> io::Result<u8> {
    let mut offset = 0;
    loop {
        let chunk_len = (payload.len() - offset).min(MAX_PACKET_SIZE);
        let header = PacketHeader {
            payload_length: chunk_len as u32,
            sequence_id,
        };
        writer.write_all(&header.to_bytes())?;
        writer.write_all(&payload[offset..offset + chunk_len])?;
        offset += chunk_len;
        sequence_id = sequence_id.wrapping_add(1);

        // A full chunk always needs a follow-up, even an empty one.
        if chunk_len < MAX_PACKET_SIZE {
            break;
        }
    }
    writer.flush()?;
    tracing::trace!(len = payload.len(), next_sequence = sequence_id, "wrote packet");
    Ok(sequence_id)
}

/// Read one logical packet, reassembling continuation chunks.
///
/// Returns `Ok(None)` when the stream ends cleanly before a header starts,
/// which means the peer closed its side of the connection.
pub fn read_packet<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<Packet>> {
    let Some(mut header) = read_header(reader, true)? else {
        return Ok(None);
    };
    let mut payload = vec![0u8; header.payload_length as usize];
    reader.read_exact(&mut payload)?;

    while header.payload_length as usize == MAX_PACKET_SIZE {
        header = read_header(reader, false)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended before continuation packet",
            )
        })?;
        let start = payload.len();
        payload.resize(start + header.payload_length as usize, 0);
        reader.read_exact(&mut payload[start..])?;
    }

    let kind = PacketKind::classify(&payload);
    tracing::trace!(
        len = payload.len(),
        sequence = header.sequence_id,
        kind = ?kind,
        "read packet"
    );
    Ok(Some(Packet {
        sequence_id: header.sequence_id,
        payload,
        kind,
    }))
}

fn read_header<R: Read + ?Sized>(
    reader: &mut R,
    allow_eof: bool,
) -> io::Result<Option<PacketHeader>> {
    let mut buf = [0u8; PacketHeader::SIZE];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 && allow_eof => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a packet header",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Some(PacketHeader::from_bytes(&buf)))
}
