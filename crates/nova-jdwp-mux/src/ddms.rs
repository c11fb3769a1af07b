//! DDMS chunks carried inside JDWP packets.
//!
//! A DDMS command is a JDWP command `0xc7/0x01` whose payload is a sequence of
//! chunks. Each chunk is a 4-byte ASCII type tag and a big-endian u32 length
//! followed by that many bytes. Replies are plain JDWP replies whose payload
//! uses the same chunk layout (or is empty).

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{JdwpError, Result};
use crate::packet::{JdwpPacket, JdwpPacketView, Packet};
use crate::registry::SessionKey;
use crate::shared::{FilterId, SharedJdwpSessionFilter, SharedJdwpSessionFilterFactory};
use crate::wire::codec::{JdwpReader, JdwpWriter};

pub const DDMS_CMD_SET: u8 = 0xc7;
pub const DDMS_CMD: u8 = 0x01;
pub const DDMS_CHUNK_HEADER_LEN: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DdmsChunkType(u32);

impl DdmsChunkType {
    pub const HELO: Self = Self::from_tag(*b"HELO");
    pub const FEAT: Self = Self::from_tag(*b"FEAT");
    pub const APNM: Self = Self::from_tag(*b"APNM");
    pub const WAIT: Self = Self::from_tag(*b"WAIT");
    pub const FAIL: Self = Self::from_tag(*b"FAIL");
    pub const EXIT: Self = Self::from_tag(*b"EXIT");
    pub const HPGC: Self = Self::from_tag(*b"HPGC");
    pub const REAE: Self = Self::from_tag(*b"REAE");
    pub const REAQ: Self = Self::from_tag(*b"REAQ");
    pub const REAL: Self = Self::from_tag(*b"REAL");
    pub const MPRQ: Self = Self::from_tag(*b"MPRQ");
    pub const MPSS: Self = Self::from_tag(*b"MPSS");
    pub const MPSE: Self = Self::from_tag(*b"MPSE");
    pub const SPSS: Self = Self::from_tag(*b"SPSS");
    pub const SPSE: Self = Self::from_tag(*b"SPSE");
    pub const VULW: Self = Self::from_tag(*b"VULW");
    pub const VURT: Self = Self::from_tag(*b"VURT");
    pub const VUOP: Self = Self::from_tag(*b"VUOP");

    pub const fn from_tag(tag: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(tag))
    }

    pub const fn from_value(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn tag(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for DdmsChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        if tag.iter().all(|b| b.is_ascii_graphic()) {
            tag.iter().try_for_each(|&b| write!(f, "{}", b as char))
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

impl fmt::Debug for DdmsChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DdmsChunkType({self})")
    }
}

/// One chunk borrowed from a packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdmsChunkView<'a> {
    pub chunk_type: DdmsChunkType,
    pub payload: &'a [u8],
}

impl DdmsChunkView<'_> {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Iterator over the chunks of a DDMS payload.
///
/// Yields an error and stops if a chunk header or body is truncated.
pub struct DdmsChunks<'a> {
    reader: JdwpReader<'a>,
    failed: bool,
}

impl<'a> Iterator for DdmsChunks<'a> {
    type Item = Result<DdmsChunkView<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.remaining() == 0 {
            return None;
        }
        let chunk = self.read_chunk();
        self.failed = chunk.is_err();
        Some(chunk)
    }
}

impl<'a> DdmsChunks<'a> {
    fn read_chunk(&mut self) -> Result<DdmsChunkView<'a>> {
        let chunk_type = DdmsChunkType(self.reader.read_u32()?);
        let len = self.reader.read_u32()? as usize;
        let payload = self.reader.read_bytes(len).map_err(|_| {
            JdwpError::Protocol(format!(
                "DDMS chunk {chunk_type} declares {len} bytes but only {} remain",
                self.reader.remaining()
            ))
        })?;
        Ok(DdmsChunkView {
            chunk_type,
            payload,
        })
    }
}

pub fn ddms_chunks(payload: &[u8]) -> DdmsChunks<'_> {
    DdmsChunks {
        reader: JdwpReader::new(payload),
        failed: false,
    }
}

pub fn encode_chunk(chunk_type: DdmsChunkType, payload: &[u8]) -> Vec<u8> {
    let mut w = JdwpWriter::with_capacity(DDMS_CHUNK_HEADER_LEN + payload.len());
    w.write_u32(chunk_type.value());
    w.write_u32(payload.len() as u32);
    w.write_bytes(payload);
    w.into_vec()
}

/// Builds a DDMS command packet carrying a single chunk.
pub fn create_ddms_packet(id: u32, chunk_type: DdmsChunkType, payload: &[u8]) -> Result<JdwpPacket> {
    JdwpPacket::command(id, DDMS_CMD_SET, DDMS_CMD, encode_chunk(chunk_type, payload))
}

pub fn is_ddms_command<P: Packet + ?Sized>(packet: &P) -> bool {
    packet.is_command_of(DDMS_CMD_SET, DDMS_CMD)
}

/// Body of a `FAIL` chunk: an error code and a UTF-16 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdmsFailChunk {
    pub code: u32,
    pub message: String,
}

impl DdmsFailChunk {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = JdwpReader::new(payload);
        let code = r.read_u32()?;
        let chars = r.read_u32()? as usize;
        let message = r.read_utf16_string(chars)?;
        Ok(Self { code, message })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = JdwpWriter::new();
        w.write_u32(self.code);
        w.write_utf16_string(&self.message);
        w.into_vec()
    }

    pub fn into_error(self) -> JdwpError {
        JdwpError::DdmsFail {
            code: self.code,
            message: self.message,
        }
    }
}

/// The first well-formed `FAIL` chunk in `payload`, if any.
pub fn find_fail_chunk(payload: &[u8]) -> Option<DdmsFailChunk> {
    ddms_chunks(payload)
        .map_while(|chunk| chunk.ok())
        .find(|chunk| chunk.chunk_type == DdmsChunkType::FAIL)
        .and_then(|chunk| DdmsFailChunk::parse(chunk.payload).ok())
}

/// Id of the [`NoDdmsPacketFilter`] installed by
/// [`SharedJdwpSessionRegistry::install_default_filters`](crate::registry::SharedJdwpSessionRegistry::install_default_filters).
pub fn no_ddms_filter_id() -> FilterId {
    static ID: OnceLock<FilterId> = OnceLock::new();
    ID.get_or_init(|| FilterId::new("no-ddms")).clone()
}

/// Hides DDMS traffic from receivers bound to [`no_ddms_filter_id`].
///
/// Rejects incoming DDMS commands, and replies to DDMS commands sent through
/// the same session.
#[derive(Debug)]
pub struct NoDdmsPacketFilter {
    id: FilterId,
    pending_ddms_replies: HashSet<u32>,
}

impl NoDdmsPacketFilter {
    pub fn new() -> Self {
        Self {
            id: no_ddms_filter_id(),
            pending_ddms_replies: HashSet::new(),
        }
    }

    pub fn factory() -> impl SharedJdwpSessionFilterFactory {
        |_: &SessionKey| {
            Some(Box::new(NoDdmsPacketFilter::new()) as Box<dyn SharedJdwpSessionFilter>)
        }
    }
}

impl Default for NoDdmsPacketFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedJdwpSessionFilter for NoDdmsPacketFilter {
    fn id(&self) -> &FilterId {
        &self.id
    }

    fn before_send_packet(&mut self, packet: &JdwpPacketView<'_>) {
        if is_ddms_command(packet) {
            self.pending_ddms_replies.insert(packet.id());
        }
    }

    fn filter(&mut self, packet: &JdwpPacketView<'_>) -> bool {
        if packet.is_reply() {
            !self.pending_ddms_replies.contains(&packet.id())
        } else {
            !is_ddms_command(packet)
        }
    }

    fn after_receive_packet(&mut self, packet: &JdwpPacketView<'_>) {
        if packet.is_reply() {
            self.pending_ddms_replies.remove(&packet.id());
        }
    }

    fn close(&mut self) {
        self.pending_ddms_replies.clear();
    }
}
