//! JDWP packet framing.
//!
//! Packets come in two flavours:
//!
//! * [`JdwpPacketView`] borrows its payload from a receive buffer owned by the
//!   session. The borrow checker ties it to the dispatch call that produced it,
//!   so it cannot be retained once the next frame is read.
//! * [`JdwpPacket`] owns its payload and can be stored, sent across tasks, or
//!   replayed later.
//!
//! [`Packet::to_offline`] converts either flavour into a [`JdwpPacket`].

use std::fmt;

use bytes::Bytes;

use crate::error::{JdwpError, Result};
use crate::wire::codec::{FLAG_REPLY, HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Command { command_set: u8, command: u8 },
    Reply { error_code: u16 },
}

/// The fixed 11-byte JDWP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHeader {
    pub length: u32,
    pub id: u32,
    pub flags: u8,
    pub kind: PacketKind,
}

impl PacketHeader {
    pub fn command(id: u32, command_set: u8, command: u8, payload_len: usize) -> Result<Self> {
        Ok(Self {
            length: frame_length(payload_len)?,
            id,
            flags: 0,
            kind: PacketKind::Command {
                command_set,
                command,
            },
        })
    }

    pub fn reply(id: u32, error_code: u16, payload_len: usize) -> Result<Self> {
        Ok(Self {
            length: frame_length(payload_len)?,
            id,
            flags: FLAG_REPLY,
            kind: PacketKind::Reply { error_code },
        })
    }

    /// Decodes a header, rejecting lengths that cannot describe a valid frame.
    ///
    /// Any error here leaves the byte stream unsynchronized.
    pub fn decode(bytes: &[u8; HEADER_LEN], max_length: usize) -> Result<Self> {
        let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let id = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let flags = bytes[8];

        let length_usize = length as usize;
        if length_usize < HEADER_LEN {
            return Err(JdwpError::Protocol(format!("invalid packet length {length}")));
        }
        if length_usize > max_length {
            return Err(JdwpError::Protocol(format!(
                "JDWP packet length {length} exceeds maximum allowed ({max_length} bytes); refusing to allocate"
            )));
        }

        let kind = if flags & FLAG_REPLY != 0 {
            PacketKind::Reply {
                error_code: u16::from_be_bytes([bytes[9], bytes[10]]),
            }
        } else {
            PacketKind::Command {
                command_set: bytes[9],
                command: bytes[10],
            }
        };

        Ok(Self {
            length,
            id,
            flags,
            kind,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..8].copy_from_slice(&self.id.to_be_bytes());
        out[8] = self.flags;
        match self.kind {
            PacketKind::Command {
                command_set,
                command,
            } => {
                out[9] = command_set;
                out[10] = command;
            }
            PacketKind::Reply { error_code } => {
                out[9..11].copy_from_slice(&error_code.to_be_bytes());
            }
        }
        out
    }

    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_LEN)
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, PacketKind::Reply { .. })
    }

    pub fn is_command(&self) -> bool {
        matches!(self.kind, PacketKind::Command { .. })
    }
}

fn frame_length(payload_len: usize) -> Result<u32> {
    payload_len
        .checked_add(HEADER_LEN)
        .and_then(|len| u32::try_from(len).ok())
        .ok_or_else(|| {
            JdwpError::InvalidArgument(format!(
                "payload of {payload_len} bytes does not fit in a JDWP packet"
            ))
        })
}

/// Read access shared by live and offline packets.
pub trait Packet {
    fn header(&self) -> &PacketHeader;

    fn payload(&self) -> &[u8];

    /// `true` when the packet owns immutable storage and can be shared freely.
    fn is_thread_safe_and_immutable(&self) -> bool;

    /// Copies the packet into owned storage.
    fn to_offline(&self) -> JdwpPacket {
        JdwpPacket {
            header: *self.header(),
            payload: Bytes::copy_from_slice(self.payload()),
        }
    }

    fn id(&self) -> u32 {
        self.header().id
    }

    fn length(&self) -> u32 {
        self.header().length
    }

    fn flags(&self) -> u8 {
        self.header().flags
    }

    fn is_command(&self) -> bool {
        self.header().is_command()
    }

    fn is_reply(&self) -> bool {
        self.header().is_reply()
    }

    fn command_set(&self) -> Option<u8> {
        match self.header().kind {
            PacketKind::Command { command_set, .. } => Some(command_set),
            PacketKind::Reply { .. } => None,
        }
    }

    fn command(&self) -> Option<u8> {
        match self.header().kind {
            PacketKind::Command { command, .. } => Some(command),
            PacketKind::Reply { .. } => None,
        }
    }

    fn error_code(&self) -> Option<u16> {
        match self.header().kind {
            PacketKind::Reply { error_code } => Some(error_code),
            PacketKind::Command { .. } => None,
        }
    }

    fn is_command_of(&self, command_set: u8, command: u8) -> bool {
        self.header().kind
            == PacketKind::Command {
                command_set,
                command,
            }
    }

    /// Serializes the full frame (header and payload).
    fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&self.header().encode());
        out.extend_from_slice(payload);
        out
    }
}

/// A packet whose payload borrows a session-owned receive buffer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct JdwpPacketView<'a> {
    header: PacketHeader,
    payload: &'a [u8],
}

impl<'a> JdwpPacketView<'a> {
    pub fn new(header: PacketHeader, payload: &'a [u8]) -> Result<Self> {
        if header.payload_len() != payload.len() {
            return Err(JdwpError::Protocol(format!(
                "packet header announces {} payload bytes but {} are available",
                header.payload_len(),
                payload.len()
            )));
        }
        Ok(Self { header, payload })
    }

    /// Builds a view from parts already known to be consistent.
    pub(crate) fn from_parts(header: PacketHeader, payload: &'a [u8]) -> Self {
        debug_assert_eq!(header.payload_len(), payload.len());
        Self { header, payload }
    }

    /// Parses one complete frame from `frame`.
    pub fn parse(frame: &'a [u8], max_length: usize) -> Result<Self> {
        let Some(raw) = frame.get(..HEADER_LEN) else {
            return Err(JdwpError::Protocol(format!(
                "truncated JDWP header ({} bytes)",
                frame.len()
            )));
        };
        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(raw);
        let header = PacketHeader::decode(&header_bytes, max_length)?;
        let end = header.length as usize;
        let Some(payload) = frame.get(HEADER_LEN..end) else {
            return Err(JdwpError::Protocol(format!(
                "truncated JDWP packet: expected {end} bytes, got {}",
                frame.len()
            )));
        };
        Self::new(header, payload)
    }

    pub fn payload_slice(&self) -> &'a [u8] {
        self.payload
    }
}

impl Packet for JdwpPacketView<'_> {
    fn header(&self) -> &PacketHeader {
        &self.header
    }

    fn payload(&self) -> &[u8] {
        self.payload
    }

    fn is_thread_safe_and_immutable(&self) -> bool {
        false
    }
}

impl fmt::Debug for JdwpPacketView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_packet_summary(f, "JdwpPacketView", &self.header)
    }
}

/// A packet that owns its payload.
#[derive(Clone, PartialEq, Eq)]
pub struct JdwpPacket {
    header: PacketHeader,
    payload: Bytes,
}

impl JdwpPacket {
    pub fn command(
        id: u32,
        command_set: u8,
        command: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Self> {
        let payload = payload.into();
        Ok(Self {
            header: PacketHeader::command(id, command_set, command, payload.len())?,
            payload,
        })
    }

    pub fn reply(id: u32, error_code: u16, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        Ok(Self {
            header: PacketHeader::reply(id, error_code, payload.len())?,
            payload,
        })
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.header.id = id;
        self
    }

    pub fn as_view(&self) -> JdwpPacketView<'_> {
        JdwpPacketView {
            header: self.header,
            payload: &self.payload,
        }
    }

    pub fn payload_bytes(&self) -> &Bytes {
        &self.payload
    }
}

impl Packet for JdwpPacket {
    fn header(&self) -> &PacketHeader {
        &self.header
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn is_thread_safe_and_immutable(&self) -> bool {
        true
    }

    fn to_offline(&self) -> JdwpPacket {
        self.clone()
    }
}

impl fmt::Debug for JdwpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_packet_summary(f, "JdwpPacket", &self.header)
    }
}

fn write_packet_summary(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    header: &PacketHeader,
) -> fmt::Result {
    match header.kind {
        PacketKind::Command {
            command_set,
            command,
        } => write!(
            f,
            "{name}(id={}, length={}, cmdSet={command_set}, cmd={command})",
            header.id, header.length
        ),
        PacketKind::Reply { error_code } => write!(
            f,
            "{name}(id={}, length={}, errorCode={error_code})",
            header.id, header.length
        ),
    }
}
