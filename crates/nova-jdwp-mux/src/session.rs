//! The physical JDWP connection: one reader, one writer, one handshake.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::{JdwpError, Result};
use crate::packet::{JdwpPacketView, Packet, PacketHeader};
use crate::wire::codec::{HANDSHAKE, HEADER_LEN};
use crate::wire::poison;

/// First id handed out by [`JdwpSession::next_packet_id`] unless configured
/// otherwise. Sits far above the ids a typical debugger allocates so commands
/// originated here do not collide with an external debugger sharing the link.
pub const DEFAULT_PACKET_ID_BASE: u32 = 0x4000_0000;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which side of the connection this session plays during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Sends `JDWP-Handshake` and waits for the peer to echo it.
    Debugger,
    /// Waits for `JDWP-Handshake` and echoes it back.
    Vm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    Handshaking,
    Established,
    Closed,
}

#[derive(Debug, Clone)]
pub struct JdwpSessionConfig {
    pub role: HandshakeRole,
    /// Base for locally allocated packet ids. `None` makes the session a pure
    /// pass-through that cannot originate commands.
    pub next_packet_id_base: Option<u32>,
    pub handshake_timeout: Duration,
    pub max_packet_length: usize,
}

impl Default for JdwpSessionConfig {
    fn default() -> Self {
        Self {
            role: HandshakeRole::Debugger,
            next_packet_id_base: Some(DEFAULT_PACKET_ID_BASE),
            handshake_timeout: Duration::from_secs(5),
            max_packet_length: crate::MAX_JDWP_PACKET_BYTES,
        }
    }
}

/// A single JDWP connection.
///
/// Sends are serialized by an internal lock so frames never interleave. Only
/// one task should call [`JdwpSession::receive_packet`]; a receive that is
/// dropped mid-frame leaves the stream unsynchronized.
pub struct JdwpSession {
    reader: tokio::sync::Mutex<BoxedReader>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    handshake_gate: tokio::sync::Mutex<()>,
    state: Mutex<HandshakeState>,
    next_id: Option<AtomicU32>,
    shutdown: CancellationToken,
    config: JdwpSessionConfig,
}

impl JdwpSession {
    pub fn new<S>(stream: S, config: JdwpSessionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(Box::new(reader), Box::new(writer), config)
    }

    pub fn from_tcp(stream: TcpStream, config: JdwpSessionConfig) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self::from_parts(Box::new(reader), Box::new(writer), config)
    }

    pub async fn connect(
        addr: impl tokio::net::ToSocketAddrs,
        config: JdwpSessionConfig,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_tcp(stream, config))
    }

    fn from_parts(reader: BoxedReader, writer: BoxedWriter, config: JdwpSessionConfig) -> Self {
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            handshake_gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(HandshakeState::NotStarted),
            next_id: config.next_packet_id_base.map(AtomicU32::new),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn config(&self) -> &JdwpSessionConfig {
        &self.config
    }

    pub fn state(&self) -> HandshakeState {
        *poison::lock(&self.state, "JdwpSession.state")
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Allocates the next packet id for a command originated by this session.
    pub fn next_packet_id(&self) -> Result<u32> {
        let counter = self.next_id.as_ref().ok_or(JdwpError::Unsupported(
            "this JDWP session was not configured with a packet id base",
        ))?;
        Ok(counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Writes one full frame. Not cancel safe: dropping the future part way
    /// through the write corrupts the stream for every other user.
    pub async fn send_packet<P>(&self, packet: &P) -> Result<()>
    where
        P: Packet + ?Sized,
    {
        self.ensure_handshake().await?;
        let frame = packet.encode();

        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(JdwpError::Closed),
            res = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            } => {
                if let Err(err) = res {
                    self.fail();
                    return Err(err.into());
                }
                Ok(())
            }
        }
    }

    /// Reads the next frame into `buf` and returns a view over it.
    ///
    /// A clean EOF on a frame boundary yields [`JdwpError::EndOfStream`]. EOF in
    /// the middle of a frame, or a malformed header, is a protocol error and
    /// closes the session.
    pub async fn receive_packet<'b>(&self, buf: &'b mut Vec<u8>) -> Result<JdwpPacketView<'b>> {
        self.ensure_handshake().await?;

        let mut reader = self.reader.lock().await;
        let mut raw = [0u8; HEADER_LEN];
        let header = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(JdwpError::Closed),
            res = read_frame_start(&mut *reader, &mut raw) => {
                match res {
                    Ok(true) => {}
                    Ok(false) => return Err(JdwpError::EndOfStream),
                    Err(err) => {
                        self.fail();
                        return Err(err);
                    }
                }
                match PacketHeader::decode(&raw, self.config.max_packet_length) {
                    Ok(header) => header,
                    Err(err) => {
                        self.fail();
                        return Err(err);
                    }
                }
            }
        };

        buf.clear();
        buf.resize(header.payload_len(), 0);
        tokio::select! {
            _ = self.shutdown.cancelled() => return Err(JdwpError::Closed),
            res = reader.read_exact(buf.as_mut_slice()) => {
                if let Err(err) = res {
                    self.fail();
                    return Err(if err.kind() == std::io::ErrorKind::UnexpectedEof {
                        JdwpError::Protocol(format!(
                            "connection closed inside a JDWP packet (id={}, length={})",
                            header.id, header.length
                        ))
                    } else {
                        err.into()
                    });
                }
            }
        }

        let payload: &'b [u8] = buf.as_slice();
        JdwpPacketView::new(header, payload)
    }

    /// Half-closes the write side so the peer observes EOF.
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    /// Closes the session. Pending and future sends/receives fail promptly with
    /// [`JdwpError::Closed`].
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!(target = "nova.jdwp", "closing JDWP session");
        }
        self.fail();
    }

    fn fail(&self) {
        *poison::lock(&self.state, "JdwpSession.fail") = HandshakeState::Closed;
        self.shutdown.cancel();
    }

    async fn ensure_handshake(&self) -> Result<()> {
        let _gate = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(JdwpError::Closed),
            gate = self.handshake_gate.lock() => gate,
        };

        {
            let mut state = poison::lock(&self.state, "JdwpSession.ensure_handshake");
            match *state {
                HandshakeState::Established => return Ok(()),
                HandshakeState::Closed => return Err(JdwpError::Closed),
                HandshakeState::NotStarted | HandshakeState::Handshaking => {
                    *state = HandshakeState::Handshaking;
                }
            }
        }

        let res = tokio::select! {
            _ = self.shutdown.cancelled() => Err(JdwpError::Closed),
            res = tokio::time::timeout(self.config.handshake_timeout, self.exchange_handshake()) => {
                match res {
                    Ok(res) => res,
                    Err(_elapsed) => Err(JdwpError::Timeout),
                }
            }
        };

        match res {
            Ok(()) => {
                *poison::lock(&self.state, "JdwpSession.ensure_handshake") =
                    HandshakeState::Established;
                tracing::debug!(
                    target = "nova.jdwp",
                    role = ?self.config.role,
                    "JDWP handshake established"
                );
                Ok(())
            }
            Err(err) => {
                tracing::debug!(target = "nova.jdwp", error = %err, "JDWP handshake failed");
                self.fail();
                Err(match err {
                    JdwpError::Closed | JdwpError::HandshakeFailed(_) => err,
                    other => JdwpError::HandshakeFailed(other.to_string()),
                })
            }
        }
    }

    async fn exchange_handshake(&self) -> Result<()> {
        match self.config.role {
            HandshakeRole::Debugger => {
                self.write_handshake().await?;
                self.read_handshake().await
            }
            HandshakeRole::Vm => {
                self.read_handshake().await?;
                self.write_handshake().await
            }
        }
    }

    async fn write_handshake(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(HANDSHAKE).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake(&self) -> Result<()> {
        let mut reader = self.reader.lock().await;
        let mut buf = [0u8; HANDSHAKE.len()];
        reader.read_exact(&mut buf).await.map_err(|err| {
            JdwpError::HandshakeFailed(format!("failed to read handshake: {err}"))
        })?;
        if buf != HANDSHAKE {
            return Err(JdwpError::HandshakeFailed(format!(
                "unexpected handshake bytes {:?}",
                String::from_utf8_lossy(&buf)
            )));
        }
        Ok(())
    }
}

impl Drop for JdwpSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Reads a frame header. Returns `Ok(false)` on EOF before the first byte.
async fn read_frame_start<R>(reader: &mut R, raw: &mut [u8; HEADER_LEN]) -> Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut raw[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(JdwpError::Protocol(format!(
                "connection closed inside a JDWP header ({filled} of {HEADER_LEN} bytes)"
            )));
        }
        filled += n;
    }
    Ok(true)
}
