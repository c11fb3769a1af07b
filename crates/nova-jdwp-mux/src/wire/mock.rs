use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener,
    },
};
use tokio_util::sync::CancellationToken;

use super::codec::{encode_reply, HANDSHAKE, HEADER_LEN};
use crate::ddms::{ddms_chunks, encode_chunk, is_ddms_command, DdmsChunkType, DdmsFailChunk};
use crate::packet::{JdwpPacket, Packet, PacketHeader, PacketKind};

/// A scripted Android VM peer listening on localhost.
///
/// It accepts a single debugger connection, echoes the JDWP handshake and
/// answers every command: with the configured reply when there is one,
/// otherwise with an empty successful reply. `VirtualMachine.Exit` and DDMS
/// `EXIT` close the connection without replying, like a process that exits.
pub struct MockJdwpVm {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug, Default)]
pub struct MockJdwpVmConfig {
    /// Replies keyed by `(command_set, command)`.
    pub replies: HashMap<(u8, u8), MockReply>,
    /// Replies to DDMS commands keyed by the command's first chunk type.
    pub ddms_replies: HashMap<DdmsChunkType, MockDdmsReply>,
    /// Reply delays keyed by `(command_set, command)`.
    ///
    /// The VM keeps serving other commands while a delayed reply is pending.
    pub delayed_replies: Vec<DelayedReply>,
}

#[derive(Clone, Debug, Default)]
pub struct MockReply {
    pub error_code: u16,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug)]
pub enum MockDdmsReply {
    /// An empty JDWP reply, which is how most DDMS commands acknowledge.
    Empty,
    Chunk {
        chunk_type: DdmsChunkType,
        payload: Vec<u8>,
    },
    Fail(DdmsFailChunk),
    /// Never reply.
    Ignore,
}

#[derive(Clone, Debug)]
pub struct DelayedReply {
    pub command_set: u8,
    pub command: u8,
    pub delay: Duration,
}

impl MockJdwpVm {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(Default::default()).await
    }

    pub async fn spawn_with_config(config: MockJdwpVmConfig) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State::new(config));
        let task_shutdown = shutdown.clone();
        let task_state = state.clone();

        tokio::spawn(async move {
            let _ = run(listener, task_state.clone(), task_shutdown).await;
            task_state.disconnected.cancel();
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Resolves once the debugger has connected and completed the handshake.
    pub async fn wait_connected(&self) {
        self.state.connected.cancelled().await;
    }

    /// Resolves once the VM stopped reading: the debugger reached EOF on its
    /// write side, or the connection was closed.
    pub async fn wait_disconnected(&self) {
        self.state.disconnected.cancelled().await;
    }

    /// Writes `packet` to the debugger as-is, after the handshake completed.
    pub async fn emit(&self, packet: &JdwpPacket) -> std::io::Result<()> {
        self.emit_raw(&packet.encode()).await
    }

    /// Writes raw bytes, which may be a malformed frame.
    pub async fn emit_raw(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.wait_connected().await;
        let mut writer = self.state.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        writer.write_all(bytes).await
    }

    /// Closes the connection on a frame boundary; the debugger sees EOF.
    pub async fn close_connection(&self) {
        close(&self.state, &self.shutdown).await;
    }

    /// Every packet the debugger sent, in arrival order.
    pub async fn received_commands(&self) -> Vec<JdwpPacket> {
        self.state.received.lock().await.clone()
    }
}

impl Drop for MockJdwpVm {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct State {
    config: MockJdwpVmConfig,
    delayed_replies: HashMap<(u8, u8), Duration>,
    connected: CancellationToken,
    disconnected: CancellationToken,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    received: tokio::sync::Mutex<Vec<JdwpPacket>>,
}

impl State {
    fn new(config: MockJdwpVmConfig) -> Self {
        let delayed_replies = config
            .delayed_replies
            .iter()
            .map(|reply| ((reply.command_set, reply.command), reply.delay))
            .collect();
        Self {
            config,
            delayed_replies,
            connected: CancellationToken::new(),
            disconnected: CancellationToken::new(),
            writer: tokio::sync::Mutex::new(None),
            received: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    fn reply_delay(&self, command_set: u8, command: u8) -> Option<Duration> {
        self.delayed_replies.get(&(command_set, command)).copied()
    }
}

async fn close(state: &State, shutdown: &CancellationToken) {
    if let Some(mut writer) = state.writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }
    shutdown.cancel();
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accept = listener.accept() => {
            let (mut socket, _) = accept?;

            // Handshake: debugger -> "JDWP-Handshake", VM echoes back.
            let mut hs = [0u8; HANDSHAKE.len()];
            socket.read_exact(&mut hs).await?;
            if hs != *HANDSHAKE {
                return Ok(());
            }
            socket.write_all(HANDSHAKE).await?;

            let (mut reader, writer) = socket.into_split();
            *state.writer.lock().await = Some(writer);
            state.connected.cancel();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    res = read_packet(&mut reader) => {
                        let Some(packet) = res? else {
                            return Ok(());
                        };
                        handle_packet(&state, packet, &shutdown).await?;
                    }
                }
            }
        }
    }
}

async fn read_packet(socket: &mut OwnedReadHalf) -> std::io::Result<Option<JdwpPacket>> {
    let mut header = [0u8; HEADER_LEN];
    match socket.read_exact(&mut header).await {
        Ok(_n) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let Ok(header) = PacketHeader::decode(&header, crate::MAX_JDWP_PACKET_BYTES) else {
        return Ok(None);
    };
    let mut payload = vec![0u8; header.payload_len()];
    socket.read_exact(&mut payload).await?;

    let packet = match header.kind {
        PacketKind::Command {
            command_set,
            command,
        } => JdwpPacket::command(header.id, command_set, command, payload),
        PacketKind::Reply { error_code } => {
            JdwpPacket::reply(header.id, error_code, payload)
        }
    };
    Ok(packet.ok())
}

async fn handle_packet(
    state: &Arc<State>,
    packet: JdwpPacket,
    shutdown: &CancellationToken,
) -> std::io::Result<()> {
    state.received.lock().await.push(packet.clone());

    let (Some(command_set), Some(command)) = (packet.command_set(), packet.command()) else {
        // Replies from the debugger need no answer.
        return Ok(());
    };

    let reply = if is_ddms_command(&packet) {
        let chunk_type = ddms_chunks(packet.payload())
            .next()
            .and_then(|chunk| chunk.ok())
            .map(|chunk| chunk.chunk_type);
        if chunk_type == Some(DdmsChunkType::EXIT) {
            close(state, shutdown).await;
            return Ok(());
        }
        let configured = chunk_type.and_then(|chunk_type| state.config.ddms_replies.get(&chunk_type));
        match configured.unwrap_or(&MockDdmsReply::Empty) {
            MockDdmsReply::Empty => encode_reply(packet.id(), 0, &[]),
            MockDdmsReply::Chunk {
                chunk_type,
                payload,
            } => encode_reply(packet.id(), 0, &encode_chunk(*chunk_type, payload)),
            MockDdmsReply::Fail(fail) => encode_reply(
                packet.id(),
                0,
                &encode_chunk(DdmsChunkType::FAIL, &fail.encode()),
            ),
            MockDdmsReply::Ignore => return Ok(()),
        }
    } else {
        // VirtualMachine.Exit
        if (command_set, command) == (1, 10) {
            close(state, shutdown).await;
            return Ok(());
        }
        match state.config.replies.get(&(command_set, command)) {
            Some(reply) => encode_reply(packet.id(), reply.error_code, &reply.payload),
            None => encode_reply(packet.id(), 0, &[]),
        }
    };

    write_reply(state, reply, state.reply_delay(command_set, command), shutdown.clone()).await
}

async fn write_reply(
    state: &Arc<State>,
    reply: Vec<u8>,
    delay: Option<Duration>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let delay = delay.filter(|d| !d.is_zero());
    if let Some(delay) = delay {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(writer) = state.writer.lock().await.as_mut() {
                        let _ = writer.write_all(&reply).await;
                    }
                }
            }
        });
        return Ok(());
    }

    match state.writer.lock().await.as_mut() {
        Some(writer) => writer.write_all(&reply).await,
        None => Ok(()),
    }
}
