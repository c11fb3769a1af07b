//! Request/reply helpers layered on [`SharedJdwpSession`].
//!
//! Every helper is an ordinary receiver: it sends its command from the
//! receiver's activation hook, so the reply cannot be missed, then waits for
//! the reply with the matching id.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use crate::ddms::{self, ddms_chunks, find_fail_chunk, DdmsChunkType, DdmsChunkView};
use crate::error::{JdwpError, Result};
use crate::packet::{JdwpPacket, JdwpPacketView, Packet};
use crate::shared::SharedJdwpSession;
use crate::wire::codec::JdwpWriter;

pub const VM_COMMAND_SET: u8 = 1;
pub const VM_EXIT_COMMAND: u8 = 10;

/// `MPSS` flag requesting allocation counting.
pub const MPSS_TRACE_COUNT_ALLOCS: u32 = 1;

/// Observer for the stages of a command round trip.
pub trait JdwpCommandProgress: Send + Sync {
    fn before_send(&self, _packet: &JdwpPacketView<'_>) {}

    fn after_send(&self, _packet: &JdwpPacketView<'_>) {}

    fn on_reply(&self, _packet: &JdwpPacketView<'_>) {}

    fn on_reply_timeout(&self) {}
}

impl SharedJdwpSession {
    /// Sends `command` and hands its reply to `on_reply`.
    ///
    /// The reply is still a live packet. Fails with [`JdwpError::Timeout`]
    /// after [`reply_timeout`](crate::shared::SharedJdwpSessionConfig::reply_timeout)
    /// and with [`JdwpError::NoSuchPacket`] if the session ends first.
    pub async fn handle_jdwp_command<R, F>(
        &self,
        command: &JdwpPacket,
        progress: Option<Arc<dyn JdwpCommandProgress>>,
        on_reply: F,
    ) -> Result<R>
    where
        F: FnOnce(&JdwpPacketView<'_>) -> Result<R>,
    {
        if !command.is_command() {
            return Err(JdwpError::InvalidArgument(
                "JDWP packet is not a command packet".to_string(),
            ));
        }

        let id = command.id();
        let name = format!("JDWP command {command:?}");
        let sender = self.clone();
        let packet = command.clone();
        let send_progress = progress.clone();
        let mut on_reply = Some(on_reply);

        let exchange = self
            .new_packet_receiver()
            .with_name(name)
            .with_activation(move || async move {
                tracing::debug!(
                    target = "nova.jdwp",
                    packet = ?packet,
                    "sending command packet and waiting for reply"
                );
                if let Some(progress) = &send_progress {
                    progress.before_send(&packet.as_view());
                }
                sender.send_packet(&packet).await?;
                if let Some(progress) = &send_progress {
                    progress.after_send(&packet.as_view());
                }
                Ok(())
            })
            .receive_map_first(|packet| {
                if !(packet.is_reply() && packet.id() == id) {
                    return Ok(ControlFlow::Continue(()));
                }
                tracing::debug!(target = "nova.jdwp", reply = ?packet, "received command reply");
                if let Some(progress) = &progress {
                    progress.on_reply(packet);
                }
                match on_reply.take() {
                    Some(on_reply) => on_reply(packet).map(ControlFlow::Break),
                    None => Err(JdwpError::Protocol(format!("duplicate reply for packet {id}"))),
                }
            });

        match tokio::time::timeout(self.config().reply_timeout, exchange).await {
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => Err(JdwpError::NoSuchPacket),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                tracing::debug!(target = "nova.jdwp", packet_id = id, "timed out waiting for reply");
                if let Some(progress) = &progress {
                    progress.on_reply_timeout();
                }
                Err(JdwpError::Timeout)
            }
        }
    }

    /// Sends a single-chunk DDMS command and hands the matching reply chunk to
    /// `on_reply`.
    ///
    /// A `FAIL` chunk in the reply becomes [`JdwpError::DdmsFail`]; a reply
    /// chunk of another type, or no chunk at all, is [`JdwpError::DdmsCommand`].
    pub async fn handle_ddms_command<R, F>(
        &self,
        chunk_type: DdmsChunkType,
        payload: &[u8],
        progress: Option<Arc<dyn JdwpCommandProgress>>,
        on_reply: F,
    ) -> Result<R>
    where
        F: FnOnce(DdmsChunkView<'_>) -> Result<R>,
    {
        let command = self.create_ddms_packet(chunk_type, payload)?;
        self.handle_jdwp_command(&command, progress, |reply| {
            process_ddms_reply(reply, chunk_type, on_reply)
        })
        .await
    }

    /// Sends a DDMS command that answers with an empty reply on success.
    pub async fn handle_ddms_command_with_empty_reply(
        &self,
        command: &JdwpPacket,
        chunk_type: DdmsChunkType,
        progress: Option<Arc<dyn JdwpCommandProgress>>,
    ) -> Result<()> {
        tracing::debug!(target = "nova.jdwp", chunk = %chunk_type, "invoking DDMS command");
        self.handle_jdwp_command(command, progress, |reply| {
            process_empty_ddms_reply(reply, chunk_type)
        })
        .await
    }

    /// Requests a garbage collection.
    pub async fn handle_ddms_hpgc(&self, progress: Option<Arc<dyn JdwpCommandProgress>>) -> Result<()> {
        let command = self.create_ddms_packet(DdmsChunkType::HPGC, &[])?;
        self.handle_ddms_command_with_empty_reply(&command, DdmsChunkType::HPGC, progress)
            .await
    }

    /// Enables or disables the allocation tracker.
    pub async fn handle_ddms_reae(
        &self,
        enabled: bool,
        progress: Option<Arc<dyn JdwpCommandProgress>>,
    ) -> Result<()> {
        let command = self.create_ddms_packet(DdmsChunkType::REAE, &[u8::from(enabled)])?;
        self.handle_ddms_command_with_empty_reply(&command, DdmsChunkType::REAE, progress)
            .await
    }

    /// Whether the allocation tracker is enabled.
    pub async fn handle_ddms_reaq(&self, progress: Option<Arc<dyn JdwpCommandProgress>>) -> Result<bool> {
        self.handle_ddms_command(DdmsChunkType::REAQ, &[], progress, |chunk| {
            first_byte(&chunk).map(|b| b != 0)
        })
        .await
    }

    /// Fetches the recent allocation list and hands its raw bytes to `on_reply`.
    pub async fn handle_ddms_real<R, F>(
        &self,
        progress: Option<Arc<dyn JdwpCommandProgress>>,
        on_reply: F,
    ) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        self.handle_ddms_command(DdmsChunkType::REAL, &[], progress, |chunk| {
            on_reply(chunk.payload)
        })
        .await
    }

    /// Queries the method profiling state.
    pub async fn handle_ddms_mprq(&self, progress: Option<Arc<dyn JdwpCommandProgress>>) -> Result<u8> {
        self.handle_ddms_command(DdmsChunkType::MPRQ, &[], progress, |chunk| first_byte(&chunk))
            .await
    }

    /// Builds a DDMS command packet with a freshly allocated id.
    pub fn create_ddms_packet(&self, chunk_type: DdmsChunkType, payload: &[u8]) -> Result<JdwpPacket> {
        let packet = ddms::create_ddms_packet(self.next_packet_id()?, chunk_type, payload)?;
        tracing::trace!(
            target = "nova.jdwp",
            session = %self.key(),
            chunk = %chunk_type,
            packet = ?packet,
            "created DDMS command packet"
        );
        Ok(packet)
    }

    /// Method profiling start (streaming).
    pub fn create_ddms_mpss(&self, buffer_size: u32, flags: u32) -> Result<JdwpPacket> {
        let mut w = JdwpWriter::with_capacity(8);
        w.write_u32(buffer_size);
        w.write_u32(flags);
        self.create_ddms_packet(DdmsChunkType::MPSS, &w.into_vec())
    }

    pub fn create_ddms_mpse(&self) -> Result<JdwpPacket> {
        self.create_ddms_packet(DdmsChunkType::MPSE, &[])
    }

    /// Sampling profiler start. The interval is sent in microseconds.
    pub fn create_ddms_spss(&self, buffer_size: u32, sampling_interval: Duration) -> Result<JdwpPacket> {
        let interval = u32::try_from(sampling_interval.as_micros()).map_err(|_| {
            JdwpError::InvalidArgument(format!(
                "sampling interval {sampling_interval:?} does not fit in 32 bits of microseconds"
            ))
        })?;
        let mut w = JdwpWriter::with_capacity(12);
        w.write_u32(buffer_size);
        w.write_u32(0);
        w.write_u32(interval);
        self.create_ddms_packet(DdmsChunkType::SPSS, &w.into_vec())
    }

    pub fn create_ddms_spse(&self) -> Result<JdwpPacket> {
        self.create_ddms_packet(DdmsChunkType::SPSE, &[])
    }

    /// Sends `VirtualMachine.Exit`. The VM does not reply.
    pub async fn send_vm_exit(&self, status: i32) -> Result<()> {
        let packet = JdwpPacket::command(
            self.next_packet_id()?,
            VM_COMMAND_SET,
            VM_EXIT_COMMAND,
            status.to_be_bytes().to_vec(),
        )?;
        self.send_packet(&packet).await
    }

    /// Sends a DDMS `EXIT` and waits until the process closes the connection.
    pub async fn send_ddms_exit(&self, status: i32) -> Result<()> {
        let packet = self.create_ddms_packet(DdmsChunkType::EXIT, &status.to_be_bytes())?;
        let sender = self.clone();
        self.new_packet_receiver()
            .with_name("send_ddms_exit")
            .with_activation(move || async move { sender.send_packet(&packet).await })
            .receive(|_| Ok::<_, JdwpError>(()))
            .await
    }
}

fn first_byte(chunk: &DdmsChunkView<'_>) -> Result<u8> {
    chunk.payload.first().copied().ok_or_else(|| {
        JdwpError::DdmsCommand(format!("DDMS reply '{}' has an empty payload", chunk.chunk_type))
    })
}

fn process_ddms_reply<R>(
    reply: &JdwpPacketView<'_>,
    chunk_type: DdmsChunkType,
    on_reply: impl FnOnce(DdmsChunkView<'_>) -> Result<R>,
) -> Result<R> {
    if let Some(fail) = find_fail_chunk(reply.payload()) {
        tracing::debug!(
            target = "nova.jdwp",
            chunk = %chunk_type,
            code = fail.code,
            message = %fail.message,
            "DDMS command failed"
        );
        return Err(fail.into_error());
    }

    match ddms_chunks(reply.payload()).next() {
        Some(Ok(chunk)) if chunk.chunk_type == chunk_type => on_reply(chunk),
        Some(Ok(chunk)) => {
            let message = format!(
                "DDMS reply '{}' does not match DDMS command '{chunk_type}'",
                chunk.chunk_type
            );
            tracing::warn!(target = "nova.jdwp", "{message}");
            Err(JdwpError::DdmsCommand(message))
        }
        Some(Err(err)) => Err(JdwpError::DdmsCommand(format!(
            "malformed reply to DDMS command '{chunk_type}': {err}"
        ))),
        None => {
            let message = format!("unexpected empty reply to DDMS command '{chunk_type}'");
            tracing::warn!(target = "nova.jdwp", "{message}");
            Err(JdwpError::DdmsCommand(message))
        }
    }
}

fn process_empty_ddms_reply(reply: &JdwpPacketView<'_>, chunk_type: DdmsChunkType) -> Result<()> {
    if let Some(fail) = find_fail_chunk(reply.payload()) {
        tracing::debug!(
            target = "nova.jdwp",
            chunk = %chunk_type,
            code = fail.code,
            message = %fail.message,
            "DDMS command failed"
        );
        return Err(fail.into_error());
    }

    if reply.payload().is_empty() {
        return Ok(());
    }
    let message = format!(
        "the reply to DDMS command '{chunk_type}' should be empty but contained {} bytes",
        reply.payload().len()
    );
    tracing::warn!(target = "nova.jdwp", "{message}");
    Err(JdwpError::DdmsCommand(message))
}
