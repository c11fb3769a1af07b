//! Multiplexed JDWP sessions.
//!
//! A single debug connection to an Android process is wrapped in a
//! [`SharedJdwpSession`] so that any number of consumers (debuggers,
//! profilers, DDMS helpers) can send commands and observe traffic at the same
//! time:
//!
//! * [`JdwpSession`] owns the socket, the handshake and frame I/O.
//! * [`SharedJdwpSession`] runs the single read loop and dispatches every
//!   packet to the active [`JdwpPacketReceiver`]s, one at a time.
//! * Filters ([`SharedJdwpSessionFilter`]) decide what a bound receiver sees;
//!   monitors ([`SharedJdwpSessionMonitor`]) observe all traffic.
//! * [`SharedJdwpSessionRegistry`] keeps one session per `(device, pid)` and
//!   the factory lists sessions are built from.
//!
//! All logging uses the `nova.jdwp` tracing target.

pub mod commands;
pub mod ddms;
pub mod error;
pub mod packet;
pub mod registry;
pub mod session;
pub mod shared;
pub mod wire;

/// Size of the fixed JDWP packet header.
pub const JDWP_HEADER_LEN: usize = 11;

/// Default upper bound on the advertised length of an incoming frame.
pub const MAX_JDWP_PACKET_BYTES: usize = 64 * 1024 * 1024;

pub use commands::JdwpCommandProgress;
pub use ddms::{no_ddms_filter_id, DdmsChunkType, NoDdmsPacketFilter};
pub use error::{JdwpError, Result};
pub use packet::{JdwpPacket, JdwpPacketView, Packet, PacketHeader, PacketKind};
pub use registry::{SessionKey, SharedJdwpSessionRegistry, SharedJdwpSessionRegistryConfig};
pub use session::{HandshakeRole, HandshakeState, JdwpSession, JdwpSessionConfig};
pub use shared::{
    FilterId, JdwpPacketReceiver, PacketStream, PipelineFactories, SessionState,
    SharedJdwpSession, SharedJdwpSessionConfig, SharedJdwpSessionFilter,
    SharedJdwpSessionFilterFactory, SharedJdwpSessionMonitor, SharedJdwpSessionMonitorFactory,
    Termination, TracingPacketMonitor,
};
