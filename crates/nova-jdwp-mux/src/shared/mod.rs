//! One JDWP connection shared by any number of concurrent packet receivers.
//!
//! A single read loop owns the read side of the [`JdwpSession`]. Every packet
//! it reads is offered to the registered receivers one at a time, in
//! registration order; the loop waits for each receiver to finish with the
//! packet before offering it to the next one, and before reading the next
//! frame. Receiver callbacks, filters and monitors all run under one dispatch
//! permit, so none of them ever run concurrently for a given session.
//!
//! Once started, the loop keeps reading while no receiver is registered, so a
//! peer that disconnects is noticed promptly. A session that never had a
//! receiver reads nothing and stays `Idle`.

mod pipeline;
mod receiver;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

use crate::error::{JdwpError, Result};
use crate::packet::{JdwpPacket, JdwpPacketView, Packet, PacketHeader};
use crate::registry::SessionKey;
use crate::session::JdwpSession;
use crate::wire::poison;

pub use pipeline::{
    FilterId, PipelineFactories, SharedJdwpSessionFilter, SharedJdwpSessionFilterFactory,
    SharedJdwpSessionMonitor, SharedJdwpSessionMonitorFactory, TracingPacketMonitor,
};
pub use receiver::{JdwpPacketReceiver, PacketStream};

use pipeline::Pipeline;

#[derive(Debug, Clone)]
pub struct SharedJdwpSessionConfig {
    /// Maximum number of replay packets. `None` keeps every packet.
    pub replay_capacity: Option<usize>,
    /// How long the command helpers wait for a reply.
    pub reply_timeout: Duration,
}

impl Default for SharedJdwpSessionConfig {
    fn default() -> Self {
        Self {
            replay_capacity: None,
            reply_timeout: Duration::from_secs(10),
        }
    }
}

/// Why a shared session stopped reading.
#[derive(Debug, Clone)]
pub enum Termination {
    /// The peer closed the connection on a frame boundary.
    Eof,
    Failed(JdwpError),
}

impl Termination {
    pub fn is_eof(&self) -> bool {
        matches!(self, Termination::Eof)
    }

    /// The result a receiver reports when the session ends this way.
    pub fn to_result(&self) -> Result<()> {
        match self {
            Termination::Eof => Ok(()),
            Termination::Failed(err) => Err(err.clone()),
        }
    }

    /// The error reported to operations that needed the session to stay alive.
    pub fn to_error(&self) -> JdwpError {
        match self {
            Termination::Eof => JdwpError::EndOfStream,
            Termination::Failed(err) => err.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionState {
    /// No receiver was ever activated; nothing has been read.
    Idle,
    Running,
    Terminated(Termination),
}

/// A cloneable handle to a shared JDWP session.
///
/// When the last handle (including the ones held by active receivers) is
/// dropped, the session is closed.
#[derive(Clone)]
pub struct SharedJdwpSession {
    inner: Arc<Inner>,
    _owner: Arc<DropGuard>,
}

struct Inner {
    key: SessionKey,
    session: Arc<JdwpSession>,
    config: SharedJdwpSessionConfig,
    filter_ids: Vec<FilterId>,
    core: Mutex<Core>,
    pipeline: tokio::sync::Mutex<Pipeline>,
    receivers_changed: Notify,
    closing: CancellationToken,
    terminated: CancellationToken,
}

struct Core {
    state: SessionState,
    receivers: Vec<ReceiverSlot>,
    next_receiver_id: u64,
    replay: Vec<JdwpPacket>,
    read_loop: Option<JoinHandle<()>>,
}

struct ReceiverSlot {
    id: u64,
    name: Arc<str>,
    filter: Option<usize>,
    deliveries: mpsc::Sender<Delivery>,
}

pub(crate) enum Delivery {
    Packet(FrameLease),
    Terminated(Termination),
}

/// Loan of the read loop's current frame to one receiver.
///
/// Dropping the lease tells the loop the receiver is done with the frame.
/// `frame` is declared before `_done` so the buffer reference is released
/// before the loop wakes up and reuses it.
pub(crate) struct FrameLease {
    header: PacketHeader,
    frame: Arc<Vec<u8>>,
    _done: oneshot::Sender<()>,
}

impl FrameLease {
    pub(crate) fn view(&self) -> JdwpPacketView<'_> {
        JdwpPacketView::from_parts(self.header, &self.frame)
    }
}

/// What a receiver gets when it attaches to the session.
pub(crate) enum Attachment {
    Live {
        id: u64,
        replay: VecDeque<JdwpPacket>,
        deliveries: mpsc::Receiver<Delivery>,
    },
    /// The session already terminated: replay, then report `termination`.
    Ended {
        replay: VecDeque<JdwpPacket>,
        termination: Termination,
    },
}

impl SharedJdwpSession {
    pub fn new(
        key: SessionKey,
        session: JdwpSession,
        config: SharedJdwpSessionConfig,
        factories: &PipelineFactories,
    ) -> Self {
        let pipeline = Pipeline::new(&key, factories);
        let filter_ids = pipeline.filter_ids();
        let closing = CancellationToken::new();
        let inner = Arc::new(Inner {
            key,
            session: Arc::new(session),
            config,
            filter_ids,
            core: Mutex::new(Core {
                state: SessionState::Idle,
                receivers: Vec::new(),
                next_receiver_id: 0,
                replay: Vec::new(),
                read_loop: None,
            }),
            pipeline: tokio::sync::Mutex::new(pipeline),
            receivers_changed: Notify::new(),
            closing: closing.clone(),
            terminated: CancellationToken::new(),
        });
        Self {
            inner,
            _owner: Arc::new(closing.drop_guard()),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.inner.key
    }

    pub fn config(&self) -> &SharedJdwpSessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        poison::lock(&self.inner.core, "SharedJdwpSession.state")
            .state
            .clone()
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state(), SessionState::Terminated(_))
    }

    /// Allocates a packet id for a command originated through this session.
    pub fn next_packet_id(&self) -> Result<u32> {
        self.inner.session.next_packet_id()
    }

    /// Sends `packet` to the peer.
    ///
    /// Filters and monitors observe the packet first. The write itself runs on
    /// its own task, so dropping this future never leaves a partial frame on
    /// the connection.
    pub async fn send_packet<P>(&self, packet: &P) -> Result<()>
    where
        P: Packet + ?Sized,
    {
        if let Some(termination) = self.inner.termination() {
            return Err(termination.to_error());
        }

        let packet = packet.to_offline();
        let inner = self.inner.clone();
        let send = tokio::spawn(async move {
            inner.pipeline.lock().await.before_send(&packet.as_view());
            inner.session.send_packet(&packet).await
        });

        let result = match send.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(JdwpError::Cancelled),
        };
        result.map_err(|err| match (&err, self.inner.termination()) {
            // The connection was closed because the session ended; report why.
            (JdwpError::Closed, Some(termination)) => termination.to_error(),
            _ => err,
        })
    }

    /// Starts configuring a new receiver. Nothing happens until one of its
    /// consuming methods is called.
    pub fn new_packet_receiver(&self) -> JdwpPacketReceiver {
        JdwpPacketReceiver::new(self.clone())
    }

    /// Stores an owned copy of `packet`; receivers activated from now on see
    /// it before any live packet.
    pub fn add_replay_packet<P>(&self, packet: &P) -> Result<()>
    where
        P: Packet + ?Sized,
    {
        let mut core = poison::lock(&self.inner.core, "SharedJdwpSession.add_replay_packet");
        if let Some(capacity) = self.inner.config.replay_capacity {
            if core.replay.len() >= capacity {
                return Err(JdwpError::ReplayBufferFull { capacity });
            }
        }
        tracing::trace!(
            target = "nova.jdwp",
            session = %self.inner.key,
            packet = ?packet.header(),
            "adding replay packet"
        );
        core.replay.push(packet.to_offline());
        Ok(())
    }

    /// Closes the session and waits for every receiver to be notified.
    pub async fn close(&self) {
        let read_loop = poison::lock(&self.inner.core, "SharedJdwpSession.close")
            .read_loop
            .take();
        self.inner.closing.cancel();
        self.inner.session.close();
        match read_loop {
            Some(handle) => {
                let _ = handle.await;
            }
            None => {
                self.inner
                    .terminate(Termination::Failed(JdwpError::Closed))
                    .await
            }
        }
    }

    /// Half-closes the connection's write side so the peer observes EOF.
    ///
    /// Reading continues; the session terminates once the peer closes its
    /// side in turn.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.session.shutdown().await
    }

    /// Waits until the session has terminated and every receiver active at
    /// that point has been handed the cause.
    pub async fn wait_terminated(&self) -> Termination {
        self.inner.terminated.cancelled().await;
        self.inner
            .termination()
            .unwrap_or(Termination::Failed(JdwpError::Closed))
    }

    pub(crate) fn resolve_filter(&self, id: &FilterId) -> Option<usize> {
        self.inner.filter_ids.iter().position(|filter| filter == id)
    }

    pub(crate) fn attach(&self, name: &Arc<str>, filter: Option<usize>) -> Attachment {
        self.inner.attach(name, filter)
    }

    pub(crate) fn detach(&self, id: u64) {
        self.inner.detach(id)
    }

    pub(crate) fn pipeline(&self) -> &tokio::sync::Mutex<Pipeline> {
        &self.inner.pipeline
    }
}

impl fmt::Debug for SharedJdwpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedJdwpSession")
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // A session that never started its read loop is never terminated.
        self.pipeline.get_mut().close();
    }
}

impl Inner {
    fn termination(&self) -> Option<Termination> {
        match &poison::lock(&self.core, "SharedJdwpSession.termination").state {
            SessionState::Terminated(termination) => Some(termination.clone()),
            SessionState::Idle | SessionState::Running => None,
        }
    }

    fn attach(self: &Arc<Self>, name: &Arc<str>, filter: Option<usize>) -> Attachment {
        let mut core = poison::lock(&self.core, "SharedJdwpSession.attach");
        let replay: VecDeque<JdwpPacket> = core.replay.iter().cloned().collect();

        if let SessionState::Terminated(termination) = &core.state {
            return Attachment::Ended {
                replay,
                termination: termination.clone(),
            };
        }

        let id = core.next_receiver_id;
        core.next_receiver_id += 1;
        // At most one lease is ever queued, which leaves room for the
        // termination notice.
        let (tx, rx) = mpsc::channel(2);
        core.receivers.push(ReceiverSlot {
            id,
            name: name.clone(),
            filter,
            deliveries: tx,
        });

        if matches!(core.state, SessionState::Idle) {
            core.state = SessionState::Running;
            let span = tracing::debug_span!(
                target: "nova.jdwp",
                "shared_jdwp_read_loop",
                session = %self.key
            );
            core.read_loop = Some(tokio::spawn(self.clone().run_read_loop().instrument(span)));
            tracing::debug!(
                target = "nova.jdwp",
                session = %self.key,
                "started shared JDWP read loop"
            );
        }
        let active = core.receivers.len();
        drop(core);

        self.receivers_changed.notify_one();
        tracing::debug!(
            target = "nova.jdwp",
            session = %self.key,
            receiver = %name,
            receiver_id = id,
            active,
            replay = replay.len(),
            "registered JDWP packet receiver"
        );
        Attachment::Live {
            id,
            replay,
            deliveries: rx,
        }
    }

    fn detach(&self, id: u64) {
        let mut core = poison::lock(&self.core, "SharedJdwpSession.detach");
        let before = core.receivers.len();
        core.receivers.retain(|slot| slot.id != id);
        if core.receivers.len() != before {
            tracing::debug!(
                target = "nova.jdwp",
                session = %self.key,
                receiver_id = id,
                active = core.receivers.len(),
                "deregistered JDWP packet receiver"
            );
        }
    }

    async fn run_read_loop(self: Arc<Self>) {
        let termination = self.read_packets().await;
        self.terminate(termination).await;
    }

    async fn read_packets(&self) -> Termination {
        let mut frame = Arc::new(Vec::new());
        loop {
            // Read before waiting for receivers so a peer that goes away while
            // nobody listens still terminates the session. The frame is held
            // until a receiver shows up.
            let header = {
                let buf = Arc::make_mut(&mut frame);
                let received = tokio::select! {
                    _ = self.closing.cancelled() => Err(JdwpError::Closed),
                    res = self.session.receive_packet(buf) => res.map(|packet| *packet.header()),
                };
                match received {
                    Ok(header) => header,
                    Err(JdwpError::EndOfStream) => return Termination::Eof,
                    Err(err) => return Termination::Failed(err),
                }
            };

            if let Err(termination) = self.wait_for_receivers().await {
                return termination;
            }
            self.dispatch(header, &frame).await;
        }
    }

    async fn wait_for_receivers(&self) -> std::result::Result<(), Termination> {
        loop {
            let notified = self.receivers_changed.notified();
            if !poison::lock(&self.core, "SharedJdwpSession.wait_for_receivers")
                .receivers
                .is_empty()
            {
                return Ok(());
            }
            tokio::select! {
                _ = notified => {}
                _ = self.closing.cancelled() => {
                    return Err(Termination::Failed(JdwpError::Closed));
                }
            }
        }
    }

    /// Offers one frame to every receiver, then runs the pipeline bookkeeping.
    async fn dispatch(&self, header: PacketHeader, frame: &Arc<Vec<u8>>) {
        let targets: Vec<(u64, Arc<str>, Option<usize>, mpsc::Sender<Delivery>)> =
            poison::lock(&self.core, "SharedJdwpSession.dispatch")
                .receivers
                .iter()
                .map(|slot| {
                    (
                        slot.id,
                        slot.name.clone(),
                        slot.filter,
                        slot.deliveries.clone(),
                    )
                })
                .collect();

        for (id, name, filter, deliveries) in targets {
            if filter.is_some() {
                let view = JdwpPacketView::from_parts(header, frame);
                if !self.pipeline.lock().await.accepts(filter, &view) {
                    tracing::trace!(
                        target = "nova.jdwp",
                        receiver = %name,
                        packet_id = header.id,
                        "packet rejected by receiver filter"
                    );
                    continue;
                }
            }

            let (done_tx, done_rx) = oneshot::channel();
            let lease = FrameLease {
                header,
                frame: frame.clone(),
                _done: done_tx,
            };
            // A receiver that stops polling must not keep `close` waiting.
            let delivered = tokio::select! {
                res = deliveries.send(Delivery::Packet(lease)) => res.is_ok(),
                _ = self.closing.cancelled() => return,
            };
            if !delivered {
                // The receiver went away; its own guard deregisters it.
                continue;
            }
            tokio::select! {
                _ = done_rx => {}
                _ = self.closing.cancelled() => return,
            }
            tracing::trace!(
                target = "nova.jdwp",
                receiver = %name,
                receiver_id = id,
                packet_id = header.id,
                "packet dispatched"
            );
        }

        let view = JdwpPacketView::from_parts(header, frame);
        self.pipeline.lock().await.after_receive(&view);
    }

    async fn terminate(&self, termination: Termination) {
        let receivers = {
            let mut core = poison::lock(&self.core, "SharedJdwpSession.terminate");
            if let SessionState::Terminated(_) = core.state {
                return;
            }
            core.state = SessionState::Terminated(termination.clone());
            std::mem::take(&mut core.receivers)
        };

        match &termination {
            Termination::Eof => tracing::debug!(
                target = "nova.jdwp",
                session = %self.key,
                receivers = receivers.len(),
                "shared JDWP session reached end of stream"
            ),
            Termination::Failed(err) => tracing::debug!(
                target = "nova.jdwp",
                session = %self.key,
                receivers = receivers.len(),
                error = %err,
                "shared JDWP session failed"
            ),
        }

        self.session.close();
        for slot in receivers {
            let _ = slot
                .deliveries
                .try_send(Delivery::Terminated(termination.clone()));
        }
        self.pipeline.lock().await.close();
        self.terminated.cancel();
    }
}
