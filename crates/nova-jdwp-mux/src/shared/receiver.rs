use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Attachment, Delivery, FilterId, SharedJdwpSession, Termination};
use crate::error::{JdwpError, Result};
use crate::packet::{JdwpPacket, JdwpPacketView, Packet};

/// Owned packets produced by [`JdwpPacketReceiver::flow`].
pub type PacketStream = Pin<Box<dyn Stream<Item = Result<JdwpPacket>> + Send>>;

type Activation = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Packets a [`JdwpPacketReceiver::flow`] holds ahead of its consumer.
const FLOW_BUFFER: usize = 64;

/// Builder for one consumer of a [`SharedJdwpSession`].
///
/// The receiver is inert until one of the consuming methods (`receive*` or
/// [`flow`](Self::flow)) runs. At that point it registers with the session,
/// starts the activation hook, replays buffered packets and then follows live
/// traffic until the session ends or the consumer stops.
///
/// Callbacks see [`JdwpPacketView`]s that borrow the session's receive buffer
/// and must return quickly: the session waits for them before moving on.
#[must_use = "receivers do nothing until consumed"]
pub struct JdwpPacketReceiver {
    session: SharedJdwpSession,
    name: Arc<str>,
    filter: Option<FilterId>,
    activation: Option<Activation>,
}

impl JdwpPacketReceiver {
    pub(crate) fn new(session: SharedJdwpSession) -> Self {
        Self {
            session,
            name: Arc::from("<unnamed>"),
            filter: None,
            activation: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Only deliver packets accepted by the filter with this id.
    pub fn with_filter(mut self, filter: FilterId) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Runs `activation` once the receiver is registered.
    ///
    /// Replies to packets sent from the hook are guaranteed to reach this
    /// receiver. An error from the hook ends the receiver with that error.
    pub fn with_activation<F, Fut>(mut self, activation: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.activation = Some(Box::new(move || Box::pin(activation())));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes `on_packet` for every packet until the session reaches EOF
    /// (returns `Ok`), the session fails, or `on_packet` returns an error.
    pub async fn receive<F, E>(self, mut on_packet: F) -> Result<(), E>
    where
        F: FnMut(&JdwpPacketView<'_>) -> Result<(), E>,
        E: From<JdwpError>,
    {
        let mut receiver = self.activate();
        loop {
            match receiver.next_packet(|packet| on_packet(packet)).await? {
                Some(result) => result?,
                None => return Ok(()),
            }
        }
    }

    /// Like [`receive`](Self::receive), but stops at the first
    /// [`ControlFlow::Break`] and returns its value. Returns `Ok(None)` at EOF.
    pub async fn receive_map_first<F, R, E>(self, mut on_packet: F) -> Result<Option<R>, E>
    where
        F: FnMut(&JdwpPacketView<'_>) -> Result<ControlFlow<R>, E>,
        E: From<JdwpError>,
    {
        let mut receiver = self.activate();
        loop {
            match receiver.next_packet(|packet| on_packet(packet)).await? {
                Some(flow) => {
                    if let ControlFlow::Break(value) = flow? {
                        return Ok(Some(value));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    /// Returns an owned copy of the first packet matching `predicate`.
    pub async fn receive_first<F>(self, predicate: F) -> Result<JdwpPacket>
    where
        F: FnMut(&JdwpPacketView<'_>) -> bool,
    {
        self.receive_first_or_none(predicate)
            .await?
            .ok_or(JdwpError::NoSuchPacket)
    }

    pub async fn receive_first_or_none<F>(self, mut predicate: F) -> Result<Option<JdwpPacket>>
    where
        F: FnMut(&JdwpPacketView<'_>) -> bool,
    {
        self.receive_map_first(|packet| {
            Ok::<_, JdwpError>(if predicate(packet) {
                ControlFlow::Break(packet.to_offline())
            } else {
                ControlFlow::Continue(())
            })
        })
        .await
    }

    /// Consumes packets while `predicate` holds. The packet that fails the
    /// predicate is consumed too.
    pub async fn receive_while<F>(self, mut predicate: F) -> Result<()>
    where
        F: FnMut(&JdwpPacketView<'_>) -> bool,
    {
        self.receive_map_first(|packet| {
            Ok::<_, JdwpError>(if predicate(packet) {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            })
        })
        .await
        .map(|_| ())
    }

    /// Consumes packets up to and including the first one matching `predicate`.
    pub async fn receive_until<F>(self, mut predicate: F) -> Result<()>
    where
        F: FnMut(&JdwpPacketView<'_>) -> bool,
    {
        self.receive_while(|packet| !predicate(packet)).await
    }

    /// Turns the receiver into a stream of owned packets.
    ///
    /// The stream is lazy: nothing is registered until it is first polled.
    /// It ends after EOF and yields the session's error if it fails.
    ///
    /// Packets are copied out by a background task and buffered (up to 64 of
    /// them), so the consumer may await other work on the same session
    /// between polls. Dropping the stream unregisters the receiver.
    pub fn flow(self) -> PacketStream {
        Box::pin(async_stream::try_stream! {
            let (tx, mut rx) = mpsc::channel::<Result<JdwpPacket>>(FLOW_BUFFER);
            let mut pump = AbortOnDrop(Some(tokio::spawn(async move {
                let mut receiver = self.activate();
                loop {
                    let packet = match receiver.next_packet(|packet| packet.to_offline()).await {
                        Ok(Some(packet)) => packet,
                        Ok(None) => return,
                        Err(err) => {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                    };
                    if tx.send(Ok(packet)).await.is_err() {
                        return;
                    }
                }
            })));

            while let Some(packet) = rx.recv().await {
                yield packet?;
            }
            if let Some(handle) = pump.0.take() {
                if let Err(err) = handle.await {
                    if err.is_panic() {
                        std::panic::resume_unwind(err.into_panic());
                    }
                }
            }
        })
    }

    fn activate(self) -> ActiveReceiver {
        let filter = self.filter.as_ref().and_then(|id| {
            let index = self.session.resolve_filter(id);
            if index.is_none() {
                tracing::debug!(
                    target = "nova.jdwp",
                    receiver = %self.name,
                    filter = %id,
                    "filter is not installed on this session; receiver is unfiltered"
                );
            }
            index
        });

        let mut active = ActiveReceiver {
            session: self.session.clone(),
            name: self.name.clone(),
            filter,
            id: None,
            replay: VecDeque::new(),
            deliveries: None,
            activation: None,
            end: None,
        };

        match self.session.attach(&self.name, filter) {
            Attachment::Live {
                id,
                replay,
                deliveries,
            } => {
                active.id = Some(id);
                active.replay = replay;
                active.deliveries = Some(deliveries);
                active.activation = self.activation.map(|activation| tokio::spawn(activation()));
            }
            Attachment::Ended {
                replay,
                termination,
            } => {
                active.replay = replay;
                active.end = Some(termination);
            }
        }
        active
    }
}

impl fmt::Debug for JdwpPacketReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JdwpPacketReceiver")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .field("has_activation", &self.activation.is_some())
            .finish()
    }
}

/// A registered receiver. Dropping it deregisters from the session and aborts
/// a still-running activation hook.
struct ActiveReceiver {
    session: SharedJdwpSession,
    name: Arc<str>,
    filter: Option<usize>,
    id: Option<u64>,
    replay: VecDeque<JdwpPacket>,
    deliveries: Option<mpsc::Receiver<Delivery>>,
    activation: Option<JoinHandle<Result<()>>>,
    end: Option<Termination>,
}

impl ActiveReceiver {
    /// Waits for the next packet this receiver accepts and hands it to
    /// `on_packet` under the session's dispatch permit.
    ///
    /// Returns `Ok(None)` once the session reached EOF.
    async fn next_packet<R>(
        &mut self,
        on_packet: impl FnOnce(&JdwpPacketView<'_>) -> R,
    ) -> Result<Option<R>> {
        while let Some(packet) = self.replay.pop_front() {
            let mut pipeline = self.session.pipeline().lock().await;
            let view = packet.as_view();
            if pipeline.accepts(self.filter, &view) {
                return Ok(Some(on_packet(&view)));
            }
        }

        if let Some(end) = &self.end {
            return end.to_result().map(|()| None);
        }

        let Some(deliveries) = self.deliveries.as_mut() else {
            return Err(JdwpError::Closed);
        };

        loop {
            let delivery = tokio::select! {
                biased;
                delivery = deliveries.recv() => delivery,
                res = wait_activation(&mut self.activation) => {
                    if let Err(err) = res {
                        tracing::debug!(
                            target = "nova.jdwp",
                            receiver = %self.name,
                            error = %err,
                            "receiver activation failed"
                        );
                        return Err(err);
                    }
                    tracing::trace!(target = "nova.jdwp", receiver = %self.name, "receiver activated");
                    continue;
                }
            };

            match delivery {
                Some(Delivery::Packet(lease)) => {
                    let permit = self.session.pipeline().lock().await;
                    let result = on_packet(&lease.view());
                    drop(permit);
                    drop(lease);
                    return Ok(Some(result));
                }
                Some(Delivery::Terminated(termination)) => {
                    let result = termination.to_result().map(|()| None);
                    self.end = Some(termination);
                    return result;
                }
                None => return Err(JdwpError::Closed),
            }
        }
    }
}

async fn wait_activation(activation: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    let Some(handle) = activation.as_mut() else {
        return std::future::pending().await;
    };
    let res = handle.await;
    *activation = None;
    match res {
        Ok(res) => res,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(_) => Err(JdwpError::Cancelled),
    }
}

struct AbortOnDrop(Option<JoinHandle<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

impl Drop for ActiveReceiver {
    fn drop(&mut self) {
        if let Some(activation) = self.activation.take() {
            activation.abort();
        }
        if let Some(id) = self.id.take() {
            self.session.detach(id);
        }
    }
}
