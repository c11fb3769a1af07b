//! Filters and monitors attached to a [`SharedJdwpSession`](super::SharedJdwpSession).
//!
//! Both pipelines are built once per session from factory snapshots and are
//! only ever invoked while the session's dispatch permit is held, so
//! implementations never observe concurrent calls from the session.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::packet::{JdwpPacketView, Packet};
use crate::registry::SessionKey;

/// Identifies a filter a receiver can bind to.
///
/// The name is a label only: two ids created separately are different even if
/// their names match. Clones of the same id compare equal.
#[derive(Clone)]
pub struct FilterId(Arc<str>);

impl FilterId {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl PartialEq for FilterId {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for FilterId {}

impl Hash for FilterId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const u8 as usize).hash(state);
    }
}

impl fmt::Debug for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FilterId").field(&self.name()).finish()
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A stateful packet filter owned by one shared session.
pub trait SharedJdwpSessionFilter: Send {
    fn id(&self) -> &FilterId;

    /// Observes every packet sent through the session. Outgoing packets are
    /// never vetoed.
    fn before_send_packet(&mut self, _packet: &JdwpPacketView<'_>) {}

    /// Decides whether a receiver bound to this filter sees `packet`.
    ///
    /// Called before [`after_receive_packet`](Self::after_receive_packet) for
    /// the same packet. Replayed packets are also offered here, possibly after
    /// [`close`](Self::close) when a receiver joins a terminated session.
    fn filter(&mut self, packet: &JdwpPacketView<'_>) -> bool;

    /// Observes every packet received by the session, whether or not any
    /// receiver is bound to this filter.
    fn after_receive_packet(&mut self, _packet: &JdwpPacketView<'_>) {}

    fn close(&mut self) {}
}

pub trait SharedJdwpSessionFilterFactory: Send + Sync {
    /// Returns `None` to opt out for this session.
    fn create(&self, session: &SessionKey) -> Option<Box<dyn SharedJdwpSessionFilter>>;
}

impl<F> SharedJdwpSessionFilterFactory for F
where
    F: Fn(&SessionKey) -> Option<Box<dyn SharedJdwpSessionFilter>> + Send + Sync,
{
    fn create(&self, session: &SessionKey) -> Option<Box<dyn SharedJdwpSessionFilter>> {
        self(session)
    }
}

/// A passive observer of raw session traffic.
pub trait SharedJdwpSessionMonitor: Send {
    fn on_send_packet(&mut self, packet: &JdwpPacketView<'_>);

    fn on_receive_packet(&mut self, packet: &JdwpPacketView<'_>);

    fn close(&mut self) {}
}

pub trait SharedJdwpSessionMonitorFactory: Send + Sync {
    fn create(&self, session: &SessionKey) -> Option<Box<dyn SharedJdwpSessionMonitor>>;
}

impl<F> SharedJdwpSessionMonitorFactory for F
where
    F: Fn(&SessionKey) -> Option<Box<dyn SharedJdwpSessionMonitor>> + Send + Sync,
{
    fn create(&self, session: &SessionKey) -> Option<Box<dyn SharedJdwpSessionMonitor>> {
        self(session)
    }
}

/// Ordered factory lists consumed once when a session is constructed.
#[derive(Clone, Default)]
pub struct PipelineFactories {
    pub filters: Vec<Arc<dyn SharedJdwpSessionFilterFactory>>,
    pub monitors: Vec<Arc<dyn SharedJdwpSessionMonitorFactory>>,
}

impl PipelineFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, factory: impl SharedJdwpSessionFilterFactory + 'static) -> Self {
        self.filters.push(Arc::new(factory));
        self
    }

    pub fn with_monitor(
        mut self,
        factory: impl SharedJdwpSessionMonitorFactory + 'static,
    ) -> Self {
        self.monitors.push(Arc::new(factory));
        self
    }
}

impl fmt::Debug for PipelineFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineFactories")
            .field("filters", &self.filters.len())
            .field("monitors", &self.monitors.len())
            .finish()
    }
}

/// Emits a `trace` event for every packet crossing the session.
#[derive(Debug)]
pub struct TracingPacketMonitor {
    session: SessionKey,
}

impl TracingPacketMonitor {
    pub fn new(session: SessionKey) -> Self {
        Self { session }
    }

    pub fn factory() -> impl SharedJdwpSessionMonitorFactory {
        |key: &SessionKey| {
            Some(Box::new(TracingPacketMonitor::new(key.clone())) as Box<dyn SharedJdwpSessionMonitor>)
        }
    }
}

impl SharedJdwpSessionMonitor for TracingPacketMonitor {
    fn on_send_packet(&mut self, packet: &JdwpPacketView<'_>) {
        tracing::trace!(
            target = "nova.jdwp",
            session = %self.session,
            direction = "send",
            packet = ?packet,
            "JDWP packet"
        );
    }

    fn on_receive_packet(&mut self, packet: &JdwpPacketView<'_>) {
        tracing::trace!(
            target = "nova.jdwp",
            session = %self.session,
            direction = "receive",
            packet = ?packet,
            payload_len = packet.payload().len(),
            "JDWP packet"
        );
    }
}

pub(crate) struct Pipeline {
    filters: Vec<Box<dyn SharedJdwpSessionFilter>>,
    monitors: Vec<Box<dyn SharedJdwpSessionMonitor>>,
    closed: bool,
}

impl Pipeline {
    pub(crate) fn new(session: &SessionKey, factories: &PipelineFactories) -> Self {
        let filters = factories
            .filters
            .iter()
            .filter_map(|factory| factory.create(session))
            .collect::<Vec<_>>();
        let monitors = factories
            .monitors
            .iter()
            .filter_map(|factory| factory.create(session))
            .collect::<Vec<_>>();
        tracing::debug!(
            target = "nova.jdwp",
            session = %session,
            filters = filters.len(),
            monitors = monitors.len(),
            opted_out = factories.filters.len() + factories.monitors.len()
                - filters.len()
                - monitors.len(),
            "created shared JDWP session pipeline"
        );
        Self {
            filters,
            monitors,
            closed: false,
        }
    }

    /// Ids of the filters created for this session, in pipeline order.
    pub(crate) fn filter_ids(&self) -> Vec<FilterId> {
        self.filters.iter().map(|filter| filter.id().clone()).collect()
    }

    pub(crate) fn accepts(&mut self, filter: Option<usize>, packet: &JdwpPacketView<'_>) -> bool {
        match filter.and_then(|index| self.filters.get_mut(index)) {
            Some(filter) => filter.filter(packet),
            None => true,
        }
    }

    pub(crate) fn before_send(&mut self, packet: &JdwpPacketView<'_>) {
        if self.closed {
            return;
        }
        for filter in &mut self.filters {
            filter.before_send_packet(packet);
        }
        for monitor in &mut self.monitors {
            monitor.on_send_packet(packet);
        }
    }

    pub(crate) fn after_receive(&mut self, packet: &JdwpPacketView<'_>) {
        if self.closed {
            return;
        }
        for filter in &mut self.filters {
            filter.after_receive_packet(packet);
        }
        for monitor in &mut self.monitors {
            monitor.on_receive_packet(packet);
        }
    }

    /// Closes every filter and monitor. Later calls do nothing.
    pub(crate) fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        for filter in &mut self.filters {
            filter.close();
        }
        for monitor in &mut self.monitors {
            monitor.close();
        }
    }
}
