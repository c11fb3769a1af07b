//! Keyed cache of shared sessions plus the factory lists they are built from.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::ddms::NoDdmsPacketFilter;
use crate::error::Result;
use crate::session::JdwpSession;
use crate::shared::{
    PipelineFactories, SharedJdwpSession, SharedJdwpSessionConfig, SharedJdwpSessionFilterFactory,
    SharedJdwpSessionMonitorFactory,
};
use crate::wire::poison;

const DEFAULT_FILTERS_TOKEN: &str = "SharedJdwpSession.addSharedJdwpSessionFilterFactory";

/// Identifies a debuggable process: at most one shared session exists per key
/// in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub device: String,
    pub pid: u32,
}

impl SessionKey {
    pub fn new(device: impl Into<String>, pid: u32) -> Self {
        Self {
            device: device.into(),
            pid,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.pid)
    }
}

#[derive(Debug, Clone)]
pub struct SharedJdwpSessionRegistryConfig {
    /// Configuration applied to every session the registry opens.
    pub session: SharedJdwpSessionConfig,
    /// Install the built-in filters the first time a session is opened.
    pub install_default_filters: bool,
}

impl Default for SharedJdwpSessionRegistryConfig {
    fn default() -> Self {
        Self {
            session: SharedJdwpSessionConfig::default(),
            install_default_filters: true,
        }
    }
}

/// Owns the filter/monitor factory lists and the `(device, pid) -> session`
/// cache.
///
/// Factory lists are append-only. Each session takes a snapshot when it is
/// created, so registering a factory later does not affect existing sessions.
pub struct SharedJdwpSessionRegistry {
    config: SharedJdwpSessionRegistryConfig,
    filters: Mutex<Vec<Arc<dyn SharedJdwpSessionFilterFactory>>>,
    monitors: Mutex<Vec<Arc<dyn SharedJdwpSessionMonitorFactory>>>,
    installed: Mutex<HashSet<&'static str>>,
    sessions: tokio::sync::Mutex<HashMap<SessionKey, SharedJdwpSession>>,
}

impl Default for SharedJdwpSessionRegistry {
    fn default() -> Self {
        Self::new(SharedJdwpSessionRegistryConfig::default())
    }
}

impl SharedJdwpSessionRegistry {
    pub fn new(config: SharedJdwpSessionRegistryConfig) -> Self {
        Self {
            config,
            filters: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            installed: Mutex::new(HashSet::new()),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SharedJdwpSessionRegistryConfig {
        &self.config
    }

    pub fn add_filter_factory(&self, factory: impl SharedJdwpSessionFilterFactory + 'static) {
        poison::lock(&self.filters, "SharedJdwpSessionRegistry.add_filter_factory")
            .push(Arc::new(factory));
    }

    pub fn add_monitor_factory(&self, factory: impl SharedJdwpSessionMonitorFactory + 'static) {
        poison::lock(&self.monitors, "SharedJdwpSessionRegistry.add_monitor_factory")
            .push(Arc::new(factory));
    }

    /// Registers [`NoDdmsPacketFilter`]. Only the first call has an effect;
    /// returns whether this call installed it.
    pub fn install_default_filters(&self) -> bool {
        self.install_once(DEFAULT_FILTERS_TOKEN, || {
            self.add_filter_factory(NoDdmsPacketFilter::factory());
        })
    }

    fn install_once(&self, token: &'static str, install: impl FnOnce()) -> bool {
        let mut installed = poison::lock(&self.installed, "SharedJdwpSessionRegistry.install_once");
        if !installed.insert(token) {
            return false;
        }
        install();
        tracing::debug!(target = "nova.jdwp", token, "installed shared session factories");
        true
    }

    /// Snapshot of the factories registered so far.
    pub fn factories(&self) -> PipelineFactories {
        PipelineFactories {
            filters: poison::lock(&self.filters, "SharedJdwpSessionRegistry.factories").clone(),
            monitors: poison::lock(&self.monitors, "SharedJdwpSessionRegistry.factories").clone(),
        }
    }

    /// Returns the live session for `key`, or opens one with `open`.
    ///
    /// Concurrent callers for the same key are serialized so `open` runs at
    /// most once per live session. A cached session that already terminated
    /// is replaced.
    pub async fn get_or_open<F, Fut>(&self, key: SessionKey, open: F) -> Result<SharedJdwpSession>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<JdwpSession>>,
    {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&key) {
            if !existing.is_terminated() {
                return Ok(existing.clone());
            }
            tracing::debug!(
                target = "nova.jdwp",
                session = %key,
                "replacing terminated shared JDWP session"
            );
        }

        if self.config.install_default_filters {
            self.install_default_filters();
        }

        let session = open().await?;
        let shared = SharedJdwpSession::new(
            key.clone(),
            session,
            self.config.session.clone(),
            &self.factories(),
        );
        tracing::debug!(target = "nova.jdwp", session = %key, "opened shared JDWP session");
        sessions.insert(key, shared.clone());
        Ok(shared)
    }

    /// The cached session for `key`, if it has not terminated.
    pub async fn get(&self, key: &SessionKey) -> Option<SharedJdwpSession> {
        self.sessions
            .lock()
            .await
            .get(key)
            .filter(|session| !session.is_terminated())
            .cloned()
    }

    /// Drops the registry's handle for `key` and returns it.
    ///
    /// The session stays open while other handles exist; call
    /// [`SharedJdwpSession::close`] to end it immediately.
    pub async fn remove(&self, key: &SessionKey) -> Option<SharedJdwpSession> {
        self.sessions.lock().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

impl fmt::Debug for SharedJdwpSessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedJdwpSessionRegistry")
            .field("config", &self.config)
            .field("factories", &self.factories())
            .finish_non_exhaustive()
    }
}
