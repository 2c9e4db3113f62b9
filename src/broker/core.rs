//! Core broker structure and lifecycle management
//!
//! Provides the `Broker` struct with initialization, inspection and shutdown.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::bridge::ProcessSpawner;
use crate::config::BrokerConfig;
use crate::credentials::CredentialValidator;
use crate::error::{Result, TerminationReason};
use crate::registry::{EvictionBudgets, SessionRegistry};
use crate::session::{Outbound, SessionSnapshot};
use crate::timers::TimerManager;
use crate::types::{ConnectionId, SessionEvent, SessionId};

use super::attach::ClientConnection;
use super::sweeper::spawn_sweeper;

// ============================================================================
// SHARED STATE
// ============================================================================

/// State shared by the broker handle, connections, timers and process pumps
///
/// Timer callbacks and process pumps hold it weakly, so dropping the last
/// [`Broker`] lets everything wind down.
pub(crate) struct BrokerInner {
    pub(crate) config: BrokerConfig,
    pub(crate) registry: SessionRegistry,
    pub(crate) timers: TimerManager,
    pub(crate) validator: Arc<dyn CredentialValidator>,
    pub(crate) spawner: Arc<dyn ProcessSpawner>,
    next_connection: AtomicU64,
}

impl BrokerInner {
    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_connection.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn budgets(&self) -> EvictionBudgets {
        EvictionBudgets {
            idle: self.config.idle_timeout(),
            lifetime: self.config.max_lifetime(),
            attach_grace: self.config.attach_grace(),
        }
    }
}

// ============================================================================
// BROKER
// ============================================================================

/// Terminal session broker
///
/// The `Broker` coordinates every session behind the WebSocket endpoint:
/// - Authentication of new connections and allocation of sessions
/// - Reattachment of returning connections, with replay of missed output
/// - Routing of input and output through each session's process bridge
/// - Eviction of idle and over-age sessions by a background sweeper
pub struct Broker {
    inner: Arc<BrokerInner>,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Create a broker and start its lifecycle sweeper
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        config: BrokerConfig,
        validator: Arc<dyn CredentialValidator>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        let timers = TimerManager::new();
        let registry = SessionRegistry::new(timers.clone());
        let sweep_interval = config.sweep_interval();

        let inner = Arc::new(BrokerInner {
            config,
            registry,
            timers,
            validator,
            spawner,
            next_connection: AtomicU64::new(0),
        });

        let sweeper_handle = spawn_sweeper(Arc::downgrade(&inner), sweep_interval);

        log::info!(
            "Broker started (auth {:?}, idle {:?}, lifetime {:?}, max {} sessions)",
            inner.config.auth_timeout(),
            inner.config.idle_timeout(),
            inner.config.max_lifetime(),
            inner.config.max_sessions
        );

        Self {
            inner,
            sweeper_handle: Mutex::new(Some(sweeper_handle)),
        }
    }

    /// Accept a new connection
    ///
    /// `outbound` receives every frame the broker wants written to the
    /// socket; a [`Outbound::Close`] is always the last one. `resume` is the
    /// session id taken from the connection URL, if any.
    pub fn connect(
        &self,
        outbound: mpsc::UnboundedSender<Outbound>,
        resume: Option<SessionId>,
    ) -> ClientConnection {
        ClientConnection::open(Arc::clone(&self.inner), outbound, resume)
    }

    /// Subscribe to session lifecycle events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.registry.subscribe()
    }

    /// Number of registered sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Point-in-time view of a session
    #[must_use]
    pub fn snapshot(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        self.inner.registry.get(session_id)
    }

    /// Snapshots of every registered session
    #[must_use]
    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        self.inner
            .registry
            .ids()
            .iter()
            .filter_map(|id| self.inner.registry.get(id))
            .collect()
    }

    /// Run one sweep immediately, returning how many sessions were evicted
    pub fn sweep_now(&self) -> usize {
        self.inner.sweep()
    }

    /// Broker configuration
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Session registry
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Timer manager
    #[must_use]
    pub fn timers(&self) -> &TimerManager {
        &self.inner.timers
    }

    /// Gracefully shutdown the broker
    ///
    /// Stops the sweeper and terminates every session, closing attached
    /// connections with 1001.
    pub async fn shutdown(&self) -> Result<()> {
        log::info!("Shutting down broker...");

        if let Some(handle) = self.sweeper_handle.lock().take() {
            handle.abort();
        }

        let session_ids = self.inner.registry.ids();
        for session_id in session_ids {
            log::debug!("Terminating session: {session_id}");
            self.inner
                .registry
                .delete(&session_id, TerminationReason::Shutdown);
        }

        // Let the process waiters observe their kill signals
        tokio::task::yield_now().await;

        log::info!("Broker shutdown complete");
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper_handle.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("registry", &self.inner.registry)
            .field("pending_timers", &self.inner.timers.pending_count())
            .finish_non_exhaustive()
    }
}
