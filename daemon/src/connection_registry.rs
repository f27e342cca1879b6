use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use imserver_transport::SharedTransport;
use prometheus::IntGauge;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::trace;

/// One live connection as seen by the registry
///
/// The registry only holds a reference to the transport; closing the socket
/// is left to the connection task that owns it.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub user_id: String,
    pub conn_id: u64,
    pub transport: SharedTransport,
    shutdown: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(user_id: impl Into<String>, transport: SharedTransport) -> Self {
        Self {
            user_id: user_id.into(),
            conn_id: transport.conn_id(),
            transport,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Tell the owning connection task to stop reading and close the socket
    pub fn disconnect(&self) {
        self.shutdown.notify_one();
        self.transport.close();
    }

    /// Resolves once `disconnect` has been called, even if that happened
    /// before this future was created
    pub async fn disconnected(&self) {
        self.shutdown.notified().await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("user_id", &self.user_id)
            .field("conn_id", &self.conn_id)
            .finish_non_exhaustive()
    }
}

/// Registry of active WebSocket connections, keyed by user id
pub struct ConnectionRegistry {
    /// Map user id -> live connection
    connections: DashMap<String, ConnectionHandle>,
    /// Online counter, kept apart from the map itself
    online: AtomicUsize,
    /// Count a same-id reconnect as an extra user
    count_replacements: bool,
    /// Exported mirror of `online`
    online_gauge: Option<IntGauge>,
}

impl ConnectionRegistry {
    pub fn new(count_replacements: bool) -> Arc<Self> {
        Self::build(count_replacements, None)
    }

    /// Registry that also moves `gauge` along with the online counter
    pub fn with_gauge(count_replacements: bool, gauge: IntGauge) -> Arc<Self> {
        Self::build(count_replacements, Some(gauge))
    }

    fn build(count_replacements: bool, online_gauge: Option<IntGauge>) -> Arc<Self> {
        if let Some(gauge) = &online_gauge {
            gauge.set(0);
        }
        Arc::new(Self {
            connections: DashMap::new(),
            online: AtomicUsize::new(0),
            count_replacements,
            online_gauge,
        })
    }

    fn online_inc(&self) {
        self.online.fetch_add(1, Ordering::AcqRel);
        if let Some(gauge) = &self.online_gauge {
            gauge.inc();
        }
    }

    fn online_dec(&self) {
        self.online.fetch_sub(1, Ordering::AcqRel);
        if let Some(gauge) = &self.online_gauge {
            gauge.dec();
        }
    }

    /// Insert a connection, replacing any previous one for the same user id.
    ///
    /// Returns the superseded handle. Its transport is left open.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let conn_id = handle.conn_id;

        // Counter moves while the key's shard is held, so per-key increments
        // and decrements can never cross.
        let previous = match self.connections.entry(handle.user_id.clone()) {
            Entry::Occupied(mut entry) => {
                if self.count_replacements {
                    self.online_inc();
                }
                Some(entry.insert(handle))
            }
            Entry::Vacant(entry) => {
                self.online_inc();
                entry.insert(handle);
                None
            }
        };

        trace!(
            "Registered conn {} (replaced: {:?})",
            conn_id,
            previous.as_ref().map(|p| p.conn_id)
        );
        previous
    }

    /// Remove whatever connection is registered for `user_id`.
    ///
    /// Returns the removed handle; `None` (and no counter change) if nothing
    /// was registered.
    pub fn unregister(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.remove_where(user_id, |_| true)
    }

    /// Remove `user_id` only while it still belongs to `conn_id`.
    ///
    /// A connection that was replaced by a newer one for the same user id
    /// must not evict its successor when it finally closes.
    pub fn unregister_connection(&self, user_id: &str, conn_id: u64) -> bool {
        self.remove_where(user_id, |handle| handle.conn_id == conn_id)
            .is_some()
    }

    /// Current connection for `user_id`
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.connections.get(user_id).map(|entry| entry.value().clone())
    }

    /// Number of online users
    pub fn online_count(&self) -> usize {
        self.online.load(Ordering::Acquire)
    }

    /// Number of map entries
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of connected user ids, sorted
    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    fn remove_where(
        &self,
        user_id: &str,
        pred: impl Fn(&ConnectionHandle) -> bool,
    ) -> Option<ConnectionHandle> {
        match self.connections.entry(user_id.to_string()) {
            Entry::Occupied(entry) if pred(entry.get()) => {
                self.online_dec();
                Some(entry.remove())
            }
            _ => None,
        }
    }
}
