//! Managed connection with transparent reconnection.
//!
//! This module provides the connection type that handles:
//! - Opening the transport, retrying transient failures with exponential backoff
//! - Binding an [`OperationProtocol`] to each live transport
//! - Reconnecting in the background after an unexpected loss

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::document::{Document, DocumentCodec};
use super::error::{WireError, WireResult};
use super::operation::{CommandHandle, Dispatched, Operation, OperationProtocol, Query, QueryHandle};
use super::transport::{is_transient, Connector};

// ============================================================================
// Backoff
// ============================================================================

/// Delay before the first retry.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on the retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Growth factor applied after each failure.
pub const RETRY_FACTOR: f64 = 1.5;

/// Reconnect delay policy: 0.5s, growing 1.5x per failure, capped at 60s.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: INITIAL_RETRY_DELAY,
        }
    }

    /// The delay to wait after a failure; grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(RETRY_FACTOR).min(MAX_RETRY_DELAY);
        delay
    }

    /// Forget past failures after a successful connect.
    pub fn reset(&mut self) {
        self.current = INITIAL_RETRY_DELAY;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Managed Connection
// ============================================================================

struct ConnectionInner {
    host: String,
    port: u16,
    auto_reconnect: bool,
    codec: Arc<dyn DocumentCodec>,
    connector: Arc<dyn Connector>,
    /// Live session, if any
    protocol: RwLock<Option<Arc<OperationProtocol>>>,
    backoff: Mutex<Backoff>,
    /// Bumped by every `connect()` and `disconnect()`; connect and supervise
    /// loops carry the epoch they started under and exit once it is stale
    epoch: watch::Sender<u64>,
}

/// Keeps one protocol session bound to a live transport.
///
/// Cloning is cheap and yields another handle to the same connection.
#[derive(Clone)]
pub struct ManagedConnection {
    inner: Arc<ConnectionInner>,
}

impl ManagedConnection {
    /// Create an unconnected connection to `host:port`.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        auto_reconnect: bool,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn DocumentCodec>,
    ) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(ConnectionInner {
                host: host.into(),
                port,
                auto_reconnect,
                codec,
                connector,
                protocol: RwLock::new(None),
                backoff: Mutex::new(Backoff::new()),
                epoch,
            }),
        }
    }

    /// Open the transport, retrying transient failures until it succeeds.
    ///
    /// Supersedes any connect or reconnect loop still running. Returns
    /// `NotConnected` if `disconnect()` or another `connect()` is called while
    /// retrying, or `Io` for failures that retrying cannot fix.
    pub async fn connect(&self) -> WireResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let epoch = self.inner.advance_epoch();

        let protocol = Arc::clone(&self.inner).establish(epoch).await?;
        tokio::spawn(Arc::clone(&self.inner).supervise(protocol, epoch));
        Ok(())
    }

    /// Close the transport and stop reconnecting. Idempotent.
    pub fn disconnect(&self) {
        self.inner.advance_epoch();

        if let Some(protocol) = self.inner.protocol.write().take() {
            info!(host = %self.inner.host, port = self.inner.port, "disconnecting");
            protocol.close();
        }
    }

    /// Whether a live transport is bound.
    pub fn is_connected(&self) -> bool {
        self.inner
            .protocol
            .read()
            .as_ref()
            .is_some_and(|protocol| !protocol.is_closed())
    }

    /// Whether at least one query on this connection awaits a reply.
    pub fn in_use(&self) -> bool {
        self.inner
            .protocol
            .read()
            .as_ref()
            .is_some_and(|protocol| protocol.has_pending())
    }

    /// The live session, or `NotConnected`.
    pub fn protocol(&self) -> WireResult<Arc<OperationProtocol>> {
        self.inner
            .protocol
            .read()
            .as_ref()
            .filter(|protocol| !protocol.is_closed())
            .cloned()
            .ok_or(WireError::NotConnected)
    }

    /// The delay the next failed connect attempt would wait.
    pub fn retry_delay(&self) -> Duration {
        self.inner.backoff.lock().current()
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub fn call(&self, operation: Operation) -> WireResult<Dispatched> {
        self.protocol()?.dispatch(operation)
    }

    pub fn insert(&self, collection: &str, documents: &[Document]) -> WireResult<()> {
        self.protocol()?.insert(collection, documents, false)
    }

    pub fn update(
        &self,
        collection: &str,
        selector: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> WireResult<()> {
        self.protocol()?
            .update(collection, selector, update, upsert, multi)
    }

    pub fn delete(&self, collection: &str, selector: &Document) -> WireResult<()> {
        self.protocol()?.delete(collection, selector, false)
    }

    pub fn kill_cursors(&self, cursor_ids: &[i64]) -> WireResult<()> {
        self.protocol()?.kill_cursors(cursor_ids)
    }

    pub fn query(&self, query: Query) -> WireResult<QueryHandle> {
        self.protocol()?.query(query)
    }

    pub fn run_command(&self, database: &str, command: Document) -> WireResult<CommandHandle> {
        self.protocol()?.run_command(database, command)
    }
}

impl ConnectionInner {
    fn advance_epoch(&self) -> u64 {
        let mut epoch = 0;
        self.epoch.send_modify(|current| {
            *current = current.wrapping_add(1);
            epoch = *current;
        });
        epoch
    }

    fn is_stale(&self, epoch: u64) -> bool {
        *self.epoch.borrow() != epoch
    }

    /// Connect loop: retry transient failures with backoff until success or
    /// until `epoch` is superseded.
    async fn establish(self: Arc<Self>, epoch: u64) -> WireResult<Arc<OperationProtocol>> {
        let mut epochs = self.epoch.subscribe();

        loop {
            if self.is_stale(epoch) {
                return Err(WireError::NotConnected);
            }

            match self.connector.connect(&self.host, self.port).await {
                Ok(transport) => {
                    self.backoff.lock().reset();
                    let protocol = OperationProtocol::start(transport, Arc::clone(&self.codec));

                    {
                        // Checked under the slot lock so a racing disconnect() sees this session
                        let mut slot = self.protocol.write();
                        if self.is_stale(epoch) {
                            protocol.close();
                            return Err(WireError::NotConnected);
                        }
                        *slot = Some(Arc::clone(&protocol));
                    }

                    info!(host = %self.host, port = self.port, "connected");
                    return Ok(protocol);
                }
                Err(e) if is_transient(&e) => {
                    let delay = self.backoff.lock().next_delay();
                    warn!(
                        host = %self.host,
                        port = self.port,
                        error = %e,
                        retry_in = ?delay,
                        "connect failed"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_until_stale(&mut epochs, epoch) => {}
                    }
                }
                Err(e) => {
                    warn!(host = %self.host, port = self.port, error = %e, "connect failed permanently");
                    return Err(WireError::Io(e));
                }
            }
        }
    }

    /// Watch the live session and reconnect after unexpected loss.
    async fn supervise(self: Arc<Self>, mut protocol: Arc<OperationProtocol>, epoch: u64) {
        loop {
            protocol.closed().await;

            {
                let mut current = self.protocol.write();
                if current.as_ref().is_some_and(|p| Arc::ptr_eq(p, &protocol)) {
                    *current = None;
                }
            }

            if self.is_stale(epoch) {
                debug!(host = %self.host, port = self.port, "connection closed by owner");
                return;
            }

            if !self.auto_reconnect {
                warn!(host = %self.host, port = self.port, "connection lost");
                return;
            }

            warn!(host = %self.host, port = self.port, "connection lost, reconnecting");
            match Arc::clone(&self).establish(epoch).await {
                Ok(next) => protocol = next,
                Err(e) => {
                    debug!(host = %self.host, port = self.port, error = %e, "reconnect abandoned");
                    return;
                }
            }
        }
    }
}

async fn wait_until_stale(epochs: &mut watch::Receiver<u64>, epoch: u64) {
    let _ = epochs.wait_for(|current| *current != epoch).await;
}
