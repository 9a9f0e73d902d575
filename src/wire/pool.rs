//! Connection pool.
//!
//! The pool owns a fixed set of [`ManagedConnection`]s to one endpoint and
//! spreads calls across them. Every call rotates the set by one position and
//! takes the first connection that is connected and idle; when none is, the
//! call fails immediately instead of waiting.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::connection::ManagedConnection;
use super::document::{BsonCodec, Document, DocumentCodec};
use super::error::{WireError, WireResult};
use super::operation::{CommandHandle, Dispatched, Operation, Query, QueryHandle};
use super::transport::{Connector, TcpConnector};

// ============================================================================
// Pool Configuration
// ============================================================================

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 27017;

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Hostname or IP address (default: localhost)
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number (default: 27017)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of connections (default: 1)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Reconnect in the background after connection loss (default: true)
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_pool_size() -> usize {
    1
}

fn default_auto_reconnect() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            pool_size: default_pool_size(),
            auto_reconnect: default_auto_reconnect(),
        }
    }
}

impl PoolConfig {
    /// Create a configuration for `host:port` with default options.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Parse a connection URL.
    ///
    /// Format: `mongodb://host:port/?poolSize=N&autoReconnect=true`
    pub fn from_url(url: &str) -> WireResult<Self> {
        let rest = url
            .strip_prefix("mongodb://")
            .ok_or_else(|| WireError::Config(format!("Invalid URL scheme: {}", url)))?;

        // Split off query parameters, then any path
        let (location, params) = match rest.find('?') {
            Some(q_pos) => (&rest[..q_pos], Some(&rest[q_pos + 1..])),
            None => (rest, None),
        };
        let host_port = location.split('/').next().unwrap_or_default();

        let mut config = Self::default();

        if !host_port.is_empty() {
            match host_port.rfind(':') {
                Some(colon_pos) => {
                    let port_str = &host_port[colon_pos + 1..];
                    config.port = port_str
                        .parse::<u16>()
                        .map_err(|_| WireError::Config(format!("Invalid port: {}", port_str)))?;
                    if colon_pos > 0 {
                        config.host = host_port[..colon_pos].to_string();
                    }
                }
                None => config.host = host_port.to_string(),
            }
        }

        for pair in params.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "poolSize" => {
                    config.pool_size = value.parse().map_err(|_| {
                        WireError::Config(format!("Invalid poolSize: {}", value))
                    })?;
                }
                "autoReconnect" => {
                    config.auto_reconnect = value.parse().map_err(|_| {
                        WireError::Config(format!("Invalid autoReconnect: {}", value))
                    })?;
                }
                _ => {
                    debug!(option = key, "ignoring unknown connection option");
                }
            }
        }

        Ok(config)
    }

    /// Set the number of connections.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Enable or disable background reconnection.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    fn validate(&self) -> WireResult<()> {
        if self.pool_size == 0 {
            return Err(WireError::Config(
                "Pool size must be at least 1".to_string(),
            ));
        }
        if self.host.is_empty() {
            return Err(WireError::Config("Host must not be empty".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

struct PoolInner {
    config: PoolConfig,
    /// Rotated on every call; the front is tried first
    connections: Mutex<VecDeque<ManagedConnection>>,
}

/// A fixed-size pool of reconnecting connections to one endpoint.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool over TCP with the default document codec.
    pub async fn connect(config: PoolConfig) -> WireResult<Self> {
        Self::connect_with(config, Arc::new(TcpConnector), Arc::new(BsonCodec)).await
    }

    /// Create a pool with an injected connector and codec.
    ///
    /// Returns once every connection is established.
    pub async fn connect_with(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn DocumentCodec>,
    ) -> WireResult<Self> {
        config.validate()?;

        let mut connections = VecDeque::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            connections.push_back(ManagedConnection::new(
                config.host.clone(),
                config.port,
                config.auto_reconnect,
                Arc::clone(&connector),
                Arc::clone(&codec),
            ));
        }

        for conn in &connections {
            if let Err(e) = conn.connect().await {
                for conn in &connections {
                    conn.disconnect();
                }
                return Err(e);
            }
        }

        info!(
            host = %config.host,
            port = config.port,
            pool_size = config.pool_size,
            "connection pool ready"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                connections: Mutex::new(connections),
            }),
        })
    }

    /// Pick a connection for the next call.
    ///
    /// Rotates by one, then scans from the front for a connected, idle
    /// connection. Never waits for one to free up.
    pub fn select(&self) -> WireResult<ManagedConnection> {
        let mut connections = self.inner.connections.lock();
        connections.rotate_left(1);

        if let Some(conn) = connections
            .iter()
            .find(|conn| conn.is_connected() && !conn.in_use())
        {
            return Ok(conn.clone());
        }

        let err = WireError::NoAvailableConnection {
            pool_size: connections.len(),
            in_use: connections.iter().filter(|conn| conn.in_use()).count(),
            connected: connections.iter().filter(|conn| conn.is_connected()).count(),
        };
        debug!(error = %err, "no connection available");
        Err(err)
    }

    /// Dispatch an operation on a selected connection.
    pub fn call(&self, operation: Operation) -> WireResult<Dispatched> {
        self.select()?.call(operation)
    }

    pub fn insert(&self, collection: &str, documents: &[Document]) -> WireResult<()> {
        self.select()?.insert(collection, documents)
    }

    pub fn update(
        &self,
        collection: &str,
        selector: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> WireResult<()> {
        self.select()?
            .update(collection, selector, update, upsert, multi)
    }

    pub fn delete(&self, collection: &str, selector: &Document) -> WireResult<()> {
        self.select()?.delete(collection, selector)
    }

    pub fn kill_cursors(&self, cursor_ids: &[i64]) -> WireResult<()> {
        self.select()?.kill_cursors(cursor_ids)
    }

    pub fn query(&self, query: Query) -> WireResult<QueryHandle> {
        self.select()?.query(query)
    }

    pub fn run_command(&self, database: &str, command: Document) -> WireResult<CommandHandle> {
        self.select()?.run_command(database, command)
    }

    /// Disconnect every connection.
    pub fn close(&self) {
        for conn in self.inner.connections.lock().iter() {
            conn.disconnect();
        }
        info!(host = %self.inner.config.host, port = self.inner.config.port, "connection pool closed");
    }

    /// Number of connections with at least one outstanding query.
    pub fn connections_in_use(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|conn| conn.in_use())
            .count()
    }

    /// Number of connections with a live transport.
    pub fn connections_connected(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|conn| conn.is_connected())
            .count()
    }

    pub fn size(&self) -> usize {
        self.inner.config.pool_size
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}
