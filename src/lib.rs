//! docwire - an asynchronous document database wire protocol client.
//!
//! ```ignore
//! use docwire::{ConnectionPool, PoolConfig, Query};
//!
//! let pool = ConnectionPool::connect(PoolConfig::from_url("mongodb://localhost:27017/?poolSize=4")?).await?;
//! let docs = pool.query(Query::new("app.users", Default::default()).limit(10))?.await?;
//! ```

pub mod wire;

pub use wire::{
    BsonCodec, CommandHandle, ConnectionPool, Connector, Dispatched, Document, DocumentCodec,
    ManagedConnection, Operation, OperationProtocol, PoolConfig, Query, QueryFlags, QueryHandle,
    TcpConnector, Transport, WireError, WireResult,
};
