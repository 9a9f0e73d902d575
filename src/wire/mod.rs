//! Asynchronous document database wire protocol client.
//!
//! This module provides a client that:
//! - Speaks the length-prefixed binary request/reply protocol over any byte stream
//! - Follows open cursors with automatic get-more requests
//! - Reconnects dropped transports with exponential backoff
//! - Spreads calls over a fixed pool of connections
//!
//! Architecture:
//! - `protocol`: Low-level message encoding/decoding
//! - `codec`: Incremental framing of the inbound byte stream
//! - `document`: Document model and binary document codec
//! - `operation`: Per-transport session, pending queries and cursor chains
//! - `transport`: Byte-stream abstraction and connectors
//! - `connection`: Reconnecting connection management
//! - `pool`: Connection pool

pub mod codec;
pub mod connection;
pub mod document;
pub mod error;
pub mod operation;
pub mod pool;
pub mod protocol;
pub mod transport;


pub use codec::{FrameCodec, RawFrame};
pub use connection::{Backoff, ManagedConnection};
pub use document::{BsonCodec, Document, DocumentCodec};
pub use error::{WireError, WireResult};
pub use operation::{CommandHandle, Dispatched, Operation, OperationProtocol, Query, QueryHandle};
pub use pool::{ConnectionPool, PoolConfig};
pub use protocol::{OpCode, QueryFlags};
pub use transport::{Connector, TcpConnector, Transport};
