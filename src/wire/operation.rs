//! The live protocol session bound to one transport.
//!
//! An [`OperationProtocol`] owns a reader task that splits inbound bytes into
//! frames and a writer task that drains an outbound queue. Operation builders
//! are synchronous: they encode a request, queue it, and (for queries) hand
//! back a [`QueryHandle`] that resolves once the cursor chain completes.
//!
//! Queries are tracked in a pending table keyed by request id. A reply with
//! an open cursor re-registers the query under the id of the get-more issued
//! to continue it, so a query and its get-more chain never leave this session.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::codec::{FrameCodec, RawFrame};
use super::document::{Document, DocumentCodec};
use super::error::{WireError, WireResult};
use super::protocol::*;
use super::transport::Transport;

const READ_CHUNK_SIZE: usize = 16 * 1024;

// ============================================================================
// Operations
// ============================================================================

/// Parameters of an OP_QUERY.
#[derive(Debug, Clone)]
pub struct Query {
    /// Full collection name (`database.collection`)
    pub collection: String,
    pub selector: Document,
    pub skip: u32,
    /// Maximum documents to return across the whole cursor (0 = no limit)
    pub limit: u32,
    /// Optional projection
    pub fields: Option<Document>,
    pub flags: QueryFlags,
}

impl Query {
    pub fn new(collection: impl Into<String>, selector: Document) -> Self {
        Self {
            collection: collection.into(),
            selector,
            skip: 0,
            limit: 0,
            fields: None,
            flags: QueryFlags::NONE,
        }
    }

    pub fn skip(mut self, skip: u32) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn fields(mut self, fields: Document) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn flags(mut self, flags: QueryFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Every operation a caller can issue, for dispatch through `call`.
#[derive(Debug, Clone)]
pub enum Operation {
    Insert {
        collection: String,
        documents: Vec<Document>,
        continue_on_error: bool,
    },
    Update {
        collection: String,
        selector: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    },
    Delete {
        collection: String,
        selector: Document,
        single_remove: bool,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
    Query(Query),
    Command {
        database: String,
        command: Document,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::KillCursors { .. } => "kill_cursors",
            Operation::Query(_) => "query",
            Operation::Command { .. } => "command",
        }
    }
}

/// Outcome of dispatching an [`Operation`].
#[derive(Debug)]
pub enum Dispatched {
    /// Fire-and-forget request queued for the wire.
    Sent,
    /// A query whose documents will arrive later.
    Pending(QueryHandle),
    /// A command whose reply document will arrive later.
    Command(CommandHandle),
}

// ============================================================================
// Result Handles
// ============================================================================

type QueryResult = WireResult<Vec<Document>>;

/// Resolves to every document of a query's cursor chain.
///
/// Dropping the handle abandons interest in the result; the request itself is
/// not cancelled on the wire.
#[derive(Debug)]
#[must_use = "a query handle does nothing unless awaited"]
pub struct QueryHandle {
    rx: oneshot::Receiver<QueryResult>,
}

impl Future for QueryHandle {
    type Output = QueryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(WireError::ConnectionLost)))
    }
}

/// Resolves to the single reply document of a command.
#[derive(Debug)]
#[must_use = "a command handle does nothing unless awaited"]
pub struct CommandHandle {
    inner: QueryHandle,
}

impl Future for CommandHandle {
    type Output = WireResult<Document>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx).map(|result| {
            let reply = result?
                .into_iter()
                .next()
                .ok_or_else(|| WireError::Protocol("Command reply has no document".to_string()))?;

            // Commands report failure in-band rather than through the reply flags
            match reply.get("ok") {
                Some(ok) if is_falsy(ok) => Err(WireError::RemoteQuery(reply)),
                _ => Ok(reply),
            }
        })
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

// ============================================================================
// Pending Queries
// ============================================================================

/// Bookkeeping for one in-flight query or get-more chain.
struct PendingQuery {
    collection: String,
    limit: u32,
    documents: Vec<Document>,
    result: oneshot::Sender<QueryResult>,
}

impl PendingQuery {
    fn resolve(self) {
        // Receiver may have been dropped by an uninterested caller
        let _ = self.result.send(Ok(self.documents));
    }

    fn fail(self, err: WireError) {
        let _ = self.result.send(Err(err));
    }
}

#[derive(Default)]
struct PendingTable {
    queries: HashMap<u32, PendingQuery>,
    closed: bool,
}

// ============================================================================
// Operation Protocol
// ============================================================================

/// One protocol session over one transport.
pub struct OperationProtocol {
    codec: Arc<dyn DocumentCodec>,
    /// Queue drained by the writer task; `None` once the session is torn down
    outbound: Mutex<Option<mpsc::UnboundedSender<BytesMut>>>,
    pending: Mutex<PendingTable>,
    next_request_id: AtomicU32,
    closed: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl OperationProtocol {
    /// Bind a new session to `transport` and start its I/O tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<T: Transport>(transport: T, codec: Arc<dyn DocumentCodec>) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(transport);
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let protocol = Arc::new(Self {
            codec,
            outbound: Mutex::new(Some(tx)),
            pending: Mutex::new(PendingTable::default()),
            next_request_id: AtomicU32::new(rand::random()),
            closed,
            reader: Mutex::new(None),
        });

        tokio::spawn(Self::write_loop(Arc::clone(&protocol), write_half, rx));
        let reader = tokio::spawn(Self::read_loop(Arc::clone(&protocol), read_half));
        *protocol.reader.lock() = Some(reader);

        protocol
    }

    // ========================================================================
    // Fire-and-forget operations
    // ========================================================================

    /// Insert documents. The wire protocol sends no reply.
    pub fn insert(
        &self,
        collection: &str,
        documents: &[Document],
        continue_on_error: bool,
    ) -> WireResult<()> {
        if documents.is_empty() {
            return Err(WireError::Document(
                "Insert requires at least one document".to_string(),
            ));
        }

        let documents = documents
            .iter()
            .map(|doc| self.codec.encode(doc))
            .collect::<WireResult<Vec<_>>>()?;

        let msg = InsertMessage {
            collection: collection.to_string(),
            continue_on_error,
            documents,
        };
        self.send(self.next_request_id(), &msg)
    }

    /// Update documents matching `selector`. The wire protocol sends no reply.
    pub fn update(
        &self,
        collection: &str,
        selector: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> WireResult<()> {
        let msg = UpdateMessage {
            collection: collection.to_string(),
            upsert,
            multi,
            selector: self.codec.encode(selector)?,
            update: self.codec.encode(update)?,
        };
        self.send(self.next_request_id(), &msg)
    }

    /// Delete documents matching `selector`. The wire protocol sends no reply.
    pub fn delete(&self, collection: &str, selector: &Document, single_remove: bool) -> WireResult<()> {
        let msg = DeleteMessage {
            collection: collection.to_string(),
            single_remove,
            selector: self.codec.encode(selector)?,
        };
        self.send(self.next_request_id(), &msg)
    }

    /// Release server-side cursors. The wire protocol sends no reply.
    pub fn kill_cursors(&self, cursor_ids: &[i64]) -> WireResult<()> {
        let msg = KillCursorsMessage {
            cursor_ids: cursor_ids.to_vec(),
        };
        self.send(self.next_request_id(), &msg)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Send a query and return a handle to its eventual documents.
    ///
    /// Returns immediately; follow-up get-more requests are issued by the
    /// reader task until the cursor closes or `limit` is reached.
    pub fn query(&self, query: Query) -> WireResult<QueryHandle> {
        let selector = self.codec.encode(&query.selector)?;
        let fields = query
            .fields
            .as_ref()
            .map(|fields| self.codec.encode(fields))
            .transpose()?;

        let request_id = self.next_request_id();
        let rx = self.register(request_id, query.collection.clone(), query.limit)?;

        let msg = QueryMessage {
            flags: query.flags,
            collection: query.collection,
            number_to_skip: clamp_count(query.skip as usize),
            number_to_return: clamp_count(query.limit as usize),
            query: selector,
            fields,
        };

        if let Err(e) = self.send(request_id, &msg) {
            self.pending.lock().queries.remove(&request_id);
            return Err(e);
        }

        debug!(
            request_id,
            collection = %msg.collection,
            limit = query.limit,
            "query sent"
        );
        Ok(QueryHandle { rx })
    }

    /// Run a database command and return a handle to its reply document.
    pub fn run_command(&self, database: &str, command: Document) -> WireResult<CommandHandle> {
        let query = Query::new(format!("{}.$cmd", database), command).limit(1);
        Ok(CommandHandle {
            inner: self.query(query)?,
        })
    }

    /// Dispatch an enumerated operation.
    pub fn dispatch(&self, operation: Operation) -> WireResult<Dispatched> {
        match operation {
            Operation::Insert {
                collection,
                documents,
                continue_on_error,
            } => self
                .insert(&collection, &documents, continue_on_error)
                .map(|_| Dispatched::Sent),
            Operation::Update {
                collection,
                selector,
                update,
                upsert,
                multi,
            } => self
                .update(&collection, &selector, &update, upsert, multi)
                .map(|_| Dispatched::Sent),
            Operation::Delete {
                collection,
                selector,
                single_remove,
            } => self
                .delete(&collection, &selector, single_remove)
                .map(|_| Dispatched::Sent),
            Operation::KillCursors { cursor_ids } => {
                self.kill_cursors(&cursor_ids).map(|_| Dispatched::Sent)
            }
            Operation::Query(query) => self.query(query).map(Dispatched::Pending),
            Operation::Command { database, command } => self
                .run_command(&database, command)
                .map(Dispatched::Command),
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Whether the transport has been lost or closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Whether at least one query is awaiting a reply.
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().queries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().queries.len()
    }

    /// Wait until the session is torn down.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so this only returns once closed
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close the transport and fail every pending query.
    ///
    /// Requests already queued are still written before the stream shuts down.
    pub fn close(&self) {
        self.teardown(|| WireError::ConnectionLost);
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    fn on_frame(&self, frame: RawFrame) {
        if frame.opcode() != OpCode::Reply as i32 {
            warn!(opcode = frame.opcode(), "ignoring non-reply frame");
            return;
        }

        let response_to = frame.response_to();
        let Some(mut query) = self.pending.lock().queries.remove(&response_to) else {
            debug!(response_to, "dropping reply for unknown request");
            return;
        };

        let reply = match Reply::decode(frame.body) {
            Ok(reply) => reply,
            Err(e) => return query.fail(e),
        };

        if reply.flags.query_failure() {
            let err = match self.codec.decode_all(&reply.documents) {
                Ok(docs) => WireError::RemoteQuery(docs.into_iter().next().unwrap_or_default()),
                Err(e) => e,
            };
            return query.fail(err);
        }

        if reply.flags.cursor_not_found() {
            return query.fail(WireError::Protocol(format!(
                "Cursor not found for request {}",
                response_to
            )));
        }

        let documents = match self.codec.decode_all(&reply.documents) {
            Ok(docs) => docs,
            Err(e) => {
                self.kill_cursor_quietly(reply.cursor_id);
                return query.fail(e);
            }
        };

        if documents.len() != reply.number_returned as usize {
            warn!(
                response_to,
                announced = reply.number_returned,
                decoded = documents.len(),
                "reply document count mismatch"
            );
            self.kill_cursor_quietly(reply.cursor_id);
            return query.fail(WireError::Protocol(format!(
                "Reply announced {} documents but carried {}",
                reply.number_returned,
                documents.len()
            )));
        }

        query.documents.extend(documents);

        if reply.cursor_id == 0 {
            debug!(
                response_to,
                documents = query.documents.len(),
                "cursor exhausted"
            );
            return query.resolve();
        }

        let received = query.documents.len();
        let limit = query.limit as usize;

        if limit != 0 && received >= limit {
            self.kill_cursor_quietly(reply.cursor_id);
            if received > limit {
                warn!(
                    response_to,
                    cursor_id = reply.cursor_id,
                    received,
                    limit,
                    "server returned more documents than requested"
                );
                return query.fail(WireError::Protocol(format!(
                    "Server returned {} documents for a limit of {}",
                    received, limit
                )));
            }
            return query.resolve();
        }

        // Zero asks the server for its default batch size
        let number_to_return = if limit == 0 { 0 } else { limit - received };
        let msg = GetMoreMessage {
            collection: query.collection.clone(),
            number_to_return: clamp_count(number_to_return),
            cursor_id: reply.cursor_id,
        };

        let request_id = self.next_request_id();
        if let Err(query) = self.reregister(request_id, query) {
            return query.fail(WireError::ConnectionLost);
        }

        if let Err(e) = self.send(request_id, &msg) {
            if let Some(query) = self.pending.lock().queries.remove(&request_id) {
                query.fail(e);
            }
            return;
        }

        debug!(
            request_id,
            cursor_id = reply.cursor_id,
            number_to_return,
            "get-more sent"
        );
    }

    async fn read_loop<R: AsyncRead + Unpin>(protocol: Arc<Self>, mut reader: R) {
        let mut codec = FrameCodec::new();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    info!("connection closed by peer");
                    protocol.teardown(|| WireError::ConnectionLost);
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "read failed");
                    protocol.teardown(|| WireError::ConnectionLost);
                    return;
                }
            };

            match codec.feed(&buf[..n]) {
                Ok(frames) => {
                    for frame in frames {
                        protocol.on_frame(frame);
                    }
                }
                Err(e) => {
                    // Stream is desynchronized; nothing after this can be trusted
                    warn!(error = %e, "framing error, closing connection");
                    let message = e.to_string();
                    protocol.teardown(|| WireError::Protocol(message.clone()));
                    return;
                }
            }
        }
    }

    async fn write_loop<W: AsyncWrite + Unpin>(
        protocol: Arc<Self>,
        mut writer: W,
        mut rx: mpsc::UnboundedReceiver<BytesMut>,
    ) {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                warn!(error = %e, "write failed");
                protocol.teardown(|| WireError::ConnectionLost);
                return;
            }
        }

        let _ = writer.shutdown().await;
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn next_request_id(&self) -> u32 {
        // Wraps at 2^32
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(
        &self,
        request_id: u32,
        collection: String,
        limit: u32,
    ) -> WireResult<oneshot::Receiver<QueryResult>> {
        let (tx, rx) = oneshot::channel();
        let query = PendingQuery {
            collection,
            limit,
            documents: Vec::new(),
            result: tx,
        };

        self.reregister(request_id, query)
            .map_err(|_| WireError::ConnectionLost)?;
        Ok(rx)
    }

    fn reregister(&self, request_id: u32, query: PendingQuery) -> Result<(), PendingQuery> {
        let mut table = self.pending.lock();
        if table.closed {
            return Err(query);
        }
        table.queries.insert(request_id, query);
        Ok(())
    }

    fn send<M: RequestMessage>(&self, request_id: u32, msg: &M) -> WireResult<()> {
        let frame = encode_request(request_id, msg);
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(WireError::ConnectionLost)?;
        tx.send(frame).map_err(|_| WireError::ConnectionLost)
    }

    fn kill_cursor_quietly(&self, cursor_id: i64) {
        if cursor_id == 0 {
            return;
        }
        if let Err(e) = self.kill_cursors(&[cursor_id]) {
            debug!(cursor_id, error = %e, "could not kill cursor");
        }
    }

    /// Tear the session down once; later calls are no-ops.
    fn teardown(&self, make_err: impl Fn() -> WireError) {
        let failed: Vec<PendingQuery> = {
            let mut table = self.pending.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            table.queries.drain().map(|(_, query)| query).collect()
        };

        // Dropping the sender lets the writer drain its queue and shut down
        self.outbound.lock().take();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        if !failed.is_empty() {
            warn!(count = failed.len(), "failing pending queries");
        }
        for query in failed {
            query.fail(make_err());
        }

        // Pending queries are failed before closure becomes observable
        self.closed.send_replace(true);
    }
}

/// Counts travel as int32 on the wire.
fn clamp_count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
