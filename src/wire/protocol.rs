//! Wire protocol message encoding and decoding.
//!
//! Every message starts with a 16-byte little-endian header:
//! `messageLength | requestID | responseTo | opCode`.
//! Requests follow the header with an opcode-specific body; replies carry
//! a fixed 20-byte prelude followed by `numberReturned` encoded documents.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{WireError, WireResult};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Size of the standard message header.
pub const HEADER_SIZE: usize = 16;

/// Size of the reply prelude following the header.
pub const REPLY_PRELUDE_SIZE: usize = 20;

/// Largest message the client accepts from the server.
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;

/// Operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl OpCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(OpCode::Reply),
            2001 => Some(OpCode::Update),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2006 => Some(OpCode::Delete),
            2007 => Some(OpCode::KillCursors),
            _ => None,
        }
    }
}

/// Bit flags sent with OP_QUERY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryFlags(pub i32);

impl QueryFlags {
    pub const NONE: QueryFlags = QueryFlags(0);
    pub const TAILABLE_CURSOR: QueryFlags = QueryFlags(1 << 1);
    pub const SLAVE_OK: QueryFlags = QueryFlags(1 << 2);
    pub const NO_CURSOR_TIMEOUT: QueryFlags = QueryFlags(1 << 4);
    pub const AWAIT_DATA: QueryFlags = QueryFlags(1 << 5);
    pub const EXHAUST: QueryFlags = QueryFlags(1 << 6);
    pub const PARTIAL: QueryFlags = QueryFlags(1 << 7);

    pub fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for QueryFlags {
    type Output = QueryFlags;

    fn bitor(self, rhs: QueryFlags) -> QueryFlags {
        QueryFlags(self.0 | rhs.0)
    }
}

/// Bit flags carried by OP_REPLY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseFlags(pub i32);

impl ResponseFlags {
    pub const CURSOR_NOT_FOUND: i32 = 1 << 0;
    pub const QUERY_FAILURE: i32 = 1 << 1;
    pub const SHARD_CONFIG_STALE: i32 = 1 << 2;
    pub const AWAIT_CAPABLE: i32 = 1 << 3;

    pub fn cursor_not_found(self) -> bool {
        self.0 & Self::CURSOR_NOT_FOUND != 0
    }

    pub fn query_failure(self) -> bool {
        self.0 & Self::QUERY_FAILURE != 0
    }
}

// ============================================================================
// Header
// ============================================================================

/// The 16-byte header shared by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: i32,
    pub request_id: u32,
    pub response_to: u32,
    pub opcode: i32,
}

impl MessageHeader {
    /// Decode a header from the first 16 bytes of `buf`.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: buf.get_i32_le(),
            request_id: buf.get_u32_le(),
            response_to: buf.get_u32_le(),
            opcode: buf.get_i32_le(),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.length);
        buf.put_u32_le(self.request_id);
        buf.put_u32_le(self.response_to);
        buf.put_i32_le(self.opcode);
    }

    /// Body size announced by the header, if the length is sane.
    pub fn body_len(&self) -> WireResult<usize> {
        let len = usize::try_from(self.length).unwrap_or(0);
        if !(HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&len) {
            return Err(WireError::Protocol(format!(
                "Invalid message length: {}",
                self.length
            )));
        }
        Ok(len - HEADER_SIZE)
    }
}

// ============================================================================
// Client -> Server Messages
// ============================================================================

/// Trait for encoding request messages.
///
/// Implementors write everything after the header; [`encode_request`] wraps
/// the body in a header carrying the caller's request id.
pub trait RequestMessage {
    fn opcode(&self) -> OpCode;
    fn encode_body(&self, buf: &mut BytesMut);
}

/// Encode a complete request frame.
pub fn encode_request<M: RequestMessage + ?Sized>(request_id: u32, msg: &M) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128);

    // Placeholder for length (will be filled in at the end)
    MessageHeader {
        length: 0,
        request_id,
        response_to: 0,
        opcode: msg.opcode() as i32,
    }
    .encode(&mut buf);

    msg.encode_body(&mut buf);

    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_le_bytes());

    buf
}

/// OP_INSERT - insert one or more documents
#[derive(Debug, Clone)]
pub struct InsertMessage {
    pub collection: String,
    pub continue_on_error: bool,
    pub documents: Vec<Bytes>,
}

impl RequestMessage for InsertMessage {
    fn opcode(&self) -> OpCode {
        OpCode::Insert
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i32_le(i32::from(self.continue_on_error));
        put_cstring(buf, &self.collection);
        for doc in &self.documents {
            buf.put_slice(doc);
        }
    }
}

/// OP_UPDATE - update documents matching a selector
#[derive(Debug, Clone)]
pub struct UpdateMessage {
    pub collection: String,
    pub upsert: bool,
    pub multi: bool,
    pub selector: Bytes,
    pub update: Bytes,
}

impl RequestMessage for UpdateMessage {
    fn opcode(&self) -> OpCode {
        OpCode::Update
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        // Reserved
        buf.put_i32_le(0);
        put_cstring(buf, &self.collection);

        let flags = i32::from(self.upsert) | (i32::from(self.multi) << 1);
        buf.put_i32_le(flags);

        buf.put_slice(&self.selector);
        buf.put_slice(&self.update);
    }
}

/// OP_DELETE - remove documents matching a selector
#[derive(Debug, Clone)]
pub struct DeleteMessage {
    pub collection: String,
    pub single_remove: bool,
    pub selector: Bytes,
}

impl RequestMessage for DeleteMessage {
    fn opcode(&self) -> OpCode {
        OpCode::Delete
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        // Reserved
        buf.put_i32_le(0);
        put_cstring(buf, &self.collection);
        buf.put_i32_le(i32::from(self.single_remove));
        buf.put_slice(&self.selector);
    }
}

/// OP_QUERY - open a cursor over documents matching a selector
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub flags: QueryFlags,
    pub collection: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Bytes,
    pub fields: Option<Bytes>,
}

impl RequestMessage for QueryMessage {
    fn opcode(&self) -> OpCode {
        OpCode::Query
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.flags.0);
        put_cstring(buf, &self.collection);
        buf.put_i32_le(self.number_to_skip);
        buf.put_i32_le(self.number_to_return);
        buf.put_slice(&self.query);
        if let Some(ref fields) = self.fields {
            buf.put_slice(fields);
        }
    }
}

/// OP_GET_MORE - fetch the next batch of an open cursor
#[derive(Debug, Clone)]
pub struct GetMoreMessage {
    pub collection: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

impl RequestMessage for GetMoreMessage {
    fn opcode(&self) -> OpCode {
        OpCode::GetMore
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        // Reserved
        buf.put_i32_le(0);
        put_cstring(buf, &self.collection);
        buf.put_i32_le(self.number_to_return);
        buf.put_i64_le(self.cursor_id);
    }
}

/// OP_KILL_CURSORS - release server-side cursors
#[derive(Debug, Clone)]
pub struct KillCursorsMessage {
    pub cursor_ids: Vec<i64>,
}

impl RequestMessage for KillCursorsMessage {
    fn opcode(&self) -> OpCode {
        OpCode::KillCursors
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        // Reserved
        buf.put_i32_le(0);
        buf.put_i32_le(self.cursor_ids.len() as i32);
        for id in &self.cursor_ids {
            buf.put_i64_le(*id);
        }
    }
}

// ============================================================================
// Server -> Client Messages
// ============================================================================

/// A decoded OP_REPLY. Documents are left encoded for the document codec.
#[derive(Debug, Clone)]
pub struct Reply {
    pub flags: ResponseFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Bytes,
}

impl Reply {
    /// Decode a reply from a frame body (everything after the header).
    pub fn decode(mut body: Bytes) -> WireResult<Self> {
        if body.remaining() < REPLY_PRELUDE_SIZE {
            return Err(WireError::Protocol(format!(
                "Reply too short: {} bytes",
                body.remaining()
            )));
        }

        let flags = ResponseFlags(body.get_i32_le());
        let cursor_id = body.get_i64_le();
        let starting_from = body.get_i32_le();
        let number_returned = body.get_i32_le();

        if number_returned < 0 {
            return Err(WireError::Protocol(format!(
                "Negative document count: {}",
                number_returned
            )));
        }

        Ok(Self {
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents: body,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}
