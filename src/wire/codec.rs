//! Frame codec for splitting a byte stream into protocol messages.
//!
//! A two-state machine over a single `BytesMut`:
//! - `AwaitingHeader`: need 16 bytes to read the message length
//! - `AwaitingBody`: header parsed, need `length - 16` more bytes
//!
//! Leftover bytes after a complete frame are processed in the same call, in a
//! loop, so pathological chunking never grows the stack.

use bytes::{Buf, Bytes, BytesMut};

use super::error::WireResult;
use super::protocol::{MessageHeader, HEADER_SIZE};

/// One complete message as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl RawFrame {
    /// The request this frame answers.
    pub fn response_to(&self) -> u32 {
        self.header.response_to
    }

    pub fn opcode(&self) -> i32 {
        self.header.opcode
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    AwaitingHeader,
    AwaitingBody { header: MessageHeader, body_len: usize },
}

/// Incremental decoder from bytes to [`RawFrame`]s.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    state: State,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(32 * 1024),
            state: State::AwaitingHeader,
        }
    }

    /// Append `data` and extract every frame that is now complete.
    ///
    /// Incomplete trailing bytes are kept for the next call. An error means
    /// the stream is desynchronized; the codec must not be fed again.
    pub fn feed(&mut self, data: &[u8]) -> WireResult<Vec<RawFrame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match self.state {
                State::AwaitingHeader => {
                    let Some(header) = MessageHeader::decode(&self.buffer) else {
                        break;
                    };
                    let body_len = header.body_len()?;

                    self.buffer.advance(HEADER_SIZE);
                    self.state = State::AwaitingBody { header, body_len };
                }
                State::AwaitingBody { header, body_len } => {
                    if self.buffer.len() < body_len {
                        break;
                    }

                    let body = self.buffer.split_to(body_len).freeze();
                    frames.push(RawFrame { header, body });
                    self.state = State::AwaitingHeader;
                }
            }
        }

        Ok(frames)
    }

    /// Number of buffered bytes not yet emitted as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
