//! Brace-balanced JSON framing for the terminal byte stream
//!
//! The peripheral writes JSON texts back to back with no length prefix and
//! no reliable delimiter, sometimes interleaved with plain text such as its
//! own device name. A frame ends when every `{` and `[` seen since the last
//! frame has been closed:
//! ```text
//! {"a":1}Kozen P10{"b":[1,2]}
//! └─────┘└───────┘└─────────┘
//!  frame   noise      frame
//! ```
//!
//! Braces and brackets inside string values are counted like any other.
//! Payloads from the terminal never contain them, so the counters stay in
//! step with the JSON structure.

use bytes::{BufMut, Bytes, BytesMut};

use crate::link::FRAME_TERMINATOR;

/// Streaming frame assembler
#[derive(Debug, Default)]
pub struct FrameAssembler {
    /// Bytes accumulated since the last decision point
    buffer: BytesMut,
    braces: i32,
    brackets: i32,
    /// Set once a non-whitespace byte is buffered
    has_content: bool,
    /// Longest candidate kept before the buffer is dropped
    max_frame_len: Option<usize>,
    /// Discarding the rest of an oversized frame until it balances
    skipping: bool,
    /// Bytes dropped by the length cap since last taken
    overflowed: usize,
}

impl FrameAssembler {
    /// Create a new frame assembler
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            braces: 0,
            brackets: 0,
            has_content: false,
            max_frame_len: None,
            skipping: false,
            overflowed: 0,
        }
    }

    /// Create an assembler that drops any frame longer than `max` bytes.
    ///
    /// The oversized frame is skipped through to its closing brace or
    /// bracket so the frames after it still decode.
    pub fn with_max_frame_len(max: Option<usize>) -> Self {
        Self {
            max_frame_len: max,
            ..Self::new()
        }
    }

    /// Push one byte, returning a frame if it completed one
    pub fn push(&mut self, byte: u8) -> Option<String> {
        match byte {
            b'{' => self.braces += 1,
            b'}' => self.braces -= 1,
            b'[' => self.brackets += 1,
            b']' => self.brackets -= 1,
            _ => {}
        }

        if self.skipping {
            self.overflowed += 1;
            self.skipping = self.braces != 0 || self.brackets != 0;
            return None;
        }

        self.buffer.put_u8(byte);
        self.has_content |= !byte.is_ascii_whitespace();

        if let Some(max) = self.max_frame_len {
            if self.buffer.len() > max {
                self.overflowed += self.buffer.len();
                self.buffer.clear();
                self.has_content = false;
                self.skipping = self.braces != 0 || self.brackets != 0;
                return None;
            }
        }

        if self.braces != 0 || self.brackets != 0 || !self.has_content {
            return None;
        }

        let candidate = self.buffer.split().freeze();
        self.has_content = false;
        let text = String::from_utf8_lossy(&candidate);
        let text = text.trim();

        if text.starts_with('{') || text.starts_with('[') {
            Some(text.to_string())
        } else {
            None
        }
    }

    /// Push a chunk of bytes, returning every frame it completed in order
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        data.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Discard whatever never balanced.
    ///
    /// Call when the stream ends. Returns the number of bytes dropped.
    pub fn finish(&mut self) -> usize {
        let pending = self.buffer.len();
        self.buffer.clear();
        self.braces = 0;
        self.brackets = 0;
        self.has_content = false;
        self.skipping = false;
        pending
    }

    /// Bytes dropped by the length cap since the last call
    pub fn take_overflowed(&mut self) -> usize {
        std::mem::take(&mut self.overflowed)
    }

    /// Get the number of buffered bytes (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Frame an outgoing command: strip trailing newlines, append exactly one
pub fn frame_command(text: &str) -> Bytes {
    let body = text.trim_end_matches('\n');
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.put_slice(body.as_bytes());
    buf.put_u8(FRAME_TERMINATOR);
    buf.freeze()
}

/// Append the terminator unless the payload already ends with it
pub fn terminate(payload: &[u8]) -> Bytes {
    if payload.last() == Some(&FRAME_TERMINATOR) {
        return Bytes::copy_from_slice(payload);
    }
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_slice(payload);
    buf.put_u8(FRAME_TERMINATOR);
    buf.freeze()
}
