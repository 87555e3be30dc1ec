//! Fixed-frame binary wire protocol.
//!
//! Every request is exactly [`FRAME_SIZE`] bytes and every response is
//! exactly [`RESPONSE_SIZE`] bytes. Integers use the host's native byte
//! order and there is no padding between fields.
//!
//! ```text
//! Request:  | op (3 bytes ASCII) | row (i32) | col (i32) | value (i32) |
//!           |  0..3              | 3..7      | 7..11     | 11..15      |
//! Response: | result (i32)       |
//! ```
//!
//! `row`, `col` and `value` are always present; operations that do not
//! need a field ignore it.

use thiserror::Error;

/// Width of the operation tag in bytes.
pub const TAG_SIZE: usize = 3;

/// Size of a request frame: tag + row + col + value.
pub const FRAME_SIZE: usize = TAG_SIZE + 4 + 4 + 4;

/// Size of a response frame.
pub const RESPONSE_SIZE: usize = 4;

/// Operation carried by a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Read one cell.
    Get,
    /// Write one cell and echo the stored value.
    Set,
    /// Sum every cell.
    Sum,
}

impl Operation {
    /// The on-wire tag for this operation.
    #[cfg(test)]
    pub fn tag(self) -> &'static [u8; TAG_SIZE] {
        match self {
            Operation::Get => b"GET",
            Operation::Set => b"SET",
            Operation::Sum => b"SUM",
        }
    }

    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"GET" => Some(Operation::Get),
            b"SET" => Some(Operation::Set),
            b"SUM" => Some(Operation::Sum),
            _ => None,
        }
    }
}

/// A decoded request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub op: Operation,
    pub row: i32,
    pub col: i32,
    pub value: i32,
}

// Client side of the codec, used by tests that act as remote callers.
#[cfg(test)]
impl Command {
    pub fn get(row: i32, col: i32) -> Self {
        Self {
            op: Operation::Get,
            row,
            col,
            value: 0,
        }
    }

    pub fn set(row: i32, col: i32, value: i32) -> Self {
        Self {
            op: Operation::Set,
            row,
            col,
            value,
        }
    }

    pub fn sum() -> Self {
        Self {
            op: Operation::Sum,
            row: 0,
            col: 0,
            value: 0,
        }
    }

    /// Encode this command as a request frame.
    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut frame = [0u8; FRAME_SIZE];
        frame[..3].copy_from_slice(self.op.tag());
        frame[3..7].copy_from_slice(&self.row.to_ne_bytes());
        frame[7..11].copy_from_slice(&self.col.to_ne_bytes());
        frame[11..15].copy_from_slice(&self.value.to_ne_bytes());
        frame
    }
}

/// Frame decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame is {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },
    #[error("unknown operation tag {0:?}")]
    UnknownOperation([u8; TAG_SIZE]),
}

/// Stream parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A full frame was decoded; the second field is bytes consumed.
    Complete(Command, usize),
    /// Fewer than [`FRAME_SIZE`] bytes are buffered.
    Incomplete,
    /// The leading frame is malformed.
    Error(ProtocolError),
}

/// Decode exactly one request frame.
pub fn decode(frame: &[u8]) -> Result<Command, ProtocolError> {
    if frame.len() != FRAME_SIZE {
        return Err(ProtocolError::WrongLength {
            expected: FRAME_SIZE,
            actual: frame.len(),
        });
    }

    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&frame[..TAG_SIZE]);
    let op = Operation::from_tag(&tag).ok_or(ProtocolError::UnknownOperation(tag))?;

    Ok(Command {
        op,
        row: read_i32(&frame[3..7]),
        col: read_i32(&frame[7..11]),
        value: read_i32(&frame[11..15]),
    })
}

/// Parse the leading frame out of a buffer that may hold a partial frame
/// or several frames back to back.
pub fn parse(buffer: &[u8]) -> ParseResult {
    if buffer.len() < FRAME_SIZE {
        return ParseResult::Incomplete;
    }
    match decode(&buffer[..FRAME_SIZE]) {
        Ok(command) => ParseResult::Complete(command, FRAME_SIZE),
        Err(e) => ParseResult::Error(e),
    }
}

/// Encode a response frame.
pub fn encode(result: i32) -> [u8; RESPONSE_SIZE] {
    result.to_ne_bytes()
}

/// Decode a response frame.
#[cfg(test)]
pub fn decode_response(frame: &[u8; RESPONSE_SIZE]) -> i32 {
    i32::from_ne_bytes(*frame)
}

fn read_i32(bytes: &[u8]) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    i32::from_ne_bytes(raw)
}
