//! Request dispatch for the event loop.
//!
//! Decodes frames from a connection's read buffer, applies them to the
//! matrix and appends encoded results to the write buffer. Works on raw
//! byte buffers with no I/O of its own.

use crate::protocol::{self, Command, Operation, ParseResult};
use crate::runtime::connection::ConnectionError;
use crate::storage::{IndexError, Matrix};
use bytes::{Buf, BytesMut};
use tracing::trace;

/// Result of processing the front of a buffer.
#[derive(Debug)]
pub enum ProcessResult {
    /// Less than one full frame buffered.
    NeedData,
    /// One frame executed.
    Response { consumed: usize, result: i32 },
    /// Frame could not be decoded or executed; the connection must close.
    Error(ConnectionError),
}

/// Apply a single command to the matrix.
pub fn execute(command: &Command, matrix: &mut Matrix) -> Result<i32, IndexError> {
    match command.op {
        Operation::Get => matrix.get(command.row, command.col),
        Operation::Set => matrix.set(command.row, command.col, command.value),
        Operation::Sum => Ok(matrix.sum()),
    }
}

/// Decode and execute the leading frame of `input`.
pub fn process(input: &[u8], matrix: &mut Matrix) -> ProcessResult {
    match protocol::parse(input) {
        ParseResult::Complete(command, consumed) => {
            trace!(?command, "Executing command");
            match execute(&command, matrix) {
                Ok(result) => ProcessResult::Response { consumed, result },
                Err(e) => ProcessResult::Error(e.into()),
            }
        }
        ParseResult::Incomplete => ProcessResult::NeedData,
        ParseResult::Error(e) => ProcessResult::Error(e.into()),
    }
}

/// Execute every complete frame in `read_buf`, in order.
///
/// Consumed bytes are removed from `read_buf`; a trailing partial frame is
/// left in place. Responses for frames handled before an error stay in
/// `write_buf`. Returns the number of frames answered.
pub fn process_buffered(
    read_buf: &mut BytesMut,
    write_buf: &mut BytesMut,
    matrix: &mut Matrix,
) -> Result<usize, ConnectionError> {
    let mut answered = 0;
    loop {
        match process(read_buf, matrix) {
            ProcessResult::NeedData => return Ok(answered),
            ProcessResult::Response { consumed, result } => {
                read_buf.advance(consumed);
                write_buf.extend_from_slice(&protocol::encode(result));
                answered += 1;
            }
            ProcessResult::Error(e) => return Err(e),
        }
    }
}
