//! Wire protocol between load generators and the server.
//!
//! Every frame starts with a little-endian `i64` holding the length of the
//! whole frame, size field included. Commands follow it with an `i32` kind
//! tag and the kind's fixed arguments; responses follow it with a success
//! flag, a message and the kind's result values.

mod command;
mod response;

pub use command::{Command, CommandKind, decode_command, encode_command};
pub use response::{Response, decode_response, encode_response, encode_response_into};
use thiserror::Error;

use crate::value::ValueError;

pub const SIZE_LEN: usize = size_of::<i64>();
pub const COMMAND_HEADER_LEN: usize = SIZE_LEN + size_of::<i32>();
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    #[error("unknown command kind {0}")]
    UnknownCommandKind(i32),
    #[error("{kind} frame declares {declared} bytes, expected {expected}")]
    SizeMismatch {
        kind: CommandKind,
        declared: i64,
        expected: usize,
    },
    #[error("invalid frame size {0}")]
    InvalidFrameSize(i64),
    #[error("frame has bytes left after its last value")]
    TrailingBytes,
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("arguments do not match the layout of {0}")]
    UnexpectedArguments(CommandKind),
    #[error("response values do not match the layout of {0}")]
    ResponseShape(CommandKind),
    #[error("{0} has no response")]
    NoResponse(CommandKind),
    #[error(transparent)]
    Value(#[from] ValueError),
}

fn read_size(bytes: &[u8]) -> Option<i64> {
    let size: [u8; SIZE_LEN] = bytes.get(..SIZE_LEN)?.try_into().ok()?;

    Some(i64::from_le_bytes(size))
}
