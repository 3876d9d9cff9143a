use std::{
    collections::VecDeque,
    io::{self, Read, Write},
};

use thiserror::Error;

use crate::protocol::{
    Command, CommandKind, ProtocolError, Response, decode_command, encode_response_into,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("read buffer is full without holding a complete frame")]
    ReadBufferFull,
    #[error("{kind} response of {len} bytes does not fit the write buffer")]
    ResponseTooLarge { kind: CommandKind, len: usize },
    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Everything available was read, the peer may send more.
    Open,
    /// The peer closed its side of the connection.
    EndOfStream,
}

/// One client connection with its framing buffers.
///
/// Both buffers are allocated once with a fixed capacity. Responses that do
/// not fit the free part of the write buffer wait in a backlog until earlier
/// ones have been written out.
#[derive(Debug)]
pub struct ClientSession<S> {
    id: u64,
    stream: Option<S>,
    read_buffer: Box<[u8]>,
    read_len: usize,
    write_buffer: Vec<u8>,
    write_capacity: usize,
    written: usize,
    backlog: VecDeque<(CommandKind, Response)>,
}

impl<S: Read + Write> ClientSession<S> {
    pub fn new(id: u64, stream: S, read_capacity: usize, write_capacity: usize) -> Self {
        Self {
            id,
            stream: Some(stream),
            read_buffer: vec![0; read_capacity].into_boxed_slice(),
            read_len: 0,
            write_buffer: Vec::with_capacity(write_capacity),
            write_capacity,
            written: 0,
            backlog: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Reads until the stream would block, appending every complete command to
    /// `commands`. A trailing partial frame stays buffered for the next call.
    pub fn read_commands(&mut self, commands: &mut Vec<Command>) -> Result<ReadStatus, SessionError> {
        loop {
            if self.read_len == self.read_buffer.len() {
                return Err(SessionError::ReadBufferFull);
            }

            let stream = self.stream.as_mut().ok_or(SessionError::Closed)?;
            match stream.read(&mut self.read_buffer[self.read_len..]) {
                Ok(0) => return Ok(ReadStatus::EndOfStream),
                Ok(read) => {
                    self.read_len += read;
                    self.decode_buffered(commands)?;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::Open);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn decode_buffered(&mut self, commands: &mut Vec<Command>) -> Result<(), ProtocolError> {
        let mut consumed = 0;

        while let Some((command, len)) = decode_command(&self.read_buffer[consumed..self.read_len])? {
            commands.push(command);
            consumed += len;
        }

        self.read_buffer.copy_within(consumed..self.read_len, 0);
        self.read_len -= consumed;

        Ok(())
    }

    /// Queues `response` as the answer to a command of `kind`.
    pub fn enqueue(&mut self, kind: CommandKind, response: Response) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let len = response.encoded_len(kind);
        if len > self.write_capacity {
            return Err(SessionError::ResponseTooLarge { kind, len });
        }

        self.backlog.push_back((kind, response));
        self.fill_write_buffer()?;

        Ok(())
    }

    fn fill_write_buffer(&mut self) -> Result<(), ProtocolError> {
        while let Some((kind, response)) = self.backlog.front() {
            if self.write_buffer.len() + response.encoded_len(*kind) > self.write_capacity {
                break;
            }

            encode_response_into(*kind, response, &mut self.write_buffer)?;
            self.backlog.pop_front();
        }

        Ok(())
    }

    /// Writes as much pending output as the stream accepts without blocking.
    /// Whatever is left is written by a later call.
    pub fn flush(&mut self) -> Result<(), SessionError> {
        loop {
            while self.written < self.write_buffer.len() {
                let stream = self.stream.as_mut().ok_or(SessionError::Closed)?;
                match stream.write(&self.write_buffer[self.written..]) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                    Ok(written) => self.written += written,
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                    Err(error) => return Err(error.into()),
                }
            }

            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            self.write_buffer.clear();
            self.written = 0;

            if self.backlog.is_empty() {
                return Ok(());
            }
            self.fill_write_buffer()?;
        }
    }

    #[must_use]
    pub fn has_pending_output(&self) -> bool {
        self.written < self.write_buffer.len() || !self.backlog.is_empty()
    }

    /// Drops the stream and every buffered byte. Returns whether this call did
    /// the closing, later calls do nothing.
    pub fn close(&mut self) -> bool {
        let Some(stream) = self.stream.take() else {
            return false;
        };
        drop(stream);

        self.read_len = 0;
        self.write_buffer.clear();
        self.written = 0;
        self.backlog.clear();

        true
    }
}
