use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
};

use thiserror::Error;

use crate::{
    protocol::{Command, CommandKind, ProtocolError, Response, decode_response, encode_command},
    value::TypedValue,
    workload::BatchParams,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server closed the connection")]
    ConnectionClosed,
    #[error("{0} is not a query")]
    NotAQuery(CommandKind),
    #[error("batch response carries no watermarks")]
    MissingWatermarks,
}

/// Outcome of one batch, with the watermarks to send along with the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReply {
    pub response: Response,
    pub base_insert_key: i64,
    pub base_delete_key: i64,
}

/// Blocking connection to a server. Each call sends one command and waits for its answer.
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
    frame: Vec<u8>,
    received: Vec<u8>,
}

impl Client {
    pub fn connect(address: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            frame: Vec::with_capacity(128),
            received: Vec::with_capacity(4096),
        })
    }

    pub fn create_schema(&mut self, num_columns: i32) -> Result<Response, ClientError> {
        self.call(&Command::CreateSchema { num_columns })
    }

    pub fn populate(&mut self, start: i64, end: i64) -> Result<Response, ClientError> {
        self.call(&Command::Populate { start, end })
    }

    pub fn batch_op(&mut self, params: BatchParams) -> Result<BatchReply, ClientError> {
        let response = self.call(&Command::BatchOp(params))?;

        let &[TypedValue::Long(base_insert_key), TypedValue::Long(base_delete_key)] =
            response.extra.as_slice()
        else {
            return Err(ClientError::MissingWatermarks);
        };

        Ok(BatchReply {
            response,
            base_insert_key,
            base_delete_key,
        })
    }

    pub fn query(&mut self, kind: CommandKind) -> Result<Response, ClientError> {
        let command = match kind {
            CommandKind::Query1 => Command::Query1,
            CommandKind::Query2 => Command::Query2,
            CommandKind::Query3 => Command::Query3,
            other => return Err(ClientError::NotAQuery(other)),
        };

        self.call(&command)
    }

    /// Tells the server to drop the session. There is no answer to wait for.
    pub fn disconnect(mut self) -> Result<(), ClientError> {
        self.send(&Command::Disconnect)?;
        self.stream.shutdown(Shutdown::Write)?;

        Ok(())
    }

    fn send(&mut self, command: &Command) -> Result<(), ClientError> {
        self.frame.clear();
        encode_command(command, &mut self.frame);
        self.stream.write_all(&self.frame)?;

        Ok(())
    }

    fn call(&mut self, command: &Command) -> Result<Response, ClientError> {
        self.send(command)?;

        let kind = command.kind();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some((response, len)) = decode_response(kind, &self.received)? {
                self.received.drain(..len);
                return Ok(response);
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(ClientError::ConnectionClosed),
                Ok(read) => self.received.extend_from_slice(&chunk[..read]),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
    }
}
