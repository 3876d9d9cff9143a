//! The readiness loop.
//!
//! One thread owns the listener, every client session and the results still
//! in flight. Each tick it accepts new clients, decodes whatever the ready
//! sessions sent and hands the commands to the worker pool, collects the
//! results that completed since the last tick and writes them out.

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};
use mio::{
    Events, Interest, Poll, Token, Waker,
    net::{TcpListener, TcpStream},
};
use thiserror::Error;

use crate::{
    backend::ConnectionFactory,
    protocol::{Command, CommandKind},
    session::{ClientSession, ReadStatus},
    worker::{PendingResult, WorkerError, WorkerPool},
    workload::Limits,
};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CLIENT: usize = 2;

pub const DEFAULT_PORT: u16 = 8713;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("event loop thread panicked")]
    LoopPanicked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub workers: usize,
    /// Column count used until the first schema is created.
    pub num_columns: usize,
    pub poll_interval: Duration,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// Bounds on the work a single command may request.
    pub limits: Limits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            workers: 2,
            num_columns: 10,
            poll_interval: Duration::from_millis(100),
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            limits: Limits::default(),
        }
    }
}

impl ServerConfig {
    // large enough for a failure message of a few hundred bytes
    const MIN_WRITE_BUFFER: usize = 512;

    pub fn validate(&self) -> Result<(), ServerError> {
        let largest_command = CommandKind::ALL
            .iter()
            .map(|kind| kind.frame_len())
            .max()
            .unwrap_or_default();

        if self.workers == 0 {
            return Err(ServerError::Config("at least one worker is needed".to_owned()));
        }
        if self.num_columns == 0
            || self.num_columns > self.limits.max_columns
            || i32::try_from(self.num_columns).is_err()
        {
            return Err(ServerError::Config(format!(
                "column count {} is out of range",
                self.num_columns
            )));
        }
        if self.limits.max_ops == 0 || self.limits.max_columns == 0 {
            return Err(ServerError::Config(
                "limits must allow at least one operation and one column".to_owned(),
            ));
        }
        if self.read_buffer_size < largest_command {
            return Err(ServerError::Config(format!(
                "read buffer must hold at least {largest_command} bytes"
            )));
        }
        if self.write_buffer_size < Self::MIN_WRITE_BUFFER {
            return Err(ServerError::Config(format!(
                "write buffer must hold at least {} bytes",
                Self::MIN_WRITE_BUFFER
            )));
        }

        Ok(())
    }
}

pub struct Server {
    config: ServerConfig,
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    pool: WorkerPool,
    sessions: HashMap<Token, ClientSession<TcpStream>>,
    pending: Vec<(Token, PendingResult)>,
    next_client_id: u64,
    active_sessions: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
}

impl Server {
    /// Binds the listener and starts the workers, each with its own backend connection.
    pub fn bind<F: ConnectionFactory>(config: ServerConfig, factory: F) -> Result<Self, ServerError> {
        config.validate()?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.bind)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let pool = WorkerPool::new(
            factory,
            config.workers,
            Arc::new(AtomicUsize::new(config.num_columns)),
            config.limits,
            waker.clone(),
        )?;

        info!(
            "listening on {} with {} workers",
            listener.local_addr()?,
            pool.size()
        );

        Ok(Self {
            config,
            poll,
            listener,
            waker,
            pool,
            sessions: HashMap::new(),
            pending: vec![],
            next_client_id: 1,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Binds and runs the loop on its own thread.
    pub fn start<F: ConnectionFactory>(
        config: ServerConfig,
        factory: F,
    ) -> Result<ServerHandle, ServerError> {
        let server = Self::bind(config, factory)?;

        let local_addr = server.local_addr()?;
        let active_sessions = server.active_sessions.clone();
        let stop = server.stop.clone();
        let waker = server.waker.clone();

        let thread = thread::Builder::new()
            .name("mbench-loop".into())
            .spawn(move || server.run())?;

        Ok(ServerHandle {
            local_addr,
            active_sessions,
            stop,
            waker,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs until a shutdown is requested, then drains the workers and closes
    /// every session.
    pub fn run(mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(1024);
        let mut readable = vec![];

        while !self.stop.load(Ordering::Acquire) {
            if let Err(error) = self.poll.poll(&mut events, Some(self.config.poll_interval)) {
                if error.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(error.into());
            }

            let mut accept = false;
            readable.clear();
            for event in &events {
                match event.token() {
                    LISTENER => accept = true,
                    // completions are drained on every tick anyway
                    WAKER => {}
                    token if event.is_readable() || event.is_read_closed() || event.is_error() => {
                        readable.push(token);
                    }
                    _ => {}
                }
            }

            if accept {
                self.accept();
            }
            for token in &readable {
                self.route(*token);
            }
            self.drain_completed();
            self.write_responses();
        }

        info!("shutting down with {} open sessions", self.sessions.len());
        self.pool.shutdown();

        let tokens: Vec<_> = self.sessions.keys().copied().collect();
        for token in tokens {
            self.disconnect(token);
        }

        Ok(())
    }

    fn accept(&mut self) {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    error!("accept failed: {error}");
                    return;
                }
            };

            let id = self.next_client_id;
            self.next_client_id += 1;
            let Some(token) = usize::try_from(id)
                .ok()
                .and_then(|id| id.checked_add(FIRST_CLIENT))
                .map(Token)
            else {
                error!("client ids exhausted, refusing {peer}");
                continue;
            };

            if let Err(error) = stream.set_nodelay(true) {
                debug!("could not disable Nagle for {peer}: {error}");
            }
            if let Err(error) = self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                error!("could not register client {id} from {peer}: {error}");
                continue;
            }

            self.sessions.insert(
                token,
                ClientSession::new(
                    id,
                    stream,
                    self.config.read_buffer_size,
                    self.config.write_buffer_size,
                ),
            );
            self.active_sessions
                .store(self.sessions.len(), Ordering::Release);

            info!(
                "client {id} connected from {peer}, {} active",
                self.sessions.len()
            );
        }
    }

    fn route(&mut self, token: Token) {
        let Some(session) = self.sessions.get_mut(&token) else {
            return;
        };

        let mut commands = vec![];
        let status = session.read_commands(&mut commands);
        let id = session.id();

        let mut close = match status {
            Ok(ReadStatus::Open) => false,
            Ok(ReadStatus::EndOfStream) => true,
            Err(error) => {
                warn!("dropping client {id}: {error}");
                self.disconnect(token);
                return;
            }
        };

        for command in commands {
            if matches!(command, Command::Disconnect) {
                close = true;
                break;
            }

            debug!("client {id} submitted {}", command.kind());
            match self.pool.submit(command) {
                Ok(pending) => self.pending.push((token, pending)),
                Err(error) => {
                    error!("could not submit a command of client {id}: {error}");
                    close = true;
                    break;
                }
            }
        }

        if close {
            self.disconnect(token);
        }
    }

    fn drain_completed(&mut self) {
        let mut completed = vec![];

        self.pending.retain_mut(|(token, pending)| match pending.try_take() {
            Some(response) => {
                completed.push((*token, pending.kind(), response));
                false
            }
            None => true,
        });

        for (token, kind, response) in completed {
            let Some(session) = self.sessions.get_mut(&token) else {
                debug!("dropping a {kind} response for a closed session");
                continue;
            };

            if !response.success {
                debug!("client {} {kind} failed: {}", session.id(), response.message);
            }

            if let Err(error) = session.enqueue(kind, response) {
                warn!("dropping client {}: {error}", session.id());
                self.disconnect(token);
            }
        }
    }

    fn write_responses(&mut self) {
        let mut failed = vec![];

        for (token, session) in &mut self.sessions {
            if !session.has_pending_output() {
                continue;
            }

            if let Err(error) = session.flush() {
                warn!("dropping client {}: {error}", session.id());
                failed.push(*token);
            }
        }

        for token in failed {
            self.disconnect(token);
        }
    }

    /// Removes the session from the registry and closes its socket. Unknown
    /// tokens are ignored, so disconnecting twice is harmless.
    fn disconnect(&mut self, token: Token) {
        let Some(mut session) = self.sessions.remove(&token) else {
            return;
        };

        let id = session.id();
        if let Some(stream) = session.stream_mut()
            && let Err(error) = self.poll.registry().deregister(stream)
        {
            debug!("could not deregister client {id}: {error}");
        }
        session.close();

        self.active_sessions
            .store(self.sessions.len(), Ordering::Release);
        info!("client {id} disconnected, {} active", self.sessions.len());
    }
}

/// Controls a server running on its own thread. Dropping the handle shuts the server down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    active_sessions: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl ServerHandle {
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    pub fn shutdown(mut self) -> Result<(), ServerError> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<(), ServerError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        self.stop.store(true, Ordering::Release);
        if let Err(error) = self.waker.wake() {
            // the loop still notices the flag at its next poll timeout
            debug!("could not wake the event loop: {error}");
        }

        thread.join().map_err(|_| ServerError::LoopPanicked)?
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(error) = self.stop_and_join() {
            error!("server stopped with an error: {error}");
        }
    }
}
