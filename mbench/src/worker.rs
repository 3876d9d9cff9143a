//! Worker threads that execute commands off the event loop.
//!
//! Every worker opens one backend connection when it starts and keeps it
//! until the pool shuts down, so no command ever shares a connection with
//! another one running concurrently.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, atomic::AtomicUsize},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, error, info};
use thiserror::Error;

use crate::{
    backend::{BackendError, Connection, ConnectionFactory},
    executor::{self, Executor},
    protocol::{Command, CommandKind, Response},
    workload::Limits,
};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("could not spawn a worker thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("worker could not connect to the backend: {0}")]
    Connect(#[from] BackendError),
    #[error("worker exited before reporting readiness")]
    StartupAborted,
    #[error("{0} is not executed by workers")]
    NotExecutable(CommandKind),
    #[error("worker pool is shut down")]
    ShutDown,
}

/// Told after a worker published a result.
pub trait CompletionNotifier: Send + Sync + 'static {
    fn notify(&self);
}

impl CompletionNotifier for mio::Waker {
    fn notify(&self) {
        if let Err(error) = self.wake() {
            error!("could not wake the event loop: {error}");
        }
    }
}

struct Job {
    command: Command,
    reply: Sender<Response>,
}

enum Source {
    Ready(Response),
    Worker {
        receiver: Receiver<Response>,
        on_lost: Response,
    },
    Taken,
}

/// Result of a submitted command that may still be running.
pub struct PendingResult {
    kind: CommandKind,
    source: Source,
}

impl PendingResult {
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Takes the response if the command has completed. Returns `Some` at most once.
    pub fn try_take(&mut self) -> Option<Response> {
        match std::mem::replace(&mut self.source, Source::Taken) {
            Source::Ready(response) => Some(response),
            Source::Worker { receiver, on_lost } => match receiver.try_recv() {
                Ok(response) => Some(response),
                Err(TryRecvError::Disconnected) => Some(on_lost),
                Err(TryRecvError::Empty) => {
                    self.source = Source::Worker { receiver, on_lost };
                    None
                }
            },
            Source::Taken => None,
        }
    }

    /// Blocks until the command completes.
    pub fn wait(self) -> Option<Response> {
        match self.source {
            Source::Ready(response) => Some(response),
            Source::Worker { receiver, on_lost } => Some(receiver.recv().unwrap_or(on_lost)),
            Source::Taken => None,
        }
    }
}

pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `size` workers and waits until each of them holds a connection.
    pub fn new<F: ConnectionFactory>(
        factory: F,
        size: usize,
        num_columns: Arc<AtomicUsize>,
        limits: Limits,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> Result<Self, WorkerError> {
        let factory = Arc::new(factory);
        let (jobs, queue) = crossbeam_channel::unbounded::<Job>();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(size);

        let mut pool = Self {
            jobs: Some(jobs),
            handles: Vec::with_capacity(size),
        };

        for id in 0..size {
            let factory = factory.clone();
            let queue = queue.clone();
            let ready = ready_tx.clone();
            let num_columns = num_columns.clone();
            let notifier = notifier.clone();

            let handle = thread::Builder::new()
                .name(format!("mbench-worker-{id:02}"))
                .spawn(move || {
                    let connection = match factory.connect() {
                        Ok(connection) => connection,
                        Err(error) => {
                            let _ = ready.send(Err(error));
                            return;
                        }
                    };
                    let _ = ready.send(Ok(()));
                    drop(ready);

                    worker_loop(
                        &queue,
                        Executor::new(connection, num_columns, limits),
                        &*notifier,
                    );
                    debug!("worker {id} stopped");
                });

            match handle {
                Ok(handle) => pool.handles.push(handle),
                Err(error) => {
                    pool.shutdown();
                    return Err(WorkerError::Spawn(error));
                }
            }
        }
        drop(ready_tx);

        for _ in 0..size {
            let started = ready_rx.recv().map_err(|_| WorkerError::StartupAborted);

            if let Err(error) = started.and_then(|result| result.map_err(WorkerError::Connect)) {
                pool.shutdown();
                return Err(error);
            }
        }

        info!("{size} workers connected");

        Ok(pool)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Queues `command` for the next free worker. Stubbed queries complete
    /// right away without reaching a worker.
    pub fn submit(&self, command: Command) -> Result<PendingResult, WorkerError> {
        let kind = command.kind();

        match kind {
            CommandKind::Query2 | CommandKind::Query3 => {
                return Ok(PendingResult {
                    kind,
                    source: Source::Ready(Response::not_implemented(kind)),
                });
            }
            CommandKind::Disconnect => return Err(WorkerError::NotExecutable(kind)),
            _ => {}
        }

        let jobs = self.jobs.as_ref().ok_or(WorkerError::ShutDown)?;
        let (reply, receiver) = crossbeam_channel::bounded(1);
        let on_lost = executor::failed(&command, "worker terminated");

        jobs.send(Job { command, reply })
            .map_err(|_| WorkerError::ShutDown)?;

        Ok(PendingResult {
            kind,
            source: Source::Worker { receiver, on_lost },
        })
    }

    /// Lets the workers finish every queued command, then joins them.
    pub fn shutdown(&mut self) {
        self.jobs = None;

        for handle in self.handles.drain(..) {
            if let Err(panic) = handle.join() {
                error!("worker thread panicked: {panic:?}");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<C: Connection>(
    queue: &Receiver<Job>,
    mut executor: Executor<C>,
    notifier: &dyn CompletionNotifier,
) {
    while let Ok(Job { command, reply }) = queue.recv() {
        let response = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&command)))
            .unwrap_or_else(|_| {
                error!("{} panicked in a worker", command.kind());
                executor::failed(&command, "internal error")
            });

        // the receiver is gone when its session disconnected in the meantime
        let _ = reply.send(response);
        notifier.notify();
    }
}
