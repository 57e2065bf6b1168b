// SPDX-License-Identifier: Apache-2.0

//! Tailer orchestration.
//!
//! Architecture:
//! - A single dedicated OS thread owns every [`MonitoredFile`] and the scratch buffer, and
//!   performs all reads, line dispatch and state persistence (single writer, no locks)
//! - Other threads talk to it through a command channel: registering and removing files,
//!   and waking it from its idle sleep
//! - Stopping is cooperative: a shared flag is checked at every loop boundary, followed by a
//!   final drain pass

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::tail::config::TailerConfig;
use crate::tail::consumer::{FileHandle, LineConsumer, TailedFiles};
use crate::tail::error::{Error, Result};
use crate::tail::monitored::MonitoredFile;

const WORKER_THREAD_NAME: &str = "tailship-worker";

/// Message sent to the worker thread
enum Command {
    /// Start polling an already opened file
    Register(MonitoredFile),
    /// Stop polling a file and release it
    Unregister(FileHandle),
    /// Cut the idle sleep short
    Wake,
}

struct WorkerHandle {
    thread: JoinHandle<()>,
    /// Disconnects when the worker exits, whether normally or by panic
    done: Receiver<()>,
}

/// Tails a set of files on one worker thread and feeds their lines to a [`LineConsumer`].
pub struct Tailer<C: LineConsumer + 'static> {
    config: TailerConfig,
    consumer: Arc<C>,
    commands_tx: Sender<Command>,
    /// Handed to the worker on start
    commands_rx: Option<Receiver<Command>>,
    stop_requested: Arc<AtomicBool>,
    worker: Option<WorkerHandle>,
}

impl<C: LineConsumer + 'static> Tailer<C> {
    pub fn new(config: TailerConfig, consumer: Arc<C>) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        let (commands_tx, commands_rx) = flume::unbounded();
        Ok(Self {
            config,
            consumer,
            commands_tx,
            commands_rx: Some(commands_rx),
            stop_requested: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn consumer(&self) -> &Arc<C> {
        &self.consumer
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| !w.thread.is_finished())
    }

    /// Start tailing `path`.
    ///
    /// The file is opened on the calling thread so a [`Error::LockConflict`] is reported
    /// here. Can be called before or after [`Tailer::start`].
    pub fn tail_file(&self, path: impl AsRef<Path>) -> Result<FileHandle> {
        if self.stop_requested.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }

        let file = MonitoredFile::open_with(path, &self.config)?;
        let handle = file.handle();
        info!(file = %handle, path = ?file.path(), "Tailing file");

        self.commands_tx
            .send(Command::Register(file))
            .map_err(|_| Error::Stopped)?;
        Ok(handle)
    }

    /// Stop tailing a file. The worker closes it, releasing its state file lock.
    pub fn untail(&self, handle: FileHandle) -> Result<()> {
        self.commands_tx
            .send(Command::Unregister(handle))
            .map_err(|_| Error::Stopped)
    }

    /// Spawn the worker thread.
    pub fn start(&mut self) -> Result<()> {
        if self.stop_requested.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let commands = self.commands_rx.take().ok_or(Error::AlreadyStarted)?;
        let (done_tx, done_rx) = flume::bounded::<()>(1);

        let worker = Worker {
            buffer: vec![0u8; self.config.buffer_size],
            config: self.config.clone(),
            consumer: self.consumer.clone(),
            commands,
            stop_requested: self.stop_requested.clone(),
            files: TailedFiles::new(),
        };

        let thread = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let _done = done_tx;
                worker.run();
            })
            .map_err(Error::WorkerSpawn)?;

        self.worker = Some(WorkerHandle {
            thread,
            done: done_rx,
        });
        Ok(())
    }

    /// Request shutdown and wait up to `timeout` for the worker to finish its final drain.
    ///
    /// Calls [`LineConsumer::on_shutdown_initiated`] from this thread first, so a consumer
    /// that is stalling the worker can let go. Returns `false` if the worker did not finish
    /// in time; it keeps running detached in that case.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            info!("Stopping tailer");
            self.consumer.on_shutdown_initiated();
            let _ = self.commands_tx.send(Command::Wake);
        }

        let Some(worker) = self.worker.take() else {
            // Never started: release whatever was registered
            if let Some(commands) = self.commands_rx.take() {
                for command in commands.try_iter() {
                    if let Command::Register(file) = command {
                        close_file(file);
                    }
                }
            }
            return true;
        };

        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    error!("Tailer worker panicked");
                } else {
                    debug!("Tailer worker joined successfully");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout = ?timeout, "Timeout waiting for tailer worker to stop");
                false
            }
        }
    }
}

impl<C: LineConsumer + 'static> Drop for Tailer<C> {
    fn drop(&mut self) {
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            self.consumer.on_shutdown_initiated();
            let _ = self.commands_tx.send(Command::Wake);
        }
    }
}

/// State owned by the worker thread
struct Worker<C: LineConsumer> {
    config: TailerConfig,
    consumer: Arc<C>,
    commands: Receiver<Command>,
    stop_requested: Arc<AtomicBool>,
    files: TailedFiles,
    buffer: Vec<u8>,
}

impl<C: LineConsumer> Worker<C> {
    fn run(mut self) {
        info!(
            buffer_size = self.buffer.len(),
            max_lines_per_poll = self.config.max_lines_per_poll,
            idle_interval = ?self.config.idle_interval(),
            "Tailer worker started"
        );

        while !self.stop_requested.load(Ordering::Acquire) {
            self.apply_commands();
            let lines = self.poll_all();
            if lines > 0 {
                self.consumer.on_poll_complete(&mut self.files, lines);
            } else {
                self.consumer.on_idle(&mut self.files);
                if !self.stop_requested.load(Ordering::Acquire) {
                    self.wait_idle();
                }
            }
        }

        self.apply_commands();
        let drained = self.poll_all();
        debug!(lines = drained, "Final drain pass complete");
        self.consumer.on_shutdown_complete(&mut self.files);

        for file in self.files.drain() {
            close_file(file);
        }
        info!("Tailer worker stopped");
    }

    /// Poll every file once, in registration order. Returns the total number of lines read.
    fn poll_all(&mut self) -> usize {
        let max_lines = self.config.max_lines_per_poll;
        let mut total = 0;
        for file in self.files.iter_mut() {
            match file.poll(&mut self.buffer, &*self.consumer, max_lines) {
                Ok(lines) => total += lines,
                Err(e) => {
                    warn!(
                        path = ?file.path(),
                        error = %e,
                        "Failed to read file, skipping it this cycle"
                    );
                }
            }
        }
        total
    }

    fn wait_idle(&mut self) {
        match self.commands.recv_timeout(self.config.idle_interval()) {
            Ok(command) => {
                self.apply(command);
                self.apply_commands();
            }
            Err(RecvTimeoutError::Timeout) => {}
            // Every sender is gone; fall back to a plain sleep
            Err(RecvTimeoutError::Disconnected) => thread::sleep(self.config.idle_interval()),
        }
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register(file) => {
                debug!(file = %file.handle(), path = ?file.path(), "Registered file with worker");
                self.files.push(file);
            }
            Command::Unregister(handle) => match self.files.remove(handle) {
                Some(file) => {
                    info!(file = %handle, path = ?file.path(), "Stopped tailing file");
                    close_file(file);
                }
                None => debug!(file = %handle, "Unregister for unknown file"),
            },
            Command::Wake => {}
        }
    }
}

fn close_file(file: MonitoredFile) {
    let path = file.path().to_path_buf();
    if let Err(e) = file.close() {
        warn!(path = ?path, error = %e, "Failed to close monitored file");
    }
}
