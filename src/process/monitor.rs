// src/process/monitor.rs

//! Background I/O tasks attached to every subprocess.
//!
//! Each subprocess gets two Tokio tasks:
//! - a **writer** that owns stdin and writes whatever the worker queues on an
//!   unbounded channel (dropping the sender closes stdin);
//! - a **monitor** that owns stdout, stderr and the process handle, and turns
//!   everything it observes into [`WorkerEvent`]s.
//!
//! The monitor sends exactly one `Exited` event per subprocess, and only
//! after stdout and stderr were drained, so a worker always sees a
//! subprocess's last words before its exit.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::types::{ExitInfo, WorkerId};

use super::spawner::{ProcessControl, SpawnedProcess};
use super::{ProcessEvent, WorkerEvent};

const READ_CHUNK: usize = 8 * 1024;

/// Upper bound on how long we keep reading pipes after the process exited.
/// Grandchildren may hold the pipes open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// The worker's side of a running subprocess.
#[derive(Debug)]
pub struct ProcessLink {
    pid: Option<u32>,
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessLink {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue bytes for the subprocess's stdin. Returns `false` if stdin is
    /// already closed.
    pub fn write(&self, bytes: Vec<u8>) -> bool {
        match &self.stdin {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Close stdin and ask the monitor to kill the process. The exit is
    /// reported later as a regular `Exited` event.
    pub fn terminate(&mut self) {
        self.close_stdin();
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Start the writer and monitor tasks for a freshly spawned subprocess.
///
/// With `forward_stderr` the monitor also copies every stderr chunk to our
/// own stderr before reporting it.
pub fn attach(
    process: SpawnedProcess,
    worker: WorkerId,
    generation: u64,
    events: mpsc::Sender<WorkerEvent>,
    forward_stderr: bool,
) -> ProcessLink {
    let SpawnedProcess {
        pid,
        stdin,
        stdout,
        stderr,
        control,
    } = process;

    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    tokio::spawn(run_writer(stdin, stdin_rx, worker, generation));
    tokio::spawn(run_monitor(
        Streams { stdout, stderr },
        control,
        kill_rx,
        Emitter {
            worker,
            generation,
            events,
            forward_stderr,
        },
    ));

    ProcessLink {
        pid,
        stdin: Some(stdin_tx),
        kill: Some(kill_tx),
    }
}

async fn run_writer(
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    worker: WorkerId,
    generation: u64,
) {
    while let Some(bytes) = rx.recv().await {
        let res = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = res {
            // Usually a broken pipe from a process that already died; the
            // monitor reports the exit, which is what the worker acts on.
            debug!(worker = %worker, generation, error = %e, "write to worker stdin failed");
            return;
        }
    }

    if let Err(e) = stdin.shutdown().await {
        debug!(worker = %worker, generation, error = %e, "closing worker stdin failed");
    }
}

struct Streams {
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    stderr: Box<dyn AsyncRead + Send + Unpin>,
}

struct Emitter {
    worker: WorkerId,
    generation: u64,
    events: mpsc::Sender<WorkerEvent>,
    forward_stderr: bool,
}

impl Emitter {
    async fn emit(&self, kind: ProcessEvent) {
        let event = WorkerEvent {
            worker: self.worker,
            generation: self.generation,
            kind,
        };
        if self.events.send(event).await.is_err() {
            debug!(worker = %self.worker, "event receiver gone; dropping process event");
        }
    }

    async fn emit_stderr(&self, bytes: &[u8]) {
        if self.forward_stderr {
            let mut out = tokio::io::stderr();
            let res = async {
                out.write_all(bytes).await?;
                out.flush().await
            }
            .await;
            if let Err(e) = res {
                debug!(worker = %self.worker, error = %e, "failed to forward worker stderr");
            }
        }
        self.emit(ProcessEvent::Stderr(bytes.to_vec())).await;
    }
}

async fn run_monitor(
    mut streams: Streams,
    mut control: Box<dyn ProcessControl>,
    mut kill_rx: oneshot::Receiver<()>,
    emitter: Emitter,
) {
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut kill_sent = false;

    let wait_result = loop {
        tokio::select! {
            biased;

            res = streams.stdout.read(&mut out_buf), if stdout_open => match res {
                Ok(0) | Err(_) => stdout_open = false,
                Ok(n) => emitter.emit(ProcessEvent::Stdout(out_buf[..n].to_vec())).await,
            },

            res = streams.stderr.read(&mut err_buf), if stderr_open => match res {
                Ok(0) | Err(_) => stderr_open = false,
                Ok(n) => emitter.emit_stderr(&err_buf[..n]).await,
            },

            // A dropped sender means the worker itself is gone, which is as
            // good as a kill request.
            _ = &mut kill_rx, if !kill_sent => {
                kill_sent = true;
                debug!(worker = %emitter.worker, generation = emitter.generation, "killing worker process");
                if let Err(e) = control.kill().await {
                    warn!(
                        worker = %emitter.worker,
                        generation = emitter.generation,
                        error = %e,
                        "failed to kill worker process"
                    );
                }
            }

            status = control.wait() => break status,
        }
    };

    let drain = async {
        while stdout_open {
            match streams.stdout.read(&mut out_buf).await {
                Ok(0) | Err(_) => stdout_open = false,
                Ok(n) => emitter.emit(ProcessEvent::Stdout(out_buf[..n].to_vec())).await,
            }
        }
        while stderr_open {
            match streams.stderr.read(&mut err_buf).await {
                Ok(0) | Err(_) => stderr_open = false,
                Ok(n) => emitter.emit_stderr(&err_buf[..n]).await,
            }
        }
    };
    if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        debug!(
            worker = %emitter.worker,
            generation = emitter.generation,
            "worker pipes still open after exit; giving up on draining"
        );
    }

    let exit = match wait_result {
        Ok(exit) => exit,
        Err(e) => {
            warn!(
                worker = %emitter.worker,
                generation = emitter.generation,
                error = %e,
                "failed to wait for worker process"
            );
            ExitInfo::default()
        }
    };

    debug!(
        worker = %emitter.worker,
        generation = emitter.generation,
        exit_code = ?exit.code,
        signal = ?exit.signal,
        "worker process exited"
    );
    emitter.emit(ProcessEvent::Exited(exit)).await;
}
