#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use procpool::process::{ProcessControl, ProcessFuture, ProcessSpawner, SpawnSpec, SpawnedProcess};
use procpool::{ExitInfo, JsonFramer};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{Mutex, mpsc, watch};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Signal number reported when a fake process is killed.
pub const KILL_SIGNAL: i32 = 9;

/// A spawner that hands out in-memory subprocesses.
///
/// Every spawn produces a [`FakeChild`] on the paired [`FakeChildren`]
/// receiver, in spawn order. The test plays the worker program through it.
#[derive(Clone)]
pub struct FakeSpawner {
    inner: Arc<SpawnerState>,
}

struct SpawnerState {
    children: mpsc::UnboundedSender<FakeChild>,
    spawned: AtomicUsize,
    failures_left: AtomicUsize,
}

impl FakeSpawner {
    pub fn new() -> (Self, FakeChildren) {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawner = Self {
            inner: Arc::new(SpawnerState {
                children: tx,
                spawned: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(0),
            }),
        };
        (spawner, FakeChildren { rx })
    }

    /// Number of successful spawns so far.
    pub fn spawned(&self) -> usize {
        self.inner.spawned.load(Ordering::SeqCst)
    }

    /// Make the next `n` spawn attempts fail with an I/O error.
    pub fn fail_next_spawns(&self, n: usize) {
        self.inner.failures_left.store(n, Ordering::SeqCst);
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> io::Result<SpawnedProcess> {
        let failing = self
            .inner
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(io::ErrorKind::NotFound, "fake spawn failure"));
        }

        let index = self.inner.spawned.fetch_add(1, Ordering::SeqCst);

        let (stdin_w, stdin_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_w, stdout_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_w, stderr_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        let shared = Arc::new(Shared {
            stdout: Mutex::new(Some(stdout_w)),
            stderr: Mutex::new(Some(stderr_w)),
            exit: exit_tx,
            killed: AtomicBool::new(false),
        });

        let child = FakeChild {
            index,
            spec: spec.clone(),
            stdin: stdin_r,
            framer: JsonFramer::new(),
            inbox: VecDeque::new(),
            shared: Arc::clone(&shared),
        };
        // A test that stopped listening simply never sees this child.
        let _ = self.inner.children.send(child);

        Ok(SpawnedProcess {
            pid: Some(10_000 + index as u32),
            stdin: Box::new(stdin_w),
            stdout: Box::new(stdout_r),
            stderr: Box::new(stderr_r),
            control: Box::new(FakeControl { shared, exit_rx }),
        })
    }
}

/// Receiving side of a [`FakeSpawner`].
pub struct FakeChildren {
    rx: mpsc::UnboundedReceiver<FakeChild>,
}

impl FakeChildren {
    /// Wait for the next spawned child.
    pub async fn next(&mut self) -> FakeChild {
        self.rx.recv().await.expect("fake spawner dropped")
    }

    /// The next spawned child, if one was spawned already.
    pub fn try_next(&mut self) -> Option<FakeChild> {
        self.rx.try_recv().ok()
    }
}

struct Shared {
    stdout: Mutex<Option<DuplexStream>>,
    stderr: Mutex<Option<DuplexStream>>,
    exit: watch::Sender<Option<ExitInfo>>,
    killed: AtomicBool,
}

impl Shared {
    /// Close the output pipes, then publish the exit. The first exit wins.
    async fn finish(&self, exit: ExitInfo) {
        self.stdout.lock().await.take();
        self.stderr.lock().await.take();
        self.exit.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(exit);
                true
            } else {
                false
            }
        });
    }
}

struct FakeControl {
    shared: Arc<Shared>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessControl for FakeControl {
    fn wait(&mut self) -> ProcessFuture<'_, ExitInfo> {
        Box::pin(async move {
            loop {
                let current = *self.exit_rx.borrow_and_update();
                if let Some(exit) = current {
                    return Ok(exit);
                }
                if self.exit_rx.changed().await.is_err() {
                    return Ok(ExitInfo::default());
                }
            }
        })
    }

    fn kill(&mut self) -> ProcessFuture<'_, ()> {
        Box::pin(async move {
            self.shared.killed.store(true, Ordering::SeqCst);
            self.shared.finish(ExitInfo::with_signal(KILL_SIGNAL)).await;
            Ok(())
        })
    }
}

/// The test's end of one fake subprocess.
pub struct FakeChild {
    index: usize,
    spec: SpawnSpec,
    stdin: DuplexStream,
    framer: JsonFramer,
    inbox: VecDeque<Value>,
    shared: Arc<Shared>,
}

impl FakeChild {
    /// Position in spawn order, starting at 0.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }

    /// Next JSON value written by the supervisor, or `None` once stdin is
    /// closed.
    pub async fn recv(&mut self) -> Option<Value> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(value) = self.inbox.pop_front() {
                return Some(value);
            }
            let n = match self.stdin.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => n,
            };
            let values = self
                .framer
                .parse(&buf[..n])
                .expect("supervisor wrote invalid JSON");
            self.inbox.extend(values);
        }
    }

    /// Read the handshake and return its `initData`.
    pub async fn expect_init(&mut self) -> Value {
        let msg = self.recv().await.expect("stdin closed before handshake");
        msg.get("initData")
            .cloned()
            .unwrap_or_else(|| panic!("expected handshake, got {msg}"))
    }

    /// Read the handshake and answer `{"initSuccess": true}`.
    pub async fn accept_init(&mut self) -> Value {
        let data = self.expect_init().await;
        self.send(json!({ "initSuccess": true })).await;
        data
    }

    /// Read one task envelope and return its payload.
    pub async fn expect_message(&mut self) -> Value {
        let msg = self.recv().await.expect("stdin closed before a task arrived");
        msg.get("message")
            .cloned()
            .unwrap_or_else(|| panic!("expected a task message, got {msg}"))
    }

    /// `{"response": value}`.
    pub async fn respond(&self, value: Value) {
        self.send(json!({ "response": value })).await;
    }

    /// `{"error": value}`.
    pub async fn respond_error(&self, value: Value) {
        self.send(json!({ "error": value })).await;
    }

    pub async fn send(&self, value: Value) {
        self.write_stdout(value.to_string().as_bytes()).await;
    }

    pub async fn write_stdout(&self, bytes: &[u8]) {
        let mut guard = self.shared.stdout.lock().await;
        if let Some(pipe) = guard.as_mut() {
            pipe.write_all(bytes).await.expect("fake stdout write failed");
            pipe.flush().await.expect("fake stdout flush failed");
        }
    }

    pub async fn write_stderr(&self, bytes: &[u8]) {
        let mut guard = self.shared.stderr.lock().await;
        if let Some(pipe) = guard.as_mut() {
            pipe.write_all(bytes).await.expect("fake stderr write failed");
            pipe.flush().await.expect("fake stderr flush failed");
        }
    }

    /// Simulate the process exiting on its own.
    pub async fn exit(&self, exit: ExitInfo) {
        self.shared.finish(exit).await;
    }

    /// Whether the supervisor killed this process.
    pub fn was_killed(&self) -> bool {
        self.shared.killed.load(Ordering::SeqCst)
    }

    /// Wait until the process has exited (killed or via [`FakeChild::exit`]).
    pub async fn exited(&self) -> ExitInfo {
        let mut rx = self.shared.exit.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(exit) = current {
                return exit;
            }
            if rx.changed().await.is_err() {
                return ExitInfo::default();
            }
        }
    }

    /// Wait for stdin to be closed, asserting nothing else arrives first.
    pub async fn expect_stdin_closed(&mut self) {
        if let Some(value) = self.recv().await {
            panic!("expected stdin to close, got {value}");
        }
    }
}
