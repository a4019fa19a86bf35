//! Child-process worker backend.
//!
//! The spawner is one long-lived child launched at startup with the sandbox
//! layout in its environment. The master asks it for a worker by writing a
//! `spawn` line to its stdin; the new worker connects back to the master's
//! Unix socket and introduces itself with a `Hello` frame.
//!
//! A worker's socket is its only channel. Each worker has a reader task that
//! owns the read half; end of stream or any I/O error there marks the worker
//! dead right away, whether or not a request is in flight.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use cowrite_core::{
    DocumentId, Health, LoadOutcome, SandboxRoots, SessionId, Worker, WorkerError,
    WorkerLiveness, WorkerProbe, WorkerReply, WorkerSpawner, liveness,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf},
    net::{UnixListener, UnixStream},
    process::{ChildStdin, Command},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

use super::frame::{FrameKind, WorkerFrame};

/// File name of the listening socket inside the socket directory.
pub const SOCKET_FILE: &str = "workers.sock";

/// Environment variable carrying the socket path to the spawner.
pub const SOCKET_ENV: &str = "COWRITE_SOCKET";

/// Settings for launching the spawner.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Spawner executable
    pub program: PathBuf,
    /// Arguments passed to the spawner
    pub args: Vec<String>,
    /// Directory holding the master's listening socket
    pub socket_dir: PathBuf,
    /// Sandbox layout handed to the spawner
    pub sandbox: SandboxRoots,
    /// How long a requested worker may take to connect and say hello
    pub hello_timeout: Duration,
}

struct Launched {
    listener: UnixListener,
    stdin: ChildStdin,
}

/// Spawner backed by a child process.
///
/// Spawn requests are serialized: one `spawn` line is written and the next
/// connection on the socket is taken as its answer.
pub struct ProcessSpawner {
    config: ProcessConfig,
    launched: Mutex<Option<Launched>>,
    alive: Arc<AtomicBool>,
}

impl ProcessSpawner {
    /// Spawner that will run `config.program` once launched.
    pub fn new(config: ProcessConfig) -> Self {
        Self { config, launched: Mutex::new(None), alive: Arc::new(AtomicBool::new(false)) }
    }

    /// Path of the socket workers connect to.
    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_dir.join(SOCKET_FILE)
    }

    fn command(&self, socket: &Path) -> Command {
        let sandbox = &self.config.sandbox;
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .env(SOCKET_ENV, socket)
            .env("COWRITE_CHILD_ROOT", &sandbox.child_root)
            .env("COWRITE_SYS_TEMPLATE", &sandbox.sys_template)
            .env("COWRITE_ENGINE_TEMPLATE", &sandbox.engine_template)
            .env("COWRITE_CACHE", &sandbox.cache)
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_failed(&self, reason: impl Into<String>) -> WorkerError {
        WorkerError::SpawnFailed(reason.into())
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    type Worker = ProcessWorker;

    async fn launch(&self) -> Result<(), WorkerError> {
        let mut slot = self.launched.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let socket = self.socket_path();
        match tokio::fs::remove_file(&socket).await {
            Ok(()) => tracing::debug!(socket = %socket.display(), "removed stale socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(&socket)?;

        let mut child = self.command(&socket).spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Io("spawner stdin was not captured".to_string()))?;

        tracing::info!(
            program = %self.config.program.display(),
            pid = child.id(),
            socket = %socket.display(),
            "spawner launched"
        );

        self.alive.store(true, Ordering::Release);
        let alive = Arc::clone(&self.alive);
        tokio::spawn(async move {
            let status = child.wait().await;
            alive.store(false, Ordering::Release);
            match status {
                Ok(status) => tracing::error!(%status, "spawner exited"),
                Err(err) => tracing::error!(error = %err, "lost track of spawner"),
            }
        });

        *slot = Some(Launched { listener, stdin });
        Ok(())
    }

    fn spawner_health(&self) -> Health {
        if self.alive.load(Ordering::Acquire) { Health::Alive } else { Health::Dead }
    }

    async fn spawn(&self) -> Result<ProcessWorker, WorkerError> {
        if self.spawner_health() == Health::Dead {
            return Err(WorkerError::SpawnerDown);
        }

        let mut slot = self.launched.lock().await;
        let Some(launched) = slot.as_mut() else {
            return Err(WorkerError::SpawnerDown);
        };
        discard_late_workers(&launched.listener).await;

        if let Err(err) = launched.stdin.write_all(b"spawn\n").await {
            tracing::error!(error = %err, "spawner stopped reading requests");
            self.alive.store(false, Ordering::Release);
            return Err(WorkerError::SpawnerDown);
        }
        launched.stdin.flush().await?;

        let hello_timeout = self.config.hello_timeout;
        let (mut stream, _) = tokio::time::timeout(hello_timeout, launched.listener.accept())
            .await
            .map_err(|_| {
                self.spawn_failed(format!("no worker connected within {hello_timeout:?}"))
            })??;

        let hello = tokio::time::timeout(hello_timeout, WorkerFrame::read_from(&mut stream))
            .await
            .map_err(|_| self.spawn_failed(format!("no hello within {hello_timeout:?}")))??
            .ok_or_else(|| self.spawn_failed("worker closed its socket before hello"))?;

        let (pid, engine_version) = hello.parse_hello()?;
        tracing::debug!(pid, engine_version = %engine_version, "worker connected");
        Ok(ProcessWorker::from_stream(stream, pid, engine_version))
    }
}

/// Drop connections already waiting on the socket.
///
/// A worker that connects after its spawn timed out would otherwise be taken
/// as the answer to the next `spawn` line, leaving that line's worker queued
/// behind it for good.
async fn discard_late_workers(listener: &UnixListener) {
    while let Ok(accepted) = tokio::time::timeout(Duration::ZERO, listener.accept()).await {
        match accepted {
            Ok((stream, _)) => {
                tracing::warn!("discarding worker that connected after its spawn timed out");
                drop(stream);
            },
            Err(err) => {
                tracing::debug!(error = %err, "accept failed while discarding late workers");
                return;
            },
        }
    }
}

/// Worker reached over a socket.
///
/// Generic over the stream so tests can drive it through an in-memory pipe.
pub struct ProcessWorker<S = UnixStream> {
    pid: u32,
    engine_version: String,
    writer: WriteHalf<S>,
    /// Frames read by the reader task; closed once the socket is gone
    replies: mpsc::UnboundedReceiver<WorkerFrame>,
    reader: JoinHandle<()>,
    liveness: Arc<WorkerLiveness>,
    probe: WorkerProbe,
}

impl<S> ProcessWorker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Worker `pid` that already said hello on `stream`.
    ///
    /// Must be called inside a Tokio runtime: it starts the reader task.
    pub fn from_stream(stream: S, pid: u32, engine_version: String) -> Self {
        let (liveness, probe) = liveness();
        let liveness = Arc::new(liveness);
        let (read_half, writer) = tokio::io::split(stream);
        let (frames, replies) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_frames(read_half, frames, Arc::clone(&liveness), pid));
        Self { pid, engine_version, writer, replies, reader, liveness, probe }
    }

    /// Send `request` and collect the reply: any `Delta`s, then the terminal
    /// frame. Every failure leaves the channel unusable, so it kills the
    /// worker.
    async fn request(
        &mut self,
        request: WorkerFrame,
    ) -> Result<(WorkerFrame, Vec<Bytes>), WorkerError> {
        if !self.probe.is_alive() {
            return Err(WorkerError::Died { pid: self.pid });
        }

        match self.exchange(request).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.liveness.mark_dead();
                match err {
                    WorkerError::Io(_) => Err(WorkerError::Died { pid: self.pid }),
                    other => Err(other),
                }
            },
        }
    }

    async fn exchange(
        &mut self,
        request: WorkerFrame,
    ) -> Result<(WorkerFrame, Vec<Bytes>), WorkerError> {
        // Leftovers answer a request whose caller stopped waiting.
        while let Ok(stale) = self.replies.try_recv() {
            tracing::debug!(pid = self.pid, kind = ?stale.kind, "dropping stale frame");
        }
        request.write_to(&mut self.writer).await?;

        let mut deltas = Vec::new();
        loop {
            let Some(frame) = self.replies.recv().await else {
                return Err(WorkerError::Died { pid: self.pid });
            };
            match frame.kind {
                FrameKind::Delta => deltas.push(frame.body),
                FrameKind::Loaded
                | FrameKind::LoadFailed
                | FrameKind::Done
                | FrameKind::Pong
                | FrameKind::Error => return Ok((frame, deltas)),
                other => {
                    return Err(WorkerError::Protocol(format!("unexpected {other:?} in reply")));
                },
            }
        }
    }

    /// Round trip that must end in `expected`.
    async fn call(
        &mut self,
        request: WorkerFrame,
        expected: FrameKind,
    ) -> Result<Vec<Bytes>, WorkerError> {
        let (reply, deltas) = self.request(request).await?;
        if reply.kind == expected {
            return Ok(deltas);
        }
        Err(self.unexpected(&reply))
    }

    fn unexpected(&self, reply: &WorkerFrame) -> WorkerError {
        match reply.kind {
            FrameKind::Error => {
                let message = reply.text_body();
                WorkerError::Protocol(format!("worker {} reported: {message}", self.pid))
            },
            other => WorkerError::Protocol(format!("unexpected {other:?} in reply")),
        }
    }
}

#[async_trait]
impl<S> Worker for ProcessWorker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn pid(&self) -> u32 {
        self.pid
    }

    fn probe(&self) -> WorkerProbe {
        self.probe.clone()
    }

    fn engine_version(&self) -> Option<&str> {
        Some(&self.engine_version)
    }

    async fn bind(&mut self, document: &DocumentId) -> Result<LoadOutcome, WorkerError> {
        let (reply, _) = self.request(WorkerFrame::text(FrameKind::Load, document.as_str())).await?;
        match reply.kind {
            FrameKind::Loaded => Ok(LoadOutcome::Loaded),
            FrameKind::LoadFailed => Ok(LoadOutcome::Refused(reply.text_body())),
            _ => Err(self.unexpected(&reply)),
        }
    }

    async fn join(&mut self, session: SessionId) -> Result<WorkerReply, WorkerError> {
        let request = WorkerFrame::for_session(FrameKind::Join, session, &[]);
        let deltas = self.call(request, FrameKind::Done).await?;
        Ok(WorkerReply::new(deltas))
    }

    async fn leave(&mut self, session: SessionId) -> Result<(), WorkerError> {
        let request = WorkerFrame::for_session(FrameKind::Leave, session, &[]);
        self.call(request, FrameKind::Done).await?;
        Ok(())
    }

    async fn send(
        &mut self,
        session: SessionId,
        payload: Bytes,
    ) -> Result<WorkerReply, WorkerError> {
        let request = WorkerFrame::for_session(FrameKind::Edit, session, &payload);
        let deltas = self.call(request, FrameKind::Done).await?;
        Ok(WorkerReply::new(deltas))
    }

    async fn flush(&mut self) -> Result<(), WorkerError> {
        self.call(WorkerFrame::bare(FrameKind::Flush), FrameKind::Done).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), WorkerError> {
        self.call(WorkerFrame::bare(FrameKind::Ping), FrameKind::Pong).await?;
        Ok(())
    }

    async fn terminate(&mut self) {
        if self.probe.is_alive() {
            let terminate = WorkerFrame::bare(FrameKind::Terminate);
            if let Err(err) = terminate.write_to(&mut self.writer).await {
                tracing::debug!(pid = self.pid, error = %err, "terminate frame not delivered");
            }
            let _ = self.writer.shutdown().await;
        }
        self.liveness.mark_dead();
    }
}

impl<S> Drop for ProcessWorker<S> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Read frames off the socket until it closes, then mark the worker dead.
async fn read_frames<R>(
    mut reader: R,
    frames: mpsc::UnboundedSender<WorkerFrame>,
    liveness: Arc<WorkerLiveness>,
    pid: u32,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match WorkerFrame::read_from(&mut reader).await {
            Ok(Some(frame)) => {
                if frames.send(frame).is_err() {
                    break;
                }
            },
            Ok(None) => {
                tracing::debug!(pid, "worker closed its socket");
                break;
            },
            Err(err) => {
                tracing::warn!(pid, error = %err, "worker socket failed");
                break;
            },
        }
    }
    liveness.mark_dead();
}
