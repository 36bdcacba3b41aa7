//! Runs the CLI tool for one request and relays its output as events.
//!
//! Each spawn gets its own pump task that owns the child process. The task
//! reads stdout and stderr as they become ready and pushes events into a
//! small bounded channel, so a slow consumer backs up into the child's pipes.
//! When the consumer drops the [`ProcessStream`] the task notices the closed
//! channel and kills the child's whole process group before it returns.

use crate::protocol::StreamEvent;
use crate::request::ChatRequest;
use crate::resolver::CommandResolver;
use crate::utf8::Utf8Decoder;
use futures::{Stream, StreamExt};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

const READ_CHUNK: usize = 8 * 1024;
const EVENT_BUFFER: usize = 16;
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
#[cfg(unix)]
const GROUP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to start {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} started without a {pipe} pipe")]
    MissingPipe { program: String, pipe: &'static str },
}

/// Fully expanded command line for one request.
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

// Environment values carry API keys, so only the names are printed.
impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(key, _)| key.as_str()).collect();
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .field("working_dir", &self.working_dir)
            .finish()
    }
}

impl Invocation {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[derive(Clone)]
pub struct ProcessBridge {
    resolver: Arc<CommandResolver>,
    api_key_env: String,
}

impl ProcessBridge {
    pub fn new(resolver: Arc<CommandResolver>, api_key_env: impl Into<String>) -> Self {
        Self {
            resolver,
            api_key_env: api_key_env.into(),
        }
    }

    pub async fn invocation(&self, request: &ChatRequest) -> Invocation {
        let command = self.resolver.resolve().await;

        let mut args = command.leading_args.clone();
        args.push("--prompt".to_string());
        args.push(request.prompt.clone());
        if request.sandbox {
            args.push("--sandbox".to_string());
        }
        if request.yolo {
            args.push("--yolo".to_string());
        }
        if let Some(model) = request.model.as_deref().filter(|model| !model.is_empty()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }

        let env = request
            .api_key
            .iter()
            .map(|key| (self.api_key_env.clone(), key.clone()))
            .collect();

        Invocation {
            program: command.executable.clone(),
            args,
            env,
            working_dir: request
                .working_directory
                .as_deref()
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Starts the tool. An error here means no output was ever produced.
    pub async fn spawn(&self, request: &ChatRequest) -> Result<ProcessStream, SpawnError> {
        let invocation = self.invocation(request).await;
        let span = info_span!(
            "process",
            request_id = %Uuid::new_v4(),
            program = %invocation.program
        );

        let mut child = invocation.command().spawn().map_err(|source| {
            span.in_scope(|| warn!(error = %source, "failed to spawn tool"));
            SpawnError::Start {
                program: invocation.program.clone(),
                source,
            }
        })?;

        let pid = child.id();
        let stdout = child.stdout.take().ok_or_else(|| SpawnError::MissingPipe {
            program: invocation.program.clone(),
            pipe: "stdout",
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SpawnError::MissingPipe {
            program: invocation.program.clone(),
            pipe: "stderr",
        })?;
        span.in_scope(|| info!(pid = ?pid, args = ?invocation.args, "spawned tool"));

        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(pump(child, Pipe::new(stdout), Pipe::new(stderr), events).instrument(span));

        Ok(ProcessStream {
            events: ReceiverStream::new(rx),
            pid,
        })
    }

    /// Like [`ProcessBridge::spawn`], but a spawn failure becomes the
    /// stream's only event.
    pub async fn stream(&self, request: &ChatRequest) -> ProcessStream {
        match self.spawn(request).await {
            Ok(stream) => stream,
            Err(err) => ProcessStream::failed(err.to_string()),
        }
    }
}

/// Events of one subprocess. Dropping it terminates the subprocess.
pub struct ProcessStream {
    events: ReceiverStream<StreamEvent>,
    pid: Option<u32>,
}

impl ProcessStream {
    fn failed(message: String) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(StreamEvent::Error(message));
        Self {
            events: ReceiverStream::new(rx),
            pid: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Stream for ProcessStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

enum Readiness {
    Stdout(io::Result<usize>),
    Stderr(io::Result<usize>),
    Cancelled,
}

async fn pump<O, E>(
    mut child: Child,
    mut stdout: Pipe<O>,
    mut stderr: Pipe<E>,
    events: mpsc::Sender<StreamEvent>,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    #[cfg(unix)]
    let _group = child.id().map(|pid| GroupGuard(pid as libc::pid_t));

    while stdout.open || stderr.open {
        let ready = tokio::select! {
            _ = events.closed() => Readiness::Cancelled,
            read = stdout.read(), if stdout.open => Readiness::Stdout(read),
            read = stderr.read(), if stderr.open => Readiness::Stderr(read),
        };

        let event = match ready {
            Readiness::Cancelled => return cancel(&mut child).await,
            Readiness::Stdout(Ok(0)) => stdout.finish().map(StreamEvent::Stdout),
            Readiness::Stdout(Ok(n)) => stdout.take(n).map(StreamEvent::Stdout),
            Readiness::Stderr(Ok(0)) => stderr.finish().map(StreamEvent::Stderr),
            Readiness::Stderr(Ok(n)) => stderr.take(n).map(StreamEvent::Stderr),
            Readiness::Stdout(Err(err)) | Readiness::Stderr(Err(err)) => {
                warn!(error = %err, "failed to read tool output");
                terminate(&mut child).await;
                let _ = events
                    .send(StreamEvent::Error(format!("failed to read tool output: {err}")))
                    .await;
                return;
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                return cancel(&mut child).await;
            }
        }
    }

    let exited = tokio::select! {
        _ = events.closed() => None,
        status = child.wait() => Some(status),
    };
    let terminal = match exited {
        None => return cancel(&mut child).await,
        Some(Ok(status)) => {
            info!(%status, "tool exited");
            StreamEvent::Close(exit_code(status))
        }
        Some(Err(err)) => {
            warn!(error = %err, "failed to wait for tool");
            StreamEvent::Error(format!("failed to wait for tool: {err}"))
        }
    };
    let _ = events.send(terminal).await;
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

async fn cancel(child: &mut Child) {
    info!("consumer went away, terminating tool");
    terminate(child).await;
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let group = pid as libc::pid_t;
        let deadline = tokio::time::Instant::now() + TERMINATE_GRACE;

        signal_group(group, libc::SIGTERM);
        if let Ok(Ok(status)) = tokio::time::timeout_at(deadline, child.wait()).await {
            debug!(%status, "tool exited after SIGTERM");
        }
        while group_alive(group) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(GROUP_POLL).await;
        }
        // The leader exiting says nothing about the rest of its group.
        signal_group(group, libc::SIGKILL);
    }

    if matches!(child.try_wait(), Ok(None)) {
        if let Err(err) = child.kill().await {
            warn!(error = %err, "failed to kill tool");
        }
    }
}

// The child leads its own process group, so its pid is also the group id.
#[cfg(unix)]
fn signal_group(group: libc::pid_t, signal: libc::c_int) {
    unsafe {
        libc::kill(-group, signal);
    }
}

/// Kills whatever is left of the process group once the pump is gone, even
/// when the runtime drops the pump task mid-flight.
#[cfg(unix)]
struct GroupGuard(libc::pid_t);

#[cfg(unix)]
impl Drop for GroupGuard {
    fn drop(&mut self) {
        signal_group(self.0, libc::SIGKILL);
    }
}

#[cfg(unix)]
fn group_alive(group: libc::pid_t) -> bool {
    unsafe { libc::kill(-group, 0) == 0 }
}

struct Pipe<R> {
    reader: R,
    buf: Box<[u8]>,
    decoder: Utf8Decoder,
    open: bool,
}

impl<R: AsyncRead + Unpin> Pipe<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: vec![0; READ_CHUNK].into_boxed_slice(),
            decoder: Utf8Decoder::default(),
            open: true,
        }
    }

    async fn read(&mut self) -> io::Result<usize> {
        self.reader.read(&mut self.buf).await
    }

    fn take(&mut self, n: usize) -> Option<String> {
        let text = self.decoder.push(&self.buf[..n]);
        (!text.is_empty()).then_some(text)
    }

    fn finish(&mut self) -> Option<String> {
        self.open = false;
        self.decoder.flush()
    }
}
