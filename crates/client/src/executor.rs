//! Code and command execution against a sandbox session.
//!
//! Executions hold the session's single `Busy` slot: a concurrent attempt is
//! rejected with a busy error, never queued. Collected runs suspend until
//! the terminal result; streaming runs hand back a finite, single-consumption
//! stream of output chunks that returns the session to `Idle` when exhausted
//! or cancelled.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;

use minibox_core::protocol::{ExecKind, OutputChunk, RequestBody, RequestId, ResponseBody, StreamKind};
use minibox_core::{Error, Result, TransportError};

use crate::session::{SandboxState, SessionInner};
use crate::transport::PendingCall;

/// How long the remote side gets to acknowledge an abort before the
/// session is considered unusable.
const ABORT_ACK_GRACE: Duration = Duration::from_secs(2);

// =============================================================================
// Execution Result
// =============================================================================

/// Collected result of one execution.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Exit code reported by the sandbox.
    pub exit_code: i64,
    /// Collected standard output.
    pub stdout: String,
    /// Collected standard error.
    pub stderr: String,
}

impl Execution {
    /// Whether the execution exited cleanly.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Both output streams, stderr appended after stdout.
    pub fn output(&self) -> String {
        let mut merged = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !merged.is_empty() && !merged.ends_with('\n') {
                merged.push('\n');
            }
            merged.push_str(&self.stderr);
        }
        merged
    }
}

// =============================================================================
// Executors
// =============================================================================

/// Runs code snippets in the sandbox's language runtime.
pub struct CodeExecutor {
    session: Arc<SessionInner>,
}

impl CodeExecutor {
    pub(crate) fn new(session: Arc<SessionInner>) -> Self {
        Self { session }
    }

    /// Run `code` and collect its output. `timeout` bounds the whole run;
    /// on expiry the request is aborted best-effort and the session stays
    /// usable.
    pub async fn run(&self, code: &str, timeout: Option<Duration>) -> Result<Execution> {
        run_collected(
            &self.session,
            ExecKind::Code,
            code.to_string(),
            Vec::new(),
            timeout,
        )
        .await
    }

    /// Run `code`, returning its output as a live stream.
    pub async fn stream(&self, code: &str, timeout: Option<Duration>) -> Result<OutputStream> {
        start_stream(
            &self.session,
            ExecKind::Code,
            code.to_string(),
            Vec::new(),
            timeout,
        )
        .await
    }
}

/// Runs shell commands in the sandbox.
pub struct CommandExecutor {
    session: Arc<SessionInner>,
}

impl CommandExecutor {
    pub(crate) fn new(session: Arc<SessionInner>) -> Self {
        Self { session }
    }

    /// Run `command` with `args` and collect its output.
    pub async fn run(
        &self,
        command: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<Execution> {
        run_collected(
            &self.session,
            ExecKind::Command,
            command.to_string(),
            args.iter().map(|a| a.to_string()).collect(),
            timeout,
        )
        .await
    }

    /// Run `command` with `args`, returning its output as a live stream.
    pub async fn stream(
        &self,
        command: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<OutputStream> {
        start_stream(
            &self.session,
            ExecKind::Command,
            command.to_string(),
            args.iter().map(|a| a.to_string()).collect(),
            timeout,
        )
        .await
    }
}

// =============================================================================
// Collected Execution
// =============================================================================

async fn run_collected(
    session: &Arc<SessionInner>,
    kind: ExecKind,
    payload: String,
    args: Vec<String>,
    timeout: Option<Duration>,
) -> Result<Execution> {
    let transport = session.transport.clone();
    let id = transport.next_id();
    session.begin_execution(id)?;

    let body = RequestBody::Execute {
        kind,
        payload,
        args,
    };
    let (call, mut chunks) = match transport.request_streaming(id, Some(&session.name), body).await
    {
        Ok(pair) => pair,
        Err(e) => {
            session.settle(state_after_error(&e));
            return Err(e);
        }
    };

    let mut stdout = String::new();
    let mut stderr = String::new();

    let outcome: Result<ResponseBody> = {
        let collect = async {
            while let Some(chunk) = chunks.recv().await {
                match chunk.stream {
                    StreamKind::Stdout => stdout.push_str(&chunk.data),
                    StreamKind::Stderr => stderr.push_str(&chunk.data),
                }
            }
            // The chunk channel closes when the response arrives.
            call.wait().await
        };
        match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, collect).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    transport.forget(id);
                    transport.abort(Some(&session.name), id).await;
                    Err(Error::timeout("execute", deadline))
                }
            },
            None => collect.await,
        }
    };

    match outcome {
        Ok(ResponseBody::ExecFinished { exit_code }) => {
            session.settle(SandboxState::Idle);
            tracing::debug!(
                sandbox = %session.name,
                request = %id,
                exit_code,
                "execution finished"
            );
            Ok(Execution {
                exit_code,
                stdout,
                stderr,
            })
        }
        Ok(other) => {
            session.settle(SandboxState::Failed);
            Err(Error::protocol(format!(
                "unexpected response to execute: {:?}",
                other
            )))
        }
        Err(e) => {
            session.settle(state_after_error(&e));
            Err(e)
        }
    }
}

/// Where the session lands when an execution fails with `error`.
fn state_after_error(error: &Error) -> SandboxState {
    match error {
        // The sandbox itself is assumed still usable after a local timeout,
        // a deliberate cancellation, or a server-reported call failure.
        Error::Timeout { .. } | Error::Remote { .. } => SandboxState::Idle,
        Error::Transport(TransportError::Cancelled) => SandboxState::Idle,
        _ => SandboxState::Failed,
    }
}

// =============================================================================
// Streaming Execution
// =============================================================================

async fn start_stream(
    session: &Arc<SessionInner>,
    kind: ExecKind,
    payload: String,
    args: Vec<String>,
    timeout: Option<Duration>,
) -> Result<OutputStream> {
    let transport = session.transport.clone();
    let id = transport.next_id();
    session.begin_execution(id)?;

    let body = RequestBody::Execute {
        kind,
        payload,
        args,
    };
    match transport.request_streaming(id, Some(&session.name), body).await {
        Ok((call, chunks)) => Ok(OutputStream {
            session: session.clone(),
            id,
            chunks,
            call: Some(call),
            timeout,
            deadline: timeout.map(|d| Box::pin(tokio::time::sleep(d))),
            exit_code: None,
            finished: false,
        }),
        Err(e) => {
            session.settle(state_after_error(&e));
            Err(e)
        }
    }
}

/// Live output of one streaming execution.
///
/// Finite: ends when the remote execution terminates. Consuming it to the
/// end (or cancelling) returns the session to `Idle`.
pub struct OutputStream {
    session: Arc<SessionInner>,
    id: RequestId,
    chunks: mpsc::UnboundedReceiver<OutputChunk>,
    call: Option<PendingCall>,
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
    exit_code: Option<i64>,
    finished: bool,
}

impl OutputStream {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Exit code of the execution, available once the stream is exhausted.
    pub fn exit_code(&self) -> Option<i64> {
        self.exit_code
    }

    fn finish(&mut self, next: SandboxState) {
        if !self.finished {
            self.finished = true;
            self.session.settle(next);
        }
    }

    /// Cancel the execution. The transport sends an abort to the remote
    /// side; a confirmed abort leaves the session `Idle`, an unconfirmed
    /// one leaves it `Failed`.
    pub async fn cancel(mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let transport = self.session.transport.clone();
        transport.forget(self.id);

        let ack = transport
            .request(
                Some(&self.session.name),
                RequestBody::Abort { target: self.id },
            )
            .await;
        let confirmed = match ack {
            Ok(call) => matches!(
                tokio::time::timeout(ABORT_ACK_GRACE, call.wait()).await,
                Ok(Ok(_))
            ),
            Err(_) => false,
        };

        if confirmed {
            self.finish(SandboxState::Idle);
            tracing::debug!(
                sandbox = %self.session.name,
                request = %self.id,
                "execution aborted"
            );
            Ok(())
        } else {
            self.finish(SandboxState::Failed);
            Err(Error::timeout("abort", ABORT_ACK_GRACE))
        }
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("request", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Stream for OutputStream {
    type Item = Result<OutputChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(sleep) = this.deadline.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                let after = this.timeout.unwrap_or(ABORT_ACK_GRACE);
                this.session.transport.forget(this.id);
                fire_abort(&this.session, this.id);
                this.finish(SandboxState::Idle);
                return Poll::Ready(Some(Err(Error::timeout("execute", after))));
            }
        }

        match this.chunks.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {
                // Chunk channel closed: the terminal response is in.
                let call = match this.call.as_mut() {
                    Some(call) => call,
                    None => {
                        this.finish(SandboxState::Failed);
                        return Poll::Ready(None);
                    }
                };
                match Pin::new(&mut call.rx).poll(cx) {
                    Poll::Ready(Ok(Ok(ResponseBody::ExecFinished { exit_code }))) => {
                        this.exit_code = Some(exit_code);
                        this.finish(SandboxState::Idle);
                        Poll::Ready(None)
                    }
                    Poll::Ready(Ok(Ok(other))) => {
                        this.finish(SandboxState::Failed);
                        Poll::Ready(Some(Err(Error::protocol(format!(
                            "unexpected response to execute: {:?}",
                            other
                        )))))
                    }
                    Poll::Ready(Ok(Err(e))) => {
                        let next = state_after_error(&e);
                        this.finish(next);
                        Poll::Ready(Some(Err(e)))
                    }
                    Poll::Ready(Err(_)) => {
                        this.finish(SandboxState::Idle);
                        Poll::Ready(Some(Err(TransportError::Cancelled.into())))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Dropped mid-stream: abort best-effort and let the outcome decide
        // the session's state.
        self.finished = true;
        self.session.transport.forget(self.id);
        spawn_confirmed_abort(&self.session, self.id);
    }
}

/// Fire-and-forget abort, used where nobody can await the acknowledgment.
fn fire_abort(session: &Arc<SessionInner>, id: RequestId) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let session = session.clone();
        handle.spawn(async move {
            session.transport.abort(Some(&session.name), id).await;
        });
    }
}

/// Abort with confirmation tracking: the session settles `Idle` if the
/// remote confirms within the grace period, `Failed` otherwise.
fn spawn_confirmed_abort(session: &Arc<SessionInner>, id: RequestId) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let session = session.clone();
            handle.spawn(async move {
                let ack = session
                    .transport
                    .request(Some(&session.name), RequestBody::Abort { target: id })
                    .await;
                let confirmed = match ack {
                    Ok(call) => matches!(
                        tokio::time::timeout(ABORT_ACK_GRACE, call.wait()).await,
                        Ok(Ok(_))
                    ),
                    Err(_) => false,
                };
                session.settle(if confirmed {
                    SandboxState::Idle
                } else {
                    SandboxState::Failed
                });
            });
        }
        Err(_) => session.settle(SandboxState::Failed),
    }
}

// =============================================================================
// Tests
// =============================================================================
