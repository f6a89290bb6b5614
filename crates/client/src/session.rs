//! Sandbox sessions and their lifecycle.
//!
//! A [`Sandbox`] owns one remote sandbox:
//! `Creating → Idle ↔ Busy → Terminating → Terminated`, with `Failed` for a
//! create that never acknowledged or an abort that was never confirmed.
//! `Terminated` is absorbing; nothing succeeds afterwards.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use minibox_core::protocol::{RequestBody, RequestId, ResponseBody};
use minibox_core::{ClientConfig, Error, Result};

use crate::executor::{CodeExecutor, CommandExecutor};
use crate::filesystem::FileSystem;
use crate::transport::Transport;

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a sandbox session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Create request sent, acknowledgment outstanding.
    Creating,
    /// Ready for an execution.
    Idle,
    /// Exactly one execution in flight.
    Busy,
    /// Destroy request sent, acknowledgment outstanding.
    Terminating,
    /// Gone; absorbing.
    Terminated,
    /// Unusable: creation timed out or an abort went unconfirmed.
    Failed,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::Creating => "creating",
            SandboxState::Idle => "idle",
            SandboxState::Busy => "busy",
            SandboxState::Terminating => "terminating",
            SandboxState::Terminated => "terminated",
            SandboxState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Session Internals
// =============================================================================

pub(crate) struct SessionInner {
    pub(crate) name: String,
    pub(crate) base: String,
    pub(crate) env: Vec<String>,
    pub(crate) workdir: String,
    pub(crate) request_timeout: Duration,
    teardown_timeout: Duration,
    pub(crate) transport: Arc<Transport>,
    state: Mutex<SandboxState>,
    destroyed: AtomicBool,
    created_at: i64,
}

impl SessionInner {
    pub(crate) fn state(&self) -> SandboxState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: SandboxState) {
        *self.state.lock().unwrap() = next;
    }

    /// Atomically claim the session for one execution. Rejects, never
    /// queues: a concurrent attempt observes `Busy`.
    pub(crate) fn begin_execution(&self, request: RequestId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            SandboxState::Idle => {
                *state = SandboxState::Busy;
                Ok(())
            }
            SandboxState::Busy => Err(Error::busy(&self.name, request)),
            other => Err(Error::invalid_state(&self.name, other, "execute")),
        }
    }

    /// Leave `Busy` for `next`, unless a destroy raced us out of it.
    pub(crate) fn settle(&self, next: SandboxState) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, SandboxState::Busy) {
            *state = next;
        }
    }

    /// Filesystem operations may interleave with executions; they only
    /// require the session to still be alive.
    pub(crate) fn ensure_open(&self, operation: &'static str) -> Result<()> {
        let state = self.state.lock().unwrap();
        match *state {
            SandboxState::Idle | SandboxState::Busy => Ok(()),
            other => Err(Error::invalid_state(&self.name, other, operation)),
        }
    }
}

// =============================================================================
// Sandbox
// =============================================================================

/// Handle to one remote sandbox. Cheap to clone; all clones share the
/// session's lifecycle state.
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<SessionInner>,
}

impl Sandbox {
    /// Provision a sandbox from `base` and suspend until it is ready.
    ///
    /// On acknowledgment timeout the session is left `Failed` and the call
    /// returns a timeout error.
    pub async fn create(
        transport: Arc<Transport>,
        config: &ClientConfig,
        base: impl Into<String>,
        env: Vec<String>,
    ) -> Result<Self> {
        let inner = Arc::new(SessionInner {
            name: format!("sb-{}", uuid::Uuid::new_v4()),
            base: base.into(),
            env,
            workdir: config.workdir.clone(),
            request_timeout: config.request_timeout(),
            teardown_timeout: config.teardown_timeout(),
            transport,
            state: Mutex::new(SandboxState::Creating),
            destroyed: AtomicBool::new(false),
            created_at: chrono::Utc::now().timestamp(),
        });

        let body = RequestBody::CreateSandbox {
            image: inner.base.clone(),
            env: inner.env.clone(),
            namespace: config.namespace.clone(),
        };
        let call = match inner.transport.request(Some(&inner.name), body).await {
            Ok(call) => call,
            Err(e) => {
                inner.set_state(SandboxState::Failed);
                return Err(e);
            }
        };
        let request = call.id();

        match tokio::time::timeout(config.create_timeout(), call.wait()).await {
            Ok(Ok(ResponseBody::Created { sandbox })) => {
                inner.set_state(SandboxState::Idle);
                tracing::info!(
                    sandbox = %sandbox,
                    image = %inner.base,
                    namespace = %config.namespace,
                    "sandbox ready"
                );
                Ok(Self { inner })
            }
            Ok(Ok(other)) => {
                inner.set_state(SandboxState::Failed);
                Err(Error::protocol(format!(
                    "unexpected response to create: {:?}",
                    other
                )))
            }
            Ok(Err(e)) => {
                inner.set_state(SandboxState::Failed);
                Err(e)
            }
            Err(_) => {
                inner.transport.forget(request);
                inner.transport.abort(Some(&inner.name), request).await;
                inner.set_state(SandboxState::Failed);
                tracing::warn!(sandbox = %inner.name, "sandbox creation timed out");
                Err(Error::timeout("create", config.create_timeout()))
            }
        }
    }

    /// Create a sandbox, run `body` against it, and destroy it exactly once
    /// on every exit path. The body's result wins over a teardown failure;
    /// a teardown failure after a successful body is surfaced.
    pub async fn scope<F, Fut, T>(
        transport: Arc<Transport>,
        config: &ClientConfig,
        base: impl Into<String>,
        env: Vec<String>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(Sandbox) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let sandbox = Sandbox::create(transport, config, base, env).await?;
        let result = body(sandbox.clone()).await;
        let released = sandbox.destroy().await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release)) => Err(release),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release)) => {
                tracing::warn!(
                    sandbox = %sandbox.name(),
                    error = %release,
                    "teardown failed while propagating body error"
                );
                Err(e)
            }
        }
    }

    /// Best-effort teardown. Attempts cleanup from any live state, `Failed`
    /// included; if the service never confirms, the caller is told the
    /// release is uncertain rather than the attempt being dropped.
    /// Subsequent calls are no-ops.
    pub async fn destroy(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = inner.state.lock().unwrap();
            if matches!(*state, SandboxState::Terminated) {
                return Ok(());
            }
            *state = SandboxState::Terminating;
        }

        let call = match inner
            .transport
            .request(Some(&inner.name), RequestBody::DestroySandbox)
            .await
        {
            Ok(call) => call,
            Err(e) => {
                inner.set_state(SandboxState::Terminated);
                return Err(Error::release_uncertain(
                    &inner.name,
                    format!("teardown request not sent: {}", e),
                ));
            }
        };

        match tokio::time::timeout(inner.teardown_timeout, call.wait()).await {
            Ok(Ok(_)) => {
                inner.set_state(SandboxState::Terminated);
                tracing::info!(sandbox = %inner.name, "sandbox destroyed");
                Ok(())
            }
            Ok(Err(e)) => {
                inner.set_state(SandboxState::Terminated);
                Err(Error::release_uncertain(&inner.name, e.to_string()))
            }
            Err(_) => {
                inner.set_state(SandboxState::Terminated);
                Err(Error::release_uncertain(
                    &inner.name,
                    format!("no teardown ack within {:?}", inner.teardown_timeout),
                ))
            }
        }
    }

    /// Executor for code snippets.
    pub fn code(&self) -> CodeExecutor {
        CodeExecutor::new(self.inner.clone())
    }

    /// Executor for shell commands.
    pub fn command(&self) -> CommandExecutor {
        CommandExecutor::new(self.inner.clone())
    }

    /// Handle to the sandbox's filesystem namespace.
    pub fn fs(&self) -> FileSystem {
        FileSystem::new(self.inner.clone())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn base(&self) -> &str {
        &self.inner.base
    }

    pub fn env(&self) -> &[String] {
        &self.inner.env
    }

    pub fn state(&self) -> SandboxState {
        self.inner.state()
    }

    /// Unix timestamp of local session creation.
    pub fn created_at(&self) -> i64 {
        self.inner.created_at
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("name", &self.inner.name)
            .field("base", &self.inner.base)
            .field("state", &self.inner.state())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
