//! Service-to-session orchestration.
//!
//! The orchestrator maps stable service names onto live sandbox sessions:
//! asking for the same name twice yields the same session while it is
//! alive, and a fresh one after the old session terminated or failed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use minibox_core::{ClientConfig, Error, Result};

use crate::session::{Sandbox, SandboxState};
use crate::transport::Transport;

/// Declaration of a named service and the image backing it.
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub base: String,
}

impl Service {
    pub fn new(name: impl Into<String>, base: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: base.into(),
        }
    }

    /// A service without an explicit image; it runs on the configured
    /// default image.
    pub fn from_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: String::new(),
        }
    }
}

/// Directory of sandbox sessions keyed by service name.
pub struct Orchestrator {
    transport: Arc<Transport>,
    config: ClientConfig,
    services: Vec<Service>,
    groups: Vec<String>,
    active: RwLock<HashMap<String, Sandbox>>,
}

impl Orchestrator {
    pub fn new(transport: Arc<Transport>, services: Vec<Service>) -> Self {
        Self {
            transport,
            config: ClientConfig::default(),
            services,
            groups: Vec::new(),
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Record group labels for the directory. Labels are carried as
    /// metadata only; they do not affect placement.
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Resolve a service name to a live session, creating one on demand.
    ///
    /// An existing live session is reused as-is, busy or not. A session
    /// found terminated or failed is evicted and replaced.
    pub async fn get(&self, name: &str) -> Result<Sandbox> {
        let service = self
            .services
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| Error::not_found(name))?;

        if let Some(sandbox) = self.active.read().await.get(name) {
            if is_live(sandbox) {
                return Ok(sandbox.clone());
            }
        }

        let mut active = self.active.write().await;
        // Double-check: another caller may have replaced it while we
        // waited for the write lock.
        if let Some(sandbox) = active.get(name) {
            if is_live(sandbox) {
                return Ok(sandbox.clone());
            }
            tracing::info!(
                service = %name,
                sandbox = %sandbox.name(),
                state = %sandbox.state(),
                "evicting dead session"
            );
            active.remove(name);
        }

        let image = if service.base.is_empty() {
            self.config.default_image.clone()
        } else {
            service.base
        };
        let sandbox =
            Sandbox::create(self.transport.clone(), &self.config, image, vec![]).await?;
        tracing::info!(service = %name, sandbox = %sandbox.name(), "session provisioned");
        active.insert(name.to_string(), sandbox.clone());
        Ok(sandbox)
    }

    /// Snapshot of the currently tracked sessions.
    pub async fn list(&self) -> Vec<(String, Sandbox)> {
        self.active
            .read()
            .await
            .iter()
            .map(|(name, sandbox)| (name.clone(), sandbox.clone()))
            .collect()
    }

    /// Destroy every tracked session. All sessions get a teardown attempt;
    /// the first failure is reported after the sweep completes.
    pub async fn shutdown(&self) -> Result<()> {
        let drained: Vec<(String, Sandbox)> = self.active.write().await.drain().collect();

        let mut first_error = None;
        for (name, sandbox) in drained {
            if let Err(e) = sandbox.destroy().await {
                tracing::warn!(service = %name, error = %e, "teardown failed during shutdown");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

fn is_live(sandbox: &Sandbox) -> bool {
    !matches!(
        sandbox.state(),
        SandboxState::Terminated | SandboxState::Failed | SandboxState::Terminating
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{MockConnection, MockRemote};
    use minibox_core::protocol::{RequestBody, ResponseBody};

    fn harness(services: Vec<Service>) -> (Orchestrator, MockRemote) {
        let (conn, remote) = MockConnection::pair();
        let transport = Arc::new(Transport::from_connection(Arc::new(conn)));
        (Orchestrator::new(transport, services), remote)
    }

    /// Acknowledge creates and destroys, counting each.
    fn serve(mut remote: MockRemote) -> tokio::task::JoinHandle<(usize, usize)> {
        tokio::spawn(async move {
            let (mut creates, mut destroys) = (0usize, 0usize);
            while let Some(frame) = remote.next_request().await {
                match frame.body {
                    RequestBody::CreateSandbox { .. } => {
                        creates += 1;
                        remote.respond(
                            frame.id,
                            ResponseBody::Created {
                                sandbox: frame.sandbox.clone().unwrap_or_default(),
                            },
                        );
                    }
                    RequestBody::DestroySandbox => {
                        destroys += 1;
                        remote.respond(frame.id, ResponseBody::Ack);
                    }
                    _ => remote.respond(frame.id, ResponseBody::Ack),
                }
            }
            (creates, destroys)
        })
    }

    #[tokio::test]
    async fn test_same_name_yields_same_session() {
        let (orchestrator, remote) = harness(vec![Service::new("runner", "python:3.12")]);
        let server = serve(remote);

        let first = orchestrator.get("runner").await.unwrap();
        let second = orchestrator.get("runner").await.unwrap();
        assert_eq!(first.name(), second.name());

        orchestrator.shutdown().await.unwrap();

        // Releasing every transport handle disconnects the mock service.
        drop((first, second, orchestrator));
        let (creates, destroys) = server.await.unwrap();
        assert_eq!(creates, 1);
        assert_eq!(destroys, 1);
    }

    #[tokio::test]
    async fn test_service_without_image_uses_default() {
        let (orchestrator, mut remote) = harness(vec![Service::from_name("runner")]);

        let server = tokio::spawn(async move {
            let frame = remote.next_request().await.unwrap();
            let image = match &frame.body {
                RequestBody::CreateSandbox { image, .. } => image.clone(),
                other => panic!("unexpected request: {:?}", other),
            };
            remote.respond(
                frame.id,
                ResponseBody::Created {
                    sandbox: frame.sandbox.clone().unwrap_or_default(),
                },
            );
            image
        });

        let sandbox = orchestrator.get("runner").await.unwrap();
        assert_eq!(server.await.unwrap(), ClientConfig::default().default_image);
        assert_eq!(sandbox.state(), SandboxState::Idle);
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let (orchestrator, _remote) = harness(vec![Service::new("runner", "python:3.12")]);
        let err = orchestrator.get("builder").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(err.to_string(), "no service named 'builder' is configured");
    }

    #[tokio::test]
    async fn test_dead_session_is_replaced() {
        let (orchestrator, remote) = harness(vec![Service::new("runner", "alpine")]);
        let server = serve(remote);

        let first = orchestrator.get("runner").await.unwrap();
        first.destroy().await.unwrap();
        assert_eq!(first.state(), SandboxState::Terminated);

        let second = orchestrator.get("runner").await.unwrap();
        assert_ne!(first.name(), second.name());
        assert_eq!(second.state(), SandboxState::Idle);

        orchestrator.shutdown().await.unwrap();
        drop((first, second, orchestrator));
        let (creates, destroys) = server.await.unwrap();
        assert_eq!(creates, 2);
        assert_eq!(destroys, 2);
    }

    #[tokio::test]
    async fn test_list_tracks_sessions() {
        let (orchestrator, remote) = harness(vec![
            Service::new("runner", "python:3.12"),
            Service::new("builder", "rust:1.80"),
        ]);
        let _server = serve(remote);

        orchestrator.get("runner").await.unwrap();
        orchestrator.get("builder").await.unwrap();

        let mut names: Vec<String> = orchestrator
            .list()
            .await
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["builder", "runner"]);

        orchestrator.shutdown().await.unwrap();
        assert!(orchestrator.list().await.is_empty());
    }
}
