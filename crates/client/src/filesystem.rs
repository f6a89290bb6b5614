//! Filesystem access scoped to a sandbox's namespace.
//!
//! Every path is validated against the namespace root before it crosses the
//! wire; traversal and absolute paths are rejected locally. Operations may
//! interleave with a running execution, but one handle performs them one at
//! a time to preserve per-handle ordering.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::Mutex;

use minibox_core::fs_policy;
use minibox_core::protocol::{FileEntry, RequestBody, ResponseBody};
use minibox_core::{Error, Result};

use crate::session::SessionInner;

/// Handle to a sandbox's filesystem namespace.
pub struct FileSystem {
    session: Arc<SessionInner>,
    serial: Mutex<()>,
}

impl FileSystem {
    pub(crate) fn new(session: Arc<SessionInner>) -> Self {
        Self {
            session,
            serial: Mutex::new(()),
        }
    }

    /// Read a file, returning its bytes.
    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = self.normalize(path)?;
        let _serial = self.serial.lock().await;
        self.session.ensure_open("read file")?;

        match self.call(RequestBody::ReadFile { path }).await? {
            ResponseBody::FileContents { data } => BASE64
                .decode(data.as_bytes())
                .map_err(|e| Error::protocol(format!("undecodable file payload: {}", e))),
            other => Err(Error::protocol(format!(
                "unexpected response to read: {:?}",
                other
            ))),
        }
    }

    /// Write `data` to a file, creating or truncating it.
    pub async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = self.normalize(path)?;
        let _serial = self.serial.lock().await;
        self.session.ensure_open("write file")?;

        let size = data.len();
        let body = RequestBody::WriteFile {
            path: path.clone(),
            data: BASE64.encode(data),
        };
        match self.call(body).await? {
            ResponseBody::Ack => {
                tracing::debug!(
                    sandbox = %self.session.name,
                    path = %path,
                    size,
                    "file written"
                );
                Ok(())
            }
            other => Err(Error::protocol(format!(
                "unexpected response to write: {:?}",
                other
            ))),
        }
    }

    /// List a directory.
    pub async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = self.normalize(path)?;
        let _serial = self.serial.lock().await;
        self.session.ensure_open("list files")?;

        match self.call(RequestBody::ListFiles { path }).await? {
            ResponseBody::Entries { entries } => Ok(entries),
            other => Err(Error::protocol(format!(
                "unexpected response to list: {:?}",
                other
            ))),
        }
    }

    fn normalize(&self, path: &str) -> Result<String> {
        let normalized = fs_policy::validate_path(&self.session.workdir, path)?;
        if normalized.as_os_str().is_empty() {
            Ok(".".to_string())
        } else {
            Ok(normalized.to_string_lossy().into_owned())
        }
    }

    async fn call(&self, body: RequestBody) -> Result<ResponseBody> {
        let transport = &self.session.transport;
        let call = transport.request(Some(&self.session.name), body).await?;
        let id = call.id();

        match tokio::time::timeout(self.session.request_timeout, call.wait()).await {
            Ok(result) => result,
            Err(_) => {
                transport.forget(id);
                Err(Error::timeout(
                    "filesystem request",
                    self.session.request_timeout,
                ))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{MockConnection, MockRemote};
    use crate::session::Sandbox;
    use crate::transport::Transport;
    use minibox_core::ClientConfig;

    async fn ready_sandbox() -> (Sandbox, MockRemote) {
        let (conn, mut remote) = MockConnection::pair();
        let transport = Arc::new(Transport::from_connection(Arc::new(conn)));
        let config = ClientConfig::default();

        let create = tokio::spawn(async move {
            Sandbox::create(transport, &config, "python:3.12", vec![]).await
        });
        let frame = remote.next_request().await.unwrap();
        remote.respond(
            frame.id,
            ResponseBody::Created {
                sandbox: frame.sandbox.clone().unwrap(),
            },
        );
        (create.await.unwrap().unwrap(), remote)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (sandbox, mut remote) = ready_sandbox().await;

        // The mock remote stores the last written payload.
        let server = tokio::spawn(async move {
            let mut stored = String::new();
            while let Some(frame) = remote.next_request().await {
                match frame.body {
                    RequestBody::WriteFile { data, .. } => {
                        stored = data;
                        remote.respond(frame.id, ResponseBody::Ack);
                    }
                    RequestBody::ReadFile { .. } => remote.respond(
                        frame.id,
                        ResponseBody::FileContents {
                            data: stored.clone(),
                        },
                    ),
                    RequestBody::DestroySandbox => {
                        remote.respond(frame.id, ResponseBody::Ack);
                        break;
                    }
                    _ => remote.respond(frame.id, ResponseBody::Ack),
                }
            }
        });

        let fs = sandbox.fs();
        fs.write("hello.txt", b"hello sandbox").await.unwrap();
        let bytes = fs.read("hello.txt").await.unwrap();
        assert_eq!(bytes, b"hello sandbox");

        sandbox.destroy().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_traversal_rejected_locally() {
        let (sandbox, _remote) = ready_sandbox().await;
        let fs = sandbox.fs();

        let err = fs.read("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
        let err = fs.write("/etc/passwd", b"nope").await.unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_list_maps_entries() {
        let (sandbox, mut remote) = ready_sandbox().await;

        let list = tokio::spawn({
            let fs = sandbox.fs();
            async move { fs.list(".").await }
        });

        let frame = remote.next_request().await.unwrap();
        assert!(matches!(
            frame.body,
            RequestBody::ListFiles { ref path } if path == "."
        ));
        remote.respond(
            frame.id,
            ResponseBody::Entries {
                entries: vec![FileEntry {
                    name: "main.py".into(),
                    size: 120,
                    directory: false,
                }],
            },
        );

        let entries = list.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "main.py");
    }

    #[tokio::test]
    async fn test_filesystem_ops_fail_after_destroy() {
        let (sandbox, mut remote) = ready_sandbox().await;

        let destroy = tokio::spawn({
            let sandbox = sandbox.clone();
            async move { sandbox.destroy().await }
        });
        let frame = remote.next_request().await.unwrap();
        remote.respond(frame.id, ResponseBody::Ack);
        destroy.await.unwrap().unwrap();

        let err = sandbox.fs().read("main.py").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }
}
