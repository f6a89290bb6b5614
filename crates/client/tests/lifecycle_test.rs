//! End-to-end lifecycle tests against a scripted in-memory service.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_stream::StreamExt;

use minibox_client::{MockConnection, MockRemote, Orchestrator, Sandbox, SandboxState, Service, Transport};
use minibox_core::protocol::{RequestBody, ResponseBody, StreamKind};
use minibox_core::ClientConfig;

/// Plays the service side: acknowledges lifecycle requests, stores files,
/// and streams canned output for executions.
fn run_service(mut remote: MockRemote) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut files: HashMap<String, String> = HashMap::new();
        let mut destroys = 0usize;
        while let Some(frame) = remote.next_request().await {
            match frame.body {
                RequestBody::CreateSandbox { .. } => remote.respond(
                    frame.id,
                    ResponseBody::Created {
                        sandbox: frame.sandbox.clone().unwrap_or_default(),
                    },
                ),
                RequestBody::WriteFile { path, data } => {
                    files.insert(path, data);
                    remote.respond(frame.id, ResponseBody::Ack);
                }
                RequestBody::ReadFile { path } => match files.get(&path) {
                    Some(data) => remote.respond(
                        frame.id,
                        ResponseBody::FileContents { data: data.clone() },
                    ),
                    None => remote.fail(frame.id, "not_found", "no such file"),
                },
                RequestBody::ListFiles { .. } => remote.respond(
                    frame.id,
                    ResponseBody::Entries {
                        entries: Vec::new(),
                    },
                ),
                RequestBody::Execute { .. } => {
                    remote.chunk(frame.id, StreamKind::Stdout, 0, "line 1\n");
                    remote.chunk(frame.id, StreamKind::Stdout, 1, "line 2\n");
                    remote.respond(frame.id, ResponseBody::ExecFinished { exit_code: 0 });
                }
                RequestBody::DestroySandbox => {
                    destroys += 1;
                    remote.respond(frame.id, ResponseBody::Ack);
                }
                RequestBody::Abort { .. } => remote.respond(frame.id, ResponseBody::Ack),
            }
        }
        destroys
    })
}

fn harness() -> (Arc<Transport>, tokio::task::JoinHandle<usize>, ClientConfig) {
    let (conn, remote) = MockConnection::pair();
    let transport = Arc::new(Transport::from_connection(Arc::new(conn)));
    let service = run_service(remote);
    (transport, service, ClientConfig::default())
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let (transport, service, config) = harness();

    let sandbox = Sandbox::create(transport.clone(), &config, "python:3.12", vec![])
        .await
        .unwrap();
    assert_eq!(sandbox.state(), SandboxState::Idle);

    // Upload a script, run it, read a result file back.
    let fs = sandbox.fs();
    fs.write("main.py", b"print('line 1')\nprint('line 2')\n")
        .await
        .unwrap();

    let execution = sandbox.code().run("exec(open('main.py').read())", None)
        .await
        .unwrap();
    assert!(execution.success());
    assert_eq!(execution.stdout, "line 1\nline 2\n");
    assert_eq!(sandbox.state(), SandboxState::Idle);

    let script = fs.read("main.py").await.unwrap();
    assert_eq!(script, b"print('line 1')\nprint('line 2')\n");

    sandbox.destroy().await.unwrap();
    assert_eq!(sandbox.state(), SandboxState::Terminated);

    transport.close().await;
    assert_eq!(service.await.unwrap(), 1);
}

#[tokio::test]
async fn test_streaming_execution_end_to_end() {
    let (transport, service, config) = harness();

    let sandbox = Sandbox::create(transport.clone(), &config, "python:3.12", vec![])
        .await
        .unwrap();

    let mut stream = sandbox
        .command()
        .stream("cat", &["main.py"], None)
        .await
        .unwrap();

    let mut lines = Vec::new();
    while let Some(chunk) = stream.next().await {
        lines.push(chunk.unwrap().data);
    }
    assert_eq!(lines, vec!["line 1\n", "line 2\n"]);
    assert_eq!(stream.exit_code(), Some(0));
    assert_eq!(sandbox.state(), SandboxState::Idle);

    sandbox.destroy().await.unwrap();
    transport.close().await;
    assert_eq!(service.await.unwrap(), 1);
}

#[tokio::test]
async fn test_scoped_session_cleans_up() {
    let (transport, service, config) = harness();

    let stdout = Sandbox::scope(
        transport.clone(),
        &config,
        "python:3.12",
        vec!["LOG_LEVEL=debug".to_string()],
        |sandbox| async move {
            let execution = sandbox.code().run("print('hi')", None).await?;
            Ok(execution.stdout)
        },
    )
    .await
    .unwrap();
    assert_eq!(stdout, "line 1\nline 2\n");

    transport.close().await;
    assert_eq!(service.await.unwrap(), 1);
}

#[tokio::test]
async fn test_orchestrator_directory_lifecycle() {
    let (transport, service, config) = harness();

    let orchestrator = Orchestrator::new(
        transport.clone(),
        vec![
            Service::new("runner", "python:3.12"),
            Service::new("shell", "alpine"),
        ],
    )
    .with_config(config)
    .with_groups(vec!["ci".to_string()]);

    let runner = orchestrator.get("runner").await.unwrap();
    let shell = orchestrator.get("shell").await.unwrap();
    assert_ne!(runner.name(), shell.name());
    assert_eq!(orchestrator.get("runner").await.unwrap().name(), runner.name());
    assert_eq!(orchestrator.list().await.len(), 2);

    orchestrator.shutdown().await.unwrap();
    assert!(orchestrator.list().await.is_empty());
    assert_eq!(runner.state(), SandboxState::Terminated);
    assert_eq!(shell.state(), SandboxState::Terminated);

    transport.close().await;
    assert_eq!(service.await.unwrap(), 2);
}
