//! End-to-end exchanges between the client and the server over a local socket

#![cfg(unix)]

use parking_lot::Mutex;
use snixbridge::client::PipeClient;
use snixbridge::config::BridgeConfig;
use snixbridge::error::{ChannelError, LaunchError, ProtocolError};
use snixbridge::launcher::Launcher;
use snixbridge::protocol::SessionId;
use snixbridge::server::PipeServer;
use snixbridge::BridgeError;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

/// Launcher with no user logged on in session 1
#[derive(Default)]
struct FakeSessions {
    calls: Mutex<Vec<SessionId>>,
}

impl Launcher for FakeSessions {
    fn launch(&self, session_id: SessionId) -> Result<(), LaunchError> {
        self.calls.lock().push(session_id);
        if session_id == SessionId(1) {
            Err(LaunchError::token(
                snixbridge::error::LaunchStep::QueryUserToken,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ))
        } else {
            Ok(())
        }
    }
}

fn config_in(dir: &Path) -> BridgeConfig {
    BridgeConfig {
        pipe_name: dir.join("bridge.sock").to_string_lossy().into_owned(),
        connect_timeout_ms: 500,
        io_timeout_ms: 500,
        max_connections: 2,
        ..Default::default()
    }
}

fn start_server(config: &BridgeConfig, launcher: Arc<FakeSessions>) {
    let server = PipeServer::new(config, launcher);
    let listener = server.bind().unwrap();
    tokio::spawn(server.serve(listener));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_launch_into_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let launcher = Arc::new(FakeSessions::default());
    start_server(&config, launcher.clone());

    PipeClient::new(&config)
        .execute(SessionId(5))
        .await
        .unwrap();
    assert_eq!(*launcher.calls.lock(), vec![SessionId(5)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_launch_reported_to_client() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    start_server(&config, Arc::new(FakeSessions::default()));

    let err = PipeClient::new(&config)
        .execute(SessionId(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Protocol(ProtocolError::LaunchFailed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_service_listening() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    let err = PipeClient::new(&config)
        .execute(SessionId(5))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Channel(ChannelError::ServiceUnavailable { .. })
    ));
    assert!(err.to_string().contains("Is the SnixConnect service running?"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_survives_misbehaving_clients() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let launcher = Arc::new(FakeSessions::default());
    start_server(&config, launcher.clone());

    // Half a request, then gone
    let mut partial = UnixStream::connect(&config.pipe_name).await.unwrap();
    partial.write_all(&[0, 0]).await.unwrap();
    drop(partial);

    // Connected but silent until the read deadline
    let _silent = UnixStream::connect(&config.pipe_name).await.unwrap();

    PipeClient::new(&config)
        .execute(SessionId(7))
        .await
        .unwrap();
    assert_eq!(*launcher.calls.lock(), vec![SessionId(7)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_clients_beyond_limit() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let launcher = Arc::new(FakeSessions::default());
    start_server(&config, launcher.clone());

    let mut clients = Vec::new();
    for id in 2..8u32 {
        let client = PipeClient::new(&config);
        clients.push(tokio::spawn(async move {
            client.execute(SessionId(id)).await
        }));
    }

    for client in clients {
        client.await.unwrap().unwrap();
    }

    let mut calls = launcher.calls.lock().clone();
    calls.sort_by_key(|s| s.0);
    assert_eq!(calls, (2..8).map(SessionId).collect::<Vec<_>>());
}
