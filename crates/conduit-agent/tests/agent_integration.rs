#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Agent lifecycle driven from a settings file, over loopback sockets.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use conduit_agent::backend::TcpConnector;
use conduit_agent::relay::RelayState;
use conduit_agent::rendezvous::LocalRendezvous;
use conduit_agent::{Agent, AgentConfig, AgentError, SessionError};
use conduit_core::config::load_config;

const WAIT: Duration = Duration::from_secs(10);

async fn echo_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

fn settings_file(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn config_from(json: &str) -> AgentConfig {
    let file = settings_file(json);
    let settings = load_config(Some(file.path())).unwrap();
    settings.validate().unwrap();
    AgentConfig::from_settings(&settings)
}

async fn wait_for_addr(rx: &mut watch::Receiver<Option<String>>) -> String {
    timeout(WAIT, rx.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap()
}

async fn echo_through(public_addr: &str, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(public_addr).await.unwrap();
    client.write_all(payload).await.unwrap();
    client.shutdown().await.unwrap();
    let mut back = Vec::new();
    timeout(WAIT, client.read_to_end(&mut back))
        .await
        .unwrap()
        .unwrap();
    back
}

#[tokio::test]
async fn agent_from_settings_file_relays_and_shuts_down() {
    let backend = echo_backend().await;
    let config = config_from(&format!(
        r#"{{
            "session": {{ "metadata": "agent-it", "heartbeat_interval_secs": 1 }},
            "tunnel": {{ "metadata": "web" }},
            "backend": {{ "addr": "{backend}" }},
            "relay": {{ "chunk_size": 512 }}
        }}"#
    ));
    assert_eq!(config.relay.chunk_size, 512);
    assert_eq!(config.session_metadata, "agent-it");

    let rendezvous = Arc::new(LocalRendezvous::new());
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let agent = Arc::new(
        Agent::new(
            config,
            rendezvous.clone(),
            Arc::new(TcpConnector::default()),
        )
        .with_reports(reports_tx),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.run(shutdown_rx).await }
    });

    let mut addr_rx = agent.public_addr();
    let public = wait_for_addr(&mut addr_rx).await;

    let payload: Vec<u8> = (0..5_000).map(|_| rand::random::<u8>()).collect();
    assert_eq!(echo_through(&public, &payload).await, payload);

    let report = timeout(WAIT, reports.recv()).await.unwrap().unwrap();
    assert_eq!(report.state, RelayState::Done);
    assert_eq!(report.inbound_bytes, 5_000);
    assert_eq!(report.outbound_bytes, 5_000);

    shutdown_tx.send(true).unwrap();
    timeout(WAIT, running).await.unwrap().unwrap().unwrap();

    assert!(agent.public_addr().borrow().is_none());
    assert_eq!(agent.tracker().active_count().await, 0);
    assert_eq!(rendezvous.session_count().await, 0);
}

#[tokio::test]
async fn session_loss_without_reconnect_stops_agent() {
    let backend = echo_backend().await;
    let config = config_from(&format!(
        r#"{{
            "backend": {{ "addr": "{backend}" }},
            "reconnect": {{ "enabled": false }}
        }}"#
    ));
    assert!(config.reconnect.is_none());

    let rendezvous = Arc::new(LocalRendezvous::new());
    let agent = Arc::new(Agent::new(
        config,
        rendezvous.clone(),
        Arc::new(TcpConnector::default()),
    ));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.run(shutdown_rx).await }
    });

    let mut addr_rx = agent.public_addr();
    wait_for_addr(&mut addr_rx).await;

    let ids = rendezvous.session_ids().await;
    assert_eq!(ids.len(), 1);
    assert!(rendezvous.disconnect(&ids[0]).await);

    let result = timeout(WAIT, running).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(AgentError::Session(SessionError::Disconnected(_)))
    ));
}

#[tokio::test]
async fn wrong_authtoken_in_settings_is_rejected() {
    let backend = echo_backend().await;
    let config = config_from(&format!(
        r#"{{
            "session": {{ "authtoken": "nope" }},
            "backend": {{ "addr": "{backend}" }}
        }}"#
    ));

    let rendezvous = Arc::new(LocalRendezvous::new().with_authtoken("secret"));
    let agent = Agent::new(config, rendezvous, Arc::new(TcpConnector::default()));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let err = timeout(WAIT, agent.run(shutdown_rx))
        .await
        .unwrap()
        .unwrap_err();
    assert!(!err.is_retryable());
}

#[test]
fn invalid_settings_file_is_refused() {
    let file = settings_file(r#"{ "relay": { "chunk_size": 0 } }"#);
    let settings = load_config(Some(file.path())).unwrap();
    assert!(settings.validate().is_err());

    let garbage = settings_file("not json");
    assert!(load_config(Some(garbage.path())).is_err());
}
