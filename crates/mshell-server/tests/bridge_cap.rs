//! Telnet bridge ownership and capacity rules.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use mshell_core::protocol::{kind, Envelope};
use mshell_server::bridge::TelnetBridge;
use mshell_server::{OutMessage, ShellPlugin};

fn envelope(client_uuid: &str, data: &str) -> Envelope {
    Envelope {
        cmd: kind::SHELL.into(),
        cmd_uuid: "U1".into(),
        client_uuid: client_uuid.into(),
        data: data.into(),
        ..Default::default()
    }
}

/// Accept loop that just drains whatever the bridge writes.
async fn sink_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn spawn_accept(listener: TcpListener) {
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });
}

async fn next_reply(rx: &mut mpsc::Receiver<OutMessage>) -> OutMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for bridge output")
        .expect("output channel closed")
}

#[tokio::test]
async fn connection_cap_refuses_second_client() {
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let bridge = TelnetBridge::new(1, None, out_tx);

    let (listener, port) = sink_listener().await;
    spawn_accept(listener);

    bridge
        .clone()
        .on_data(envelope("C1", &format!("telnet 127.0.0.1 {port}")))
        .await;
    let reply = next_reply(&mut out_rx).await;
    assert_eq!(reply.client_uuid, "C1");
    assert!(reply.data.contains("connection established"));

    // Cap is checked before dialling: the address does not need to exist.
    bridge
        .clone()
        .on_data(envelope("C2", "telnet 5.6.7.8 23"))
        .await;
    let reply = next_reply(&mut out_rx).await;
    assert_eq!(reply.client_uuid, "C2");
    assert_eq!(reply.data, "max number of connection reached");
}

#[tokio::test]
async fn one_host_belongs_to_one_client() {
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let bridge = TelnetBridge::new(4, None, out_tx);

    let (listener, port) = sink_listener().await;
    spawn_accept(listener);

    bridge
        .clone()
        .on_data(envelope("C1", &format!("telnet connect 127.0.0.1 {port}")))
        .await;
    assert!(next_reply(&mut out_rx).await.data.contains("connection established"));

    bridge
        .clone()
        .on_data(envelope("C2", &format!("telnet 127.0.0.1 {port}")))
        .await;
    let reply = next_reply(&mut out_rx).await;
    assert!(reply
        .data
        .contains("this host is already connected to another mqtt client: C1"));
}

#[tokio::test]
async fn one_connection_per_client() {
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let bridge = TelnetBridge::new(4, None, out_tx);

    let (l1, p1) = sink_listener().await;
    let (l2, p2) = sink_listener().await;
    spawn_accept(l1);
    spawn_accept(l2);

    bridge
        .clone()
        .on_data(envelope("C1", &format!("telnet 127.0.0.1 {p1}")))
        .await;
    assert!(next_reply(&mut out_rx).await.data.contains("connection established"));

    bridge
        .clone()
        .on_data(envelope("C1", &format!("telnet 127.0.0.1 {p2}")))
        .await;
    let reply = next_reply(&mut out_rx).await;
    assert!(reply.data.contains("already connected"));
    assert!(reply.data.contains("disconnect before creating a new connection"));
}

#[tokio::test]
async fn unconnected_client_gets_usage_hint() {
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let bridge = TelnetBridge::new(4, None, out_tx);

    bridge.clone().on_data(envelope("C1", "ls -la")).await;
    let reply = next_reply(&mut out_rx).await;
    assert!(reply.data.contains("connection not established"));
    assert!(reply.data.contains("telnet help"));
}

#[tokio::test]
async fn disconnect_frees_the_host() {
    let (out_tx, mut out_rx) = mpsc::channel(16);
    let bridge = TelnetBridge::new(4, None, out_tx);

    let (listener, port) = sink_listener().await;
    spawn_accept(listener);

    bridge
        .clone()
        .on_data(envelope("C1", &format!("telnet 127.0.0.1 {port}")))
        .await;
    let reply = next_reply(&mut out_rx).await;
    assert!(reply.data.contains("connection established"));
    assert_eq!(reply.prompt, format!("<telnet - 127.0.0.1:{port}>"));

    bridge.clone().on_data(envelope("C1", "telnet disconnect")).await;
    let reply = next_reply(&mut out_rx).await;
    assert!(reply.data.contains("connection closed with"));

    bridge
        .clone()
        .on_data(envelope("C2", &format!("telnet 127.0.0.1 {port}")))
        .await;
    let reply = next_reply(&mut out_rx).await;
    assert!(reply.data.contains("connection established"));
}
