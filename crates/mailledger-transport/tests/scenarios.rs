//! End-to-end tests over real TCP sockets.
//!
//! A small scripted server stands in for an IMAP server: it greets every
//! client, answers `NOOP` and closes the connection after `LOGOUT`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use mailledger_transport::{Config, Connection, ConnectionState, Error, Security, StatusEvent};

const WAIT: Duration = Duration::from_secs(5);

/// Starts the scripted server and returns its address.
async fn spawn_server() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve(socket));
        }
    });

    Ok(addr)
}

async fn serve(socket: TcpStream) -> std::io::Result<()> {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"* OK ready\r\n").await?;

    while let Some(line) = lines.next_line().await? {
        let mut parts = line.splitn(3, ' ');
        let tag = parts.next().unwrap_or("*");
        match parts.next().map(str::to_ascii_uppercase).as_deref() {
            Some("NOOP") => {
                write
                    .write_all(format!("{tag} OK NOOP completed\r\n").as_bytes())
                    .await?;
            }
            Some("LOGOUT") => {
                let reply = format!("* BYE logging out\r\n{tag} OK LOGOUT completed\r\n");
                write.write_all(reply.as_bytes()).await?;
                return Ok(());
            }
            _ => {
                write
                    .write_all(format!("{tag} BAD unknown command\r\n").as_bytes())
                    .await?;
            }
        }
    }
    Ok(())
}

async fn next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Result<T> {
    Ok(timeout(WAIT, rx.recv()).await.context("timed out")??)
}

async fn expect_open(status: &mut broadcast::Receiver<StatusEvent>) -> Result<()> {
    match next(status).await? {
        StatusEvent::OpenCompleted => Ok(()),
        other => bail!("expected OpenCompleted, got {other:?}"),
    }
}

/// Collects data events until the accumulated text contains `needle`.
async fn read_until(data: &mut broadcast::Receiver<Bytes>, needle: &str) -> Result<String> {
    let mut seen = String::new();
    while !seen.contains(needle) {
        let chunk = next(data).await?;
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    Ok(seen)
}

#[tokio::test]
async fn test_greeting_arrives_before_any_write() -> Result<()> {
    let addr = spawn_server().await?;
    let conn = Connection::default();
    let mut status = conn.subscribe_status();
    let mut data = conn.subscribe_data();

    conn.connect("127.0.0.1", addr.port(), false);
    assert!(conn.connecting() || conn.connected());

    expect_open(&mut status).await?;
    assert!(conn.connected());
    assert_eq!(conn.state(), ConnectionState::Open);

    let greeting = read_until(&mut data, "* OK ready").await?;
    assert!(greeting.starts_with("* OK ready"));
    Ok(())
}

#[tokio::test]
async fn test_noop_round_trip() -> Result<()> {
    let addr = spawn_server().await?;
    let conn = Connection::default();
    let mut status = conn.subscribe_status();
    let mut data = conn.subscribe_data();

    conn.connect("127.0.0.1", addr.port(), false);
    expect_open(&mut status).await?;
    read_until(&mut data, "* OK ready").await?;

    conn.write_str("A001 NOOP\r\n").await?;
    let reply = read_until(&mut data, "A001").await?;
    assert!(reply.contains("A001 OK NOOP completed"));
    Ok(())
}

#[tokio::test]
async fn test_logout_ends_and_closes() -> Result<()> {
    let addr = spawn_server().await?;
    let conn = Connection::default();
    let mut status = conn.subscribe_status();
    let mut data = conn.subscribe_data();

    conn.connect("127.0.0.1", addr.port(), false);
    expect_open(&mut status).await?;
    read_until(&mut data, "* OK ready").await?;

    conn.write_str("A002 LOGOUT\r\n").await?;
    loop {
        match next(&mut status).await? {
            StatusEvent::EndEncountered => break,
            StatusEvent::ErrorOccurred(e) => bail!("unexpected error: {e:?}"),
            StatusEvent::OpenCompleted => bail!("opened twice"),
        }
    }

    assert!(!conn.connected());
    assert_eq!(conn.queued_writes(), 0);
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    // Still safe after the implicit close.
    conn.close();
    assert!(!conn.connected());
    Ok(())
}

#[tokio::test]
async fn test_reconnect_after_close() -> Result<()> {
    let addr = spawn_server().await?;
    let conn = Connection::default();
    let mut status = conn.subscribe_status();
    let mut data = conn.subscribe_data();

    conn.connect("127.0.0.1", addr.port(), false);
    expect_open(&mut status).await?;
    read_until(&mut data, "* OK ready").await?;

    conn.close();
    assert!(!conn.connected());

    conn.connect("127.0.0.1", addr.port(), false);
    expect_open(&mut status).await?;
    read_until(&mut data, "* OK ready").await?;
    assert!(conn.connected());

    conn.write_str("A003 NOOP\r\n").await?;
    read_until(&mut data, "A003 OK").await?;
    Ok(())
}

#[tokio::test]
async fn test_writes_before_connect_arrive_in_order() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let conn = Connection::default();
    for tag in 1..=5 {
        conn.write_str(&format!("A{tag:03} NOOP\r\n")).await?;
    }
    assert_eq!(conn.queued_writes(), 5);

    conn.connect("127.0.0.1", port, false);
    let (mut socket, _) = timeout(WAIT, listener.accept()).await??;

    let expected = "A001 NOOP\r\nA002 NOOP\r\nA003 NOOP\r\nA004 NOOP\r\nA005 NOOP\r\n";
    let mut received = vec![0u8; expected.len()];
    timeout(WAIT, socket.read_exact(&mut received)).await??;
    assert_eq!(String::from_utf8(received)?, expected);
    Ok(())
}

#[tokio::test]
async fn test_connect_refused_reports_error() -> Result<()> {
    // Bind then drop to get a port nobody listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };

    let conn = Connection::default();
    let mut status = conn.subscribe_status();
    conn.write_str("A001 NOOP\r\n").await?;

    conn.connect("127.0.0.1", port, false);
    let event = next(&mut status).await?;
    match event.error() {
        Some(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionRefused),
        other => bail!("expected connect error, got {other:?}"),
    }

    assert!(!conn.connected());
    assert!(!conn.connecting());
    // The failed session keeps its queue until closed.
    assert_eq!(conn.queued_writes(), 1);
    conn.close();
    assert_eq!(conn.queued_writes(), 0);
    Ok(())
}

#[tokio::test]
async fn test_connect_timeout_reports_error() -> Result<()> {
    // TEST-NET-1 is reserved and never answers.
    let config = Config::builder("192.0.2.1")
        .port(143)
        .security(Security::None)
        .connect_timeout(Duration::from_millis(50))
        .build();

    let conn = Connection::default();
    let mut status = conn.subscribe_status();
    conn.connect_with(&config);

    let event = next(&mut status).await?;
    assert!(event.is_error());
    assert!(!conn.connected());
    Ok(())
}
