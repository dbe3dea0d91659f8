#![allow(clippy::uninlined_format_args)]
//! Example: print a server greeting
//!
//! Connects to an IMAP server, prints the first data it sends, logs out and
//! waits for the server to close the stream.
//!
//! ## Running
//!
//! ```bash
//! RUST_LOG=mailledger_transport=debug \
//!     cargo run --package mailledger-transport --example greeting -- imap.example.com 993
//! ```

use std::time::Duration;

use mailledger_transport::{Connection, StatusEvent};
use tokio::time::timeout;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailledger_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "imap.gmail.com".to_string());
    let port: u16 = args.next().map_or(Ok(993), |p| p.parse())?;
    let use_tls = port != 143;

    let conn = Connection::default();
    let mut status = conn.subscribe_status();
    let mut data = conn.subscribe_data();

    println!("Connecting to {}:{} (tls: {})", host, port, use_tls);
    conn.connect(&host, port, use_tls);

    match timeout(Duration::from_secs(30), status.recv()).await?? {
        StatusEvent::OpenCompleted => {}
        StatusEvent::ErrorOccurred(e) => anyhow::bail!("connect failed: {:?}", e),
        StatusEvent::EndEncountered => anyhow::bail!("server closed the connection"),
    }

    let greeting = timeout(Duration::from_secs(30), data.recv()).await??;
    print!("{}", String::from_utf8_lossy(&greeting));

    conn.write_str("A001 LOGOUT\r\n").await?;
    loop {
        tokio::select! {
            chunk = data.recv() => print!("{}", String::from_utf8_lossy(&chunk?)),
            event = status.recv() => {
                if matches!(event?, StatusEvent::EndEncountered) {
                    break;
                }
            }
        }
    }

    println!("Connection closed: {}", !conn.connected());
    Ok(())
}
