//! # mailledger-transport
//!
//! Event-driven transport for line-based mail protocol clients: one TCP
//! connection, optionally wrapped in TLS, that reports what happens on
//! broadcast channels instead of blocking calls.
//!
//! ## Features
//!
//! - **Ordered writes**: buffers leave in submission order; writes made
//!   before the connection opens are queued and flushed on open
//! - **Readiness-driven flow control**: one queued buffer per
//!   write-readiness signal, with a latch so an idle connection writes
//!   immediately
//! - **Drained reads**: each read-readiness notification becomes exactly one
//!   data event, bracketed by activity signals
//! - **No replay**: subscribers only see events sent after they subscribed
//! - **TLS via rustls**: no OpenSSL dependency
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailledger_transport::{Connection, StatusEvent};
//!
//! #[tokio::main]
//! async fn main() -> mailledger_transport::Result<()> {
//!     let conn = Connection::default();
//!     let mut status = conn.subscribe_status();
//!     let mut data = conn.subscribe_data();
//!
//!     conn.connect("imap.example.com", 993, true);
//!
//!     while let Ok(event) = status.recv().await {
//!         match event {
//!             StatusEvent::OpenCompleted => break,
//!             StatusEvent::ErrorOccurred(e) => eprintln!("connect failed: {e:?}"),
//!             StatusEvent::EndEncountered => return Ok(()),
//!         }
//!     }
//!
//!     if let Ok(greeting) = data.recv().await {
//!         println!("{}", String::from_utf8_lossy(&greeting));
//!     }
//!     conn.write_str("A001 LOGOUT\r\n").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Connection States
//!
//! ```text
//! Disconnected ── connect() ──→ Connecting ── output open ──→ Open
//!      ↑                                                       │
//!      └──────────────── close() / EndEncountered ─────────────┘
//! ```
//!
//! `ErrorOccurred` does not move the machine. A failed connection keeps its
//! handles until [`Connection::close`] is called or the peer ends the
//! stream.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod connection;
mod encoding;
mod error;

pub use connection::{
    ChannelStatus, Config, ConfigBuilder, Connection, ConnectionState, Security, StatusEvent,
    TransportConfig, TransportStream,
};
pub use encoding::Encoding;
pub use error::{Error, Result};
