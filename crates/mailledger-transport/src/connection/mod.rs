//! Connection management.
//!
//! This module provides the event-driven connection and its parts:
//! - Configuration (endpoint, security mode, drain and event tuning)
//! - TLS/plaintext stream abstraction
//! - Lifecycle state shared with the per-session driver task
//! - Write queue with readiness-latched flow control
//! - Broadcast channels for data, status and read activity

mod config;
mod driver;
mod events;
mod handle;
mod queue;
mod state;
mod stream;

pub use config::{
    Config, ConfigBuilder, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_READS_PER_DRAIN,
    DEFAULT_READ_CHUNK_SIZE, Security, TransportConfig,
};
pub use events::StatusEvent;
pub use handle::Connection;
pub use state::{ChannelStatus, ConnectionState};
pub use stream::{TransportStream, connect_plain, connect_tls, create_tls_connector};
