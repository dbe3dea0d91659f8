//! The public connection handle.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use super::config::{Config, Security, TransportConfig};
use super::driver;
use super::events::StatusEvent;
use super::queue::Submission;
use super::state::{ConnectionState, Lifecycle, Shared};
use crate::encoding::Encoding;
use crate::{Error, Result};

/// One TCP (optionally TLS) connection with event-driven notifications.
///
/// Outcomes of [`connect`](Self::connect) and everything read from the
/// peer are published on broadcast channels; subscribe before connecting
/// so nothing is missed. Writes are queued until the transport can take
/// them and always leave in the order they were submitted.
///
/// Dropping the connection closes it.
///
/// # Example
///
/// ```ignore
/// use mailledger_transport::{Connection, StatusEvent};
///
/// let conn = Connection::default();
/// let mut status = conn.subscribe_status();
/// let mut data = conn.subscribe_data();
///
/// conn.connect("imap.example.com", 993, true);
/// if let Ok(StatusEvent::OpenCompleted) = status.recv().await {
///     let greeting = data.recv().await?;
///     conn.write_str("A001 CAPABILITY\r\n").await?;
/// }
/// ```
#[derive(Debug)]
pub struct Connection {
    shared: Arc<Shared>,
    transport: TransportConfig,
}

impl Connection {
    /// Creates a disconnected connection.
    #[must_use]
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(transport.event_capacity)),
            transport,
        }
    }

    /// Starts connecting to `host:port`, negotiating TLS first if `use_tls`.
    ///
    /// Returns immediately. Success is reported as
    /// [`StatusEvent::OpenCompleted`], failure as
    /// [`StatusEvent::ErrorOccurred`]. An existing session is closed first.
    pub fn connect(&self, host: &str, port: u16, use_tls: bool) {
        let config = Config::builder(host)
            .port(port)
            .security(Security::from_tls(use_tls))
            .build();
        self.connect_with(&config);
    }

    /// Starts connecting with a full endpoint configuration.
    pub fn connect_with(&self, config: &Config) {
        tracing::debug!(
            host = %config.host,
            port = config.port,
            tls = config.security.is_tls(),
            "connecting"
        );
        self.start(|runtime, shared, session| {
            driver::spawn_connect(runtime, shared, session, config.clone(), &self.transport)
        });
    }

    /// Runs the connection over a stream the caller already established,
    /// for example one upgraded with STARTTLS.
    pub fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        tracing::debug!("attaching established stream");
        self.start(|runtime, shared, session| {
            driver::spawn_attached(runtime, shared, session, stream, &self.transport)
        });
    }

    fn start<F>(&self, spawn: F)
    where
        F: FnOnce(&Handle, Arc<Shared>, u64) -> driver::DriverHandle,
    {
        let runtime = Handle::try_current();
        let mut lifecycle = self.shared.lock();
        release_previous(&mut lifecycle);
        let session = lifecycle.register();

        if let Ok(runtime) = runtime {
            let handle = spawn(&runtime, Arc::clone(&self.shared), session);
            lifecycle.attach_driver(handle);
        } else {
            drop(lifecycle);
            driver::fail_open(&self.shared, session, Error::NoRuntime);
        }
    }

    /// Writes `data`, or queues it until the transport signals space.
    ///
    /// A write made while not connected is queued silently and sent once
    /// the connection opens.
    ///
    /// # Errors
    ///
    /// - [`Error::BufferAccess`] if the buffer could not be handed to the
    ///   transport
    /// - [`Error::TransportWrite`] if the transport failed the write
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let reply = {
            let mut lifecycle = self.shared.lock();
            let open = lifecycle.connected();
            match lifecycle.queue.submit(data.into(), open) {
                Submission::Queued => {
                    tracing::trace!(queued = lifecycle.queue.len(), "write queued");
                    return Ok(());
                }
                Submission::Direct(data) => {
                    let handed = lifecycle
                        .driver()
                        .ok_or(Error::BufferAccess)
                        .and_then(|driver| driver.write(data));
                    match handed {
                        Ok(reply) => reply,
                        Err(e) => {
                            // The readiness signal was never used.
                            lifecycle.queue.restore_latch();
                            return Err(e);
                        }
                    }
                }
            }
        };

        match reply.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::TransportWrite(e)),
            Err(_) => Err(Error::BufferAccess),
        }
    }

    /// Writes a UTF-8 string.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub async fn write_str(&self, text: &str) -> Result<()> {
        self.write_text(text, Encoding::Utf8).await
    }

    /// Encodes `text` and writes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if `text` is not representable in
    /// `encoding`; nothing is queued in that case. Otherwise see
    /// [`write`](Self::write).
    pub async fn write_text(&self, text: &str, encoding: Encoding) -> Result<()> {
        let data = encoding.encode(text)?;
        self.write(data).await
    }

    /// Closes the connection. Safe to call any number of times.
    ///
    /// Pending writes are discarded.
    pub fn close(&self) {
        let driver = self.shared.lock().teardown();
        if let Some(driver) = driver {
            driver.abort();
            tracing::debug!("connection closed");
        }
    }

    /// Returns true if both channels are open.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.shared.lock().connected()
    }

    /// Returns true while a connect is in flight.
    #[must_use]
    pub fn connecting(&self) -> bool {
        self.shared.lock().connecting()
    }

    /// Returns the coarse connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state()
    }

    /// Returns the number of writes waiting for the transport.
    #[must_use]
    pub fn queued_writes(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Subscribes to received data, one buffer per read-readiness
    /// notification.
    #[must_use]
    pub fn subscribe_data(&self) -> broadcast::Receiver<Bytes> {
        self.shared.events.subscribe_data()
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.events.subscribe_status()
    }

    /// Subscribes to read activity: `true` when a drain starts, `false`
    /// when it ends.
    #[must_use]
    pub fn subscribe_activity(&self) -> broadcast::Receiver<bool> {
        self.shared.events.subscribe_activity()
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Tears down a session that is still registered before a new one starts.
/// Writes queued while fully disconnected are kept.
fn release_previous(lifecycle: &mut Lifecycle) {
    if lifecycle.has_handles() || lifecycle.connecting() {
        tracing::debug!("closing previous session before reconnecting");
        if let Some(driver) = lifecycle.teardown() {
            driver.abort();
        }
    }
}
