//! Per-session driver task.
//!
//! The driver owns the socket. It turns readiness into work: a buffer is
//! offered to the output and released once the output takes bytes, and bytes
//! arriving on the input start a drain. Offering a buffer and reading are
//! separate branches of one `select!`, so a full output never holds up the
//! input. All I/O for a session happens here; callers reach it through
//! [`DriverCommand`]s.

use std::future;
use std::io;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::config::{Config, TransportConfig};
use super::events::{EventHub, StatusEvent};
use super::state::{ChannelStatus, Lifecycle, Shared};
use super::stream;
use crate::{Error, Result};

/// Zero-byte writes tolerated in a row before the output counts as failed.
pub(crate) const MAX_ZERO_WRITES: u32 = 16;

type Reply = oneshot::Sender<io::Result<()>>;

/// Request sent from a [`Connection`](crate::Connection) to its driver.
#[derive(Debug)]
pub(crate) enum DriverCommand {
    /// Write a buffer that took the readiness-latch fast path.
    Write { data: Bytes, reply: Reply },
}

/// Caller-side handle to a running driver.
#[derive(Debug)]
pub(crate) struct DriverHandle {
    commands: mpsc::UnboundedSender<DriverCommand>,
    task: JoinHandle<()>,
}

impl DriverHandle {
    /// Hands `data` to the driver for an immediate write.
    pub(crate) fn write(&self, data: Bytes) -> Result<oneshot::Receiver<io::Result<()>>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::Write { data, reply })
            .map_err(|_| Error::BufferAccess)?;
        Ok(rx)
    }

    /// Stops the driver, dropping the socket.
    pub(crate) fn abort(self) {
        self.task.abort();
    }
}

/// Spawns a driver that opens the endpoint in `config` first.
pub(crate) fn spawn_connect(
    runtime: &Handle,
    shared: Arc<Shared>,
    session: u64,
    config: Config,
    transport: &TransportConfig,
) -> DriverHandle {
    let (commands, rx) = mpsc::unbounded_channel();
    let transport = transport.clone();

    let task = runtime.spawn(async move {
        match stream::open(&config, transport.tls.as_ref()).await {
            Ok(stream) => {
                tracing::debug!(
                    host = %config.host,
                    port = config.port,
                    tls = stream.is_tls(),
                    "transport opened"
                );
                Driver::new(shared, session, stream, &transport, rx).run().await;
            }
            Err(e) => fail_open(&shared, session, e),
        }
    });

    DriverHandle { commands, task }
}

/// Spawns a driver over an already established stream.
pub(crate) fn spawn_attached<S>(
    runtime: &Handle,
    shared: Arc<Shared>,
    session: u64,
    stream: S,
    transport: &TransportConfig,
) -> DriverHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (commands, rx) = mpsc::unbounded_channel();
    let driver = Driver::new(shared, session, stream, transport, rx);
    let task = runtime.spawn(driver.run());
    DriverHandle { commands, task }
}

/// Marks both handles failed and reports why. The handles stay registered.
pub(crate) fn fail_open(shared: &Shared, session: u64, error: Error) {
    tracing::warn!(?error, "connect failed");
    let mut lifecycle = shared.lock();
    if lifecycle.is_current(session) {
        lifecycle.set_input(ChannelStatus::Error);
        lifecycle.set_output(ChannelStatus::Error);
        lifecycle.finish_connecting();
        shared.events.error(error);
    }
}

/// A buffer offered to the output, held until the output takes bytes of it.
struct Outgoing {
    data: Bytes,
    /// Present for fast-path writes; the caller awaits the outcome.
    reply: Option<Reply>,
}

/// What the output did when polled.
enum Output {
    Written(usize),
    Flushed,
}

struct Driver<S> {
    shared: Arc<Shared>,
    session: u64,
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    buf: Vec<u8>,
    max_reads: usize,
    /// The output took the last buffer; the queue head may be offered next.
    writable: bool,
    outgoing: Option<Outgoing>,
    /// Bytes were written since the last flush.
    flushing: bool,
    /// The input is still polled.
    reading: bool,
    zero_writes: u32,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn new(
        shared: Arc<Shared>,
        session: u64,
        stream: S,
        transport: &TransportConfig,
        commands: mpsc::UnboundedReceiver<DriverCommand>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            shared,
            session,
            reader,
            writer,
            commands,
            // A zero-length read buffer would read as end of stream.
            buf: vec![0; transport.read_chunk_size.max(1)],
            max_reads: transport.max_reads_per_drain.max(1),
            writable: false,
            outgoing: None,
            flushing: false,
            reading: true,
            zero_writes: 0,
        }
    }

    /// Runs `f` under the lifecycle lock if this session is still current.
    fn with_current<T>(&self, f: impl FnOnce(&mut Lifecycle, &EventHub) -> T) -> Option<T> {
        let mut lifecycle = self.shared.lock();
        if lifecycle.is_current(self.session) {
            Some(f(&mut lifecycle, &self.shared.events))
        } else {
            None
        }
    }

    async fn run(mut self) {
        if self.on_open().is_break() {
            return;
        }

        loop {
            let offered = self.outgoing.as_ref().map(|out| &out.data[..]);
            let polling_output = offered.is_some() || self.flushing;

            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(DriverCommand::Write { data, reply }) => {
                        // The latch is only set while nothing is in flight.
                        debug_assert!(self.outgoing.is_none());
                        self.offer(data, Some(reply));
                        ControlFlow::Continue(())
                    }
                    None => ControlFlow::Break(()),
                },
                () = future::ready(()), if self.writable && self.outgoing.is_none() => {
                    self.on_writable()
                }
                result = offer_output(&mut self.writer, offered), if polling_output => {
                    self.on_output(result).await
                }
                result = self.reader.read(&mut self.buf), if self.reading => {
                    self.on_readable(result).await
                }
            };

            if flow.is_break() {
                break;
            }
        }
        tracing::trace!(session = self.session, "driver stopped");
    }

    fn on_open(&mut self) -> ControlFlow<()> {
        let opened = self.with_current(|lifecycle, events| {
            // The input channel opening is not surfaced.
            lifecycle.set_input(ChannelStatus::Open);

            lifecycle.set_output(ChannelStatus::Open);
            lifecycle.finish_connecting();
            events.status(StatusEvent::OpenCompleted);
        });
        if opened.is_none() {
            return ControlFlow::Break(());
        }

        tracing::debug!(session = self.session, "connection open");
        // A freshly opened output can take bytes.
        self.writable = true;
        ControlFlow::Continue(())
    }

    fn on_writable(&mut self) -> ControlFlow<()> {
        self.writable = false;
        let Some(head) = self.with_current(|lifecycle, _| lifecycle.queue.on_writable()) else {
            return ControlFlow::Break(());
        };
        // Without a head the latch is now set; the next write() bypasses
        // the queue.
        if let Some(data) = head {
            self.offer(data, None);
        }
        ControlFlow::Continue(())
    }

    fn offer(&mut self, data: Bytes, reply: Option<Reply>) {
        if data.is_empty() {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            self.writable = true;
            return;
        }
        self.with_current(|lifecycle, _| lifecycle.set_output(ChannelStatus::Writing));
        self.outgoing = Some(Outgoing { data, reply });
    }

    async fn on_output(&mut self, result: io::Result<Output>) -> ControlFlow<()> {
        match result {
            Ok(Output::Written(written)) => self.on_written(written).await,
            Ok(Output::Flushed) => {
                self.flushing = false;
                ControlFlow::Continue(())
            }
            Err(e) => {
                let reply = self.outgoing.take().and_then(|out| out.reply);
                self.on_write_error(e, reply)
            }
        }
    }

    /// The output took `written` bytes of the offered buffer. Whatever it did
    /// not take goes back to the queue.
    async fn on_written(&mut self, written: usize) -> ControlFlow<()> {
        let Some(Outgoing { mut data, reply }) = self.outgoing.take() else {
            return ControlFlow::Continue(());
        };

        if written == 0 {
            self.zero_writes += 1;
            if self.zero_writes > MAX_ZERO_WRITES {
                return self.on_write_error(io::ErrorKind::WriteZero.into(), reply);
            }
            tracing::trace!(len = data.len(), "transport took no bytes, requeueing");
            let requeued = self.with_current(|lifecycle, _| {
                lifecycle.set_output(ChannelStatus::Open);
                lifecycle.queue.requeue(data);
            });
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            self.writable = true;
            tokio::task::yield_now().await;
            return if requeued.is_some() {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            };
        }

        self.zero_writes = 0;
        let remainder = data.split_off(written.min(data.len()));
        let released = self.with_current(|lifecycle, _| {
            lifecycle.set_output(ChannelStatus::Open);
            if !remainder.is_empty() {
                lifecycle.queue.requeue_front(remainder);
            }
        });
        tracing::trace!(bytes = written, "wrote to transport");
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }

        self.flushing = true;
        self.writable = true;
        if released.is_some() {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }

    /// Discards the queue and marks the output failed. A fast-path caller
    /// gets the error back; otherwise it goes to the status channel.
    fn on_write_error(&mut self, error: io::Error, reply: Option<Reply>) -> ControlFlow<()> {
        self.writable = false;
        self.flushing = false;
        self.outgoing = None;

        let reported = self.with_current(|lifecycle, events| {
            let dropped = lifecycle.queue.discard();
            lifecycle.set_output(ChannelStatus::Error);
            if let Some(reply) = reply {
                tracing::warn!(?error, dropped, "direct write failed");
                let _ = reply.send(Err(error));
            } else {
                tracing::warn!(?error, dropped, "write failed, discarding queued data");
                events.error(Error::TransportWrite(error));
            }
        });
        if reported.is_some() {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }

    async fn on_readable(&mut self, first: io::Result<usize>) -> ControlFlow<()> {
        match first {
            Ok(0) => self.on_end(),
            Ok(n) => self.drain(n).await,
            Err(e) => {
                self.reading = false;
                tracing::warn!(?e, "read failed");
                let reported = self.with_current(|lifecycle, events| {
                    lifecycle.set_input(ChannelStatus::Error);
                    events.error(Error::Io(e));
                });
                if reported.is_some() {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            }
        }
    }

    /// Drains what the input has available into one data event.
    ///
    /// Input readiness shows up as the first read completing, so its `first`
    /// bytes are already in `self.buf`. Activity goes `true` before the data
    /// event and before any further read of the drain.
    async fn drain(&mut self, first: usize) -> ControlFlow<()> {
        let started = self.with_current(|lifecycle, events| {
            lifecycle.set_input(ChannelStatus::Reading);
            events.activity(true);
        });
        if started.is_none() {
            return ControlFlow::Break(());
        }

        let mut received = BytesMut::with_capacity(first);
        received.extend_from_slice(&self.buf[..first]);
        let mut reads = 1;
        let mut at_end = false;

        while reads < self.max_reads {
            match read_available(&mut self.reader, &mut self.buf).await {
                None => break,
                Some(Ok(0)) => {
                    at_end = true;
                    break;
                }
                Some(Ok(n)) => {
                    received.extend_from_slice(&self.buf[..n]);
                    reads += 1;
                }
                Some(Err(e)) => {
                    tracing::warn!(?e, bytes = received.len(), "read failed mid-drain");
                    break;
                }
            }
        }

        tracing::trace!(bytes = received.len(), reads, "drained input");
        let emitted = self.with_current(|lifecycle, events| {
            lifecycle.set_input(ChannelStatus::Open);
            events.received(received.freeze());
            events.activity(false);
        });

        match emitted {
            None => ControlFlow::Break(()),
            Some(()) if at_end => self.on_end(),
            Some(()) => ControlFlow::Continue(()),
        }
    }

    fn on_end(&mut self) -> ControlFlow<()> {
        self.reading = false;
        self.with_current(|lifecycle, events| {
            lifecycle.set_input(ChannelStatus::AtEnd);
            // Close first so subscribers observe the closed state. The
            // returned handle belongs to this task; dropping it detaches.
            drop(lifecycle.teardown());
            events.status(StatusEvent::EndEncountered);
        });
        tracing::debug!(session = self.session, "end of stream, connection closed");
        ControlFlow::Break(())
    }
}

/// Offers `data` to `writer`, or flushes it when there is nothing to offer.
/// Dropping the future before it completes leaves the output untouched.
async fn offer_output<W>(writer: &mut W, data: Option<&[u8]>) -> io::Result<Output>
where
    W: AsyncWrite + Unpin,
{
    future::poll_fn(|cx| match data {
        Some(data) => Pin::new(&mut *writer).poll_write(cx, data).map_ok(Output::Written),
        None => Pin::new(&mut *writer).poll_flush(cx).map_ok(|()| Output::Flushed),
    })
    .await
}

/// Reads whatever `reader` can produce without waiting. `None` means
/// nothing is available right now.
async fn read_available<R>(reader: &mut R, buf: &mut [u8]) -> Option<io::Result<usize>>
where
    R: AsyncRead + Unpin,
{
    future::poll_fn(|cx| {
        let mut read_buf = ReadBuf::new(&mut buf[..]);
        match Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Some(Ok(read_buf.filled().len()))),
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
            Poll::Pending => Poll::Ready(None),
        }
    })
    .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::task::Context;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::sync::broadcast;
    use tokio::time::timeout;
    use tokio_test::io::Builder;

    use super::*;
    use crate::Connection;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Output that accepts at most the scripted byte count per write, then
    /// everything once the script runs out. Reads never complete.
    #[derive(Clone, Default)]
    struct ScriptedOutput {
        limits: Arc<Mutex<VecDeque<usize>>>,
        accepted: Arc<Mutex<Vec<Bytes>>>,
    }

    impl ScriptedOutput {
        fn new(limits: impl IntoIterator<Item = usize>) -> Self {
            Self {
                limits: Arc::new(Mutex::new(limits.into_iter().collect())),
                accepted: Arc::default(),
            }
        }

        fn accepted(&self) -> Vec<Bytes> {
            self.accepted.lock().unwrap().clone()
        }
    }

    impl AsyncRead for ScriptedOutput {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for ScriptedOutput {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let limit = self.limits.lock().unwrap().pop_front().unwrap_or(usize::MAX);
            let n = buf.len().min(limit);
            if n > 0 {
                self.accepted.lock().unwrap().push(Bytes::copy_from_slice(&buf[..n]));
            }
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn wait_until_accepted(output: &ScriptedOutput, len: usize) {
        timeout(WAIT, async {
            while output.accepted().iter().map(Bytes::len).sum::<usize>() < len {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("output never took the queued bytes");
    }

    #[tokio::test]
    async fn test_read_available_returns_none_when_idle() {
        let (mut client, _server) = tokio::io::duplex(64);
        let mut buf = [0u8; 16];
        assert!(read_available(&mut client, &mut buf).await.is_none());
    }

    #[tokio::test]
    async fn test_read_available_reads_buffered_bytes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(b"* OK ready\r\n").await.unwrap();

        let mut buf = [0u8; 16];
        let n = read_available(&mut client, &mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"* OK ready\r\n");
    }

    #[tokio::test]
    async fn test_read_available_reports_end() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);

        let mut buf = [0u8; 16];
        let n = read_available(&mut client, &mut buf).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_offer_output_pending_writes_nothing() {
        let (mut client, mut server) = tokio::io::duplex(4);
        client.write_all(b"full").await.unwrap();

        let offered = offer_output(&mut client, Some(&b"more"[..]));
        assert!(timeout(Duration::from_millis(50), offered).await.is_err());

        let mut buf = [0u8; 8];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"full");
    }

    #[tokio::test]
    async fn test_mid_drain_read_error_keeps_accumulated_bytes() {
        let mock = Builder::new()
            .read(b"* OK ")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let conn = Connection::default();
        let mut data = conn.subscribe_data();
        let mut activity = conn.subscribe_activity();

        conn.attach(mock);
        assert!(next(&mut activity).await);
        assert_eq!(next(&mut data).await, "* OK ");
        assert!(!next(&mut activity).await);
    }

    #[tokio::test]
    async fn test_zero_length_write_requeues_at_tail() {
        let output = ScriptedOutput::new([0]);
        let conn = Connection::default();
        conn.write_str("A001 NOOP\r\n").await.unwrap();
        conn.write_str("A002 NOOP\r\n").await.unwrap();

        conn.attach(output.clone());
        wait_until_accepted(&output, 22).await;

        assert_eq!(output.accepted(), vec!["A002 NOOP\r\n", "A001 NOOP\r\n"]);
        assert!(conn.connected());
    }

    #[tokio::test]
    async fn test_partial_write_keeps_remainder_at_head() {
        let output = ScriptedOutput::new([5]);
        let conn = Connection::default();
        conn.write_str("A001 NOOP\r\n").await.unwrap();
        conn.write_str("A002 NOOP\r\n").await.unwrap();

        conn.attach(output.clone());
        wait_until_accepted(&output, 22).await;

        assert_eq!(output.accepted(), vec!["A001 ", "NOOP\r\n", "A002 NOOP\r\n"]);
        assert_eq!(conn.queued_writes(), 0);
    }

    #[tokio::test]
    async fn test_zero_writes_within_limit_are_retried() {
        let output = ScriptedOutput::new(vec![0; MAX_ZERO_WRITES as usize]);
        let conn = Connection::default();
        let mut status = conn.subscribe_status();
        conn.write_str("A001 NOOP\r\n").await.unwrap();

        conn.attach(output.clone());
        assert!(matches!(next(&mut status).await, StatusEvent::OpenCompleted));
        wait_until_accepted(&output, 11).await;

        assert_eq!(output.accepted(), vec!["A001 NOOP\r\n"]);
        assert!(status.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repeated_zero_writes_escalate() {
        let output = ScriptedOutput::new(vec![0; MAX_ZERO_WRITES as usize + 1]);
        let conn = Connection::default();
        let mut status = conn.subscribe_status();
        conn.write_str("A001 NOOP\r\n").await.unwrap();
        conn.write_str("A002 NOOP\r\n").await.unwrap();

        conn.attach(output.clone());
        assert!(matches!(next(&mut status).await, StatusEvent::OpenCompleted));

        match next(&mut status).await.error() {
            Some(Error::TransportWrite(e)) => assert_eq!(e.kind(), io::ErrorKind::WriteZero),
            other => panic!("unexpected status: {other:?}"),
        }
        assert!(output.accepted().is_empty());
        assert_eq!(conn.queued_writes(), 0);
        assert!(!conn.connected());
    }
}
