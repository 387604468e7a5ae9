//! Bidirectional byte relay between one client connection and one pty handle.
//!
//! Two loops run per relay:
//! - handle → connection, woken by the provider's readable/hang-up callbacks
//! - connection → handle, blocking on socket reads
//!
//! The connection → handle loop owns teardown: when it ends, the other loop
//! is cancelled, the handle is released once and the connection is dropped.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, Instrument};

use crate::provider::{PtyHandle, SharedHandle};

pub const RELAY_BUFFER_SIZE: usize = 4096;

/// Pause before retrying a handle write that reported `WouldBlock`.
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// Longest prefix of relayed data echoed in trace logs.
const PREVIEW_LEN: usize = 40;

/// Releases the handle when the relay is torn down, however that happens.
struct HandleLease(SharedHandle);

impl Drop for HandleLease {
    fn drop(&mut self) {
        self.0.release();
    }
}

#[derive(Default)]
struct HandleEvents {
    readable: Notify,
    hangup: Notify,
    hung_up: AtomicBool,
}

fn subscribe(handle: &SharedHandle) -> Arc<HandleEvents> {
    let events = Arc::new(HandleEvents::default());
    let on_readable = Arc::clone(&events);
    handle.register_readable(Box::new(move || on_readable.readable.notify_one()));
    let on_hangup = Arc::clone(&events);
    handle.register_hangup(Box::new(move || {
        on_hangup.hung_up.store(true, Ordering::Release);
        on_hangup.hangup.notify_one();
    }));
    events
}

/// Runs the relay until the client side goes away, then releases `handle`.
/// Never returns an error: failures end the relay and are logged.
pub async fn run<S>(handle: SharedHandle, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = handle.id();
    let role = handle.role();
    let lease = HandleLease(handle);
    let (reader, writer) = tokio::io::split(stream);

    let events = subscribe(&lease.0);
    let outbound = tokio::spawn(
        handle_to_connection(Arc::clone(&lease.0), events, writer).in_current_span(),
    );

    match AssertUnwindSafe(connection_to_handle(&*lease.0, reader))
        .catch_unwind()
        .await
    {
        Ok(Ok(bytes)) => debug!(id, %role, bytes, "client closed relay"),
        Ok(Err(e)) => debug!(id, %role, "connection -> handle ended: {}", e),
        Err(_) => error!(id, %role, "connection -> handle loop panicked"),
    }

    outbound.abort();
    match outbound.await {
        Ok(Ok(bytes)) => debug!(id, %role, bytes, "handle -> connection finished"),
        Ok(Err(e)) => debug!(id, %role, "handle -> connection ended: {}", e),
        Err(e) if e.is_panic() => error!(id, %role, "handle -> connection loop panicked"),
        Err(_) => {}
    }

    drop(lease);
    info!(id, %role, "relay closed");
}

enum Drained {
    WouldBlock,
    Eof,
}

async fn handle_to_connection<W>(
    handle: SharedHandle,
    events: Arc<HandleEvents>,
    mut writer: W,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    let result = loop {
        match drain_handle(&*handle, &mut buf, &mut writer, &mut total).await {
            Ok(Drained::WouldBlock) => {}
            Ok(Drained::Eof) => break Ok(()),
            Err(e) => break Err(e),
        }
        if events.hung_up.load(Ordering::Acquire) {
            debug!(id = handle.id(), role = %handle.role(), "handle hung up");
            break Ok(());
        }
        tokio::select! {
            _ = events.readable.notified() => {}
            _ = events.hangup.notified() => {}
        }
    };
    // Let the client see EOF; the other loop still owns the socket.
    let _ = writer.shutdown().await;
    result.map(|()| total)
}

/// Reads until the handle would block, forwarding every chunk in full.
async fn drain_handle<W>(
    handle: &dyn PtyHandle,
    buf: &mut [u8],
    writer: &mut W,
    total: &mut u64,
) -> io::Result<Drained>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match handle.read(buf) {
            Ok(0) => return Ok(Drained::Eof),
            Ok(n) => {
                trace!(
                    id = handle.id(),
                    bytes = n,
                    preview = ?String::from_utf8_lossy(&buf[..n.min(PREVIEW_LEN)]),
                    "handle -> connection"
                );
                writer.write_all(&buf[..n]).await?;
                writer.flush().await?;
                *total += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Drained::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

async fn connection_to_handle<R>(handle: &dyn PtyHandle, mut reader: R) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        trace!(
            id = handle.id(),
            bytes = n,
            preview = ?String::from_utf8_lossy(&buf[..n.min(PREVIEW_LEN)]),
            "connection -> handle"
        );
        write_fully(handle, &buf[..n]).await?;
        total += n as u64;
    }
}

/// Writes all of `data` to the handle, retrying partial writes.
pub async fn write_fully(handle: &dyn PtyHandle, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match handle.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tokio::time::sleep(WRITE_RETRY_BACKOFF).await;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
