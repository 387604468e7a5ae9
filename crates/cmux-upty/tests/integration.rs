use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cmux_upty::protocol::{
    ARG_KIND_BUFFER, ARG_KIND_VALUE, CONTROL_IOCTLS, TIOCGWINSZ, TIOCSPTLCK, TIOCSWINSZ,
};
use cmux_upty::provider::{EventCallback, IoctlArg, MemoryProvider};
use cmux_upty::{
    client, IoctlRequest, PtyHandle, Registry, Role, Server, ServerConfig, ServerHandle,
    SharedHandle, TerminalId, TerminalProvider,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

type CallLog = Arc<Mutex<Vec<(TerminalId, Role, u64, IoctlArg)>>>;

/// Memory provider that records every ioctl that reaches a handle.
#[derive(Default)]
struct RecordingProvider {
    inner: MemoryProvider,
    calls: CallLog,
}

struct RecordingHandle {
    inner: SharedHandle,
    calls: CallLog,
}

impl RecordingProvider {
    fn wrap(&self, inner: SharedHandle) -> SharedHandle {
        Arc::new(RecordingHandle {
            inner,
            calls: Arc::clone(&self.calls),
        })
    }
}

impl TerminalProvider for RecordingProvider {
    fn allocate_master(&self) -> io::Result<(SharedHandle, TerminalId)> {
        let (handle, id) = self.inner.allocate_master()?;
        Ok((self.wrap(handle), id))
    }

    fn open_slave(&self, id: TerminalId) -> io::Result<SharedHandle> {
        Ok(self.wrap(self.inner.open_slave(id)?))
    }
}

impl PtyHandle for RecordingHandle {
    fn id(&self) -> TerminalId {
        self.inner.id()
    }

    fn role(&self) -> Role {
        self.inner.role()
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn ioctl(&self, request: u64, arg: &mut IoctlArg) -> io::Result<i32> {
        self.calls
            .lock()
            .push((self.id(), self.role(), request, arg.clone()));
        self.inner.ioctl(request, arg)
    }

    fn register_readable(&self, callback: EventCallback) {
        self.inner.register_readable(callback)
    }

    fn register_hangup(&self, callback: EventCallback) {
        self.inner.register_hangup(callback)
    }

    fn release(&self) {
        self.inner.release()
    }
}

struct Daemon {
    _tmp: TempDir,
    socket: PathBuf,
    handle: ServerHandle,
    registry: Arc<Registry>,
    provider: Arc<RecordingProvider>,
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

fn start_daemon(max_terminals: Option<usize>) -> Daemon {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("cmux-upty/upty.sock");
    let provider = Arc::new(RecordingProvider::default());
    let server = Server::bind_with_provider(
        ServerConfig {
            socket_path: socket.clone(),
            max_terminals,
            ..Default::default()
        },
        provider.clone(),
    )
    .unwrap();
    let handle = server.handle();
    let registry = server.registry();
    tokio::spawn(server.serve());
    Daemon {
        _tmp: tmp,
        socket,
        handle,
        registry,
        provider,
    }
}

async fn read_exactly(stream: &mut UnixStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for relay data")
        .unwrap();
    buf
}

/// The daemon may close with some of our bytes unread, which the kernel
/// reports as a reset rather than EOF.
async fn assert_closed_silently(stream: &mut UnixStream) {
    let mut rest = Vec::new();
    let result = timeout(WAIT, stream.read_to_end(&mut rest))
        .await
        .expect("daemon kept the connection open");
    if let Err(e) = result {
        assert_eq!(e.kind(), io::ErrorKind::ConnectionReset, "{e}");
    }
    assert!(rest.is_empty(), "unexpected response bytes {rest:?}");
}

#[tokio::test]
async fn bytes_flow_between_master_and_slave_clients() {
    let daemon = start_daemon(None);

    let (mut a, id) = client::open_master(&daemon.socket).await.unwrap();
    let mut b = client::open_slave(&daemon.socket, id).await.unwrap();

    a.write_all(b"hello").await.unwrap();
    assert_eq!(read_exactly(&mut b, 5).await, b"hello");

    b.write_all(b"world\n").await.unwrap();
    assert_eq!(read_exactly(&mut a, 6).await, b"world\n");
}

#[tokio::test]
async fn master_output_written_before_slave_opens_is_delivered() {
    let daemon = start_daemon(None);

    let (mut a, id) = client::open_master(&daemon.socket).await.unwrap();
    a.write_all(b"early").await.unwrap();
    // The master relay must have consumed it before the slave exists.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut b = client::open_slave(&daemon.socket, id).await.unwrap();
    assert_eq!(read_exactly(&mut b, 5).await, b"early");
}

#[tokio::test]
async fn large_transfers_arrive_intact_and_in_order() {
    let daemon = start_daemon(None);

    let (mut a, id) = client::open_master(&daemon.socket).await.unwrap();
    let mut b = client::open_slave(&daemon.socket, id).await.unwrap();

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 253) as u8).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        a.write_all(&payload).await.unwrap();
        a
    });

    let mut received = vec![0u8; expected.len()];
    timeout(WAIT, b.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, expected);
    drop(writer.await.unwrap());
}

#[tokio::test]
async fn master_disconnect_ends_the_slave_relay() {
    let daemon = start_daemon(None);

    let (a, id) = client::open_master(&daemon.socket).await.unwrap();
    let mut b = client::open_slave(&daemon.socket, id).await.unwrap();
    // Make sure the slave relay is up before the master goes away.
    b.write_all(b"x").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    drop(a);
    let mut rest = Vec::new();
    timeout(WAIT, b.read_to_end(&mut rest))
        .await
        .expect("slave connection stayed open")
        .unwrap();
}

#[tokio::test]
async fn window_size_ioctl_is_forwarded_verbatim() {
    let daemon = start_daemon(None);

    let (_a, id) = client::open_master(&daemon.socket).await.unwrap();
    let mut b = client::open_slave(&daemon.socket, id).await.unwrap();
    // The slave is registered once its relay is running.
    b.write_all(b"x").await.unwrap();
    while daemon.registry.lookup(id, Role::Slave).is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let request = IoctlRequest {
        id,
        role: Role::Slave,
        request: 0x5413,
        arg_kind: ARG_KIND_BUFFER,
        payload: vec![80, 0, 24, 0],
    };
    let reply = client::ioctl(&daemon.socket, &request).await.unwrap();
    assert_eq!(reply.payload.len(), 4);
    assert_eq!(reply.ret, 0);
    assert_eq!(reply.errno, 0);

    let calls = daemon.provider.calls.lock().clone();
    assert_eq!(
        calls,
        vec![(
            id,
            Role::Slave,
            0x5413,
            IoctlArg::Buffer(vec![80, 0, 24, 0])
        )]
    );
}

#[tokio::test]
async fn window_size_set_through_master_reads_back_on_slave() {
    let daemon = start_daemon(None);

    let (_a, id) = client::open_master(&daemon.socket).await.unwrap();
    let mut b = client::open_slave(&daemon.socket, id).await.unwrap();
    b.write_all(b"x").await.unwrap();
    while daemon.registry.lookup(id, Role::Slave).is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let set = IoctlRequest {
        id,
        role: Role::Master,
        request: TIOCSWINSZ,
        arg_kind: ARG_KIND_BUFFER,
        payload: vec![50, 0, 132, 0, 0, 0, 0, 0],
    };
    client::ioctl(&daemon.socket, &set).await.unwrap();

    let get = IoctlRequest {
        role: Role::Slave,
        request: TIOCGWINSZ,
        payload: vec![0; 8],
        ..set
    };
    let reply = client::ioctl(&daemon.socket, &get).await.unwrap();
    assert_eq!(reply.payload, vec![50, 0, 132, 0, 0, 0, 0, 0]);
}

#[tokio::test]
async fn control_ioctls_never_reach_the_provider() {
    let daemon = start_daemon(None);
    let (_a, id) = client::open_master(&daemon.socket).await.unwrap();

    for code in CONTROL_IOCTLS {
        let request = IoctlRequest {
            id,
            role: Role::Master,
            request: code,
            arg_kind: ARG_KIND_VALUE,
            payload: 0u64.to_le_bytes().to_vec(),
        };
        let reply = client::ioctl(&daemon.socket, &request).await.unwrap();
        assert_eq!(reply.ret, -1);
        assert_eq!(reply.errno, libc::ENOTTY);
        assert_eq!(reply.payload, request.payload);
    }
    assert!(daemon.provider.calls.lock().is_empty());
}

#[tokio::test]
async fn wrong_magic_gets_no_response() {
    let daemon = start_daemon(None);

    for opcode in 0u8..=2 {
        let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
        stream
            .write_all(&[b'p', b't', b'm', b'x', opcode])
            .await
            .unwrap();
        assert_closed_silently(&mut stream).await;
    }
    assert!(daemon.registry.is_empty());
}

#[tokio::test]
async fn slave_for_unallocated_id_is_closed() {
    let daemon = start_daemon(None);

    let mut stream = client::open_slave(&daemon.socket, 77).await.unwrap();
    assert_closed_silently(&mut stream).await;
    assert!(!daemon.registry.contains(77));
}

#[tokio::test]
async fn ioctl_for_unknown_handle_is_closed_without_reply() {
    let daemon = start_daemon(None);
    let (_a, id) = client::open_master(&daemon.socket).await.unwrap();

    // No slave has been opened for this id yet.
    let mut stream = client::connect(&daemon.socket, cmux_upty::Opcode::Ioctl)
        .await
        .unwrap();
    IoctlRequest {
        id,
        role: Role::Slave,
        request: TIOCGWINSZ,
        arg_kind: ARG_KIND_BUFFER,
        payload: vec![0; 8],
    }
    .write_to(&mut stream)
    .await
    .unwrap();
    assert_closed_silently(&mut stream).await;
    assert!(daemon.provider.calls.lock().is_empty());
}

#[tokio::test]
async fn released_master_is_no_longer_an_ioctl_target() {
    let daemon = start_daemon(None);
    let (a, id) = client::open_master(&daemon.socket).await.unwrap();
    drop(a);
    timeout(WAIT, async {
        while daemon.registry.lookup(id, Role::Master).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("master handle was never released");

    let request = IoctlRequest {
        id,
        role: Role::Master,
        request: TIOCGWINSZ,
        arg_kind: ARG_KIND_BUFFER,
        payload: vec![0; 8],
    };
    assert!(client::ioctl(&daemon.socket, &request).await.is_err());
    assert_eq!(daemon.provider.inner.live_pairs(), 0);
}

#[tokio::test]
async fn bounded_registry_refuses_extra_masters_cleanly() {
    let daemon = start_daemon(Some(3));

    let mut masters = Vec::new();
    for _ in 0..3 {
        masters.push(client::open_master(&daemon.socket).await.unwrap());
    }
    assert!(client::open_master(&daemon.socket).await.is_err());
    assert_eq!(daemon.registry.len(), 3);
    assert_eq!(daemon.provider.inner.live_pairs(), 3);

    // The daemon keeps serving the terminals it already has.
    let first = masters[0].1;
    let mut b = client::open_slave(&daemon.socket, first).await.unwrap();
    masters[0].0.write_all(b"still here").await.unwrap();
    assert_eq!(read_exactly(&mut b, 10).await, b"still here");
}

#[tokio::test]
async fn unbounded_registry_keeps_allocating() {
    let daemon = start_daemon(None);

    let mut masters = Vec::new();
    for expected in 0..40u32 {
        let (stream, id) = client::open_master(&daemon.socket).await.unwrap();
        assert_eq!(id, expected);
        masters.push(stream);
    }
    assert_eq!(daemon.registry.len(), 40);
}

#[tokio::test]
async fn second_slave_becomes_the_ioctl_target() {
    let daemon = start_daemon(None);
    let (_a, id) = client::open_master(&daemon.socket).await.unwrap();

    let mut first = client::open_slave(&daemon.socket, id).await.unwrap();
    first.write_all(b"1").await.unwrap();
    while daemon.registry.lookup(id, Role::Slave).is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let older = daemon.registry.lookup(id, Role::Slave).unwrap();

    let mut second = client::open_slave(&daemon.socket, id).await.unwrap();
    second.write_all(b"2").await.unwrap();
    timeout(WAIT, async {
        loop {
            let current = daemon.registry.lookup(id, Role::Slave).unwrap();
            if !Arc::ptr_eq(&current, &older) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second slave was never registered");
}

#[tokio::test]
async fn reopened_slave_still_reaches_the_master() {
    let daemon = start_daemon(None);

    let (mut a, id) = client::open_master(&daemon.socket).await.unwrap();
    let mut first = client::open_slave(&daemon.socket, id).await.unwrap();
    first.write_all(b"1").await.unwrap();
    assert_eq!(read_exactly(&mut a, 1).await, b"1");

    drop(first);
    timeout(WAIT, async {
        while daemon.registry.lookup(id, Role::Slave).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first slave was never released");

    let mut second = client::open_slave(&daemon.socket, id).await.unwrap();
    second.write_all(b"again").await.unwrap();
    assert_eq!(read_exactly(&mut a, 5).await, b"again");

    a.write_all(b"back").await.unwrap();
    assert_eq!(read_exactly(&mut second, 4).await, b"back");
}

#[tokio::test]
async fn failed_slave_open_leaves_the_daemon_serving() {
    let daemon = start_daemon(None);

    let (_a, id) = client::open_master(&daemon.socket).await.unwrap();
    let lock = |on: u64| IoctlRequest {
        id,
        role: Role::Master,
        request: TIOCSPTLCK,
        arg_kind: ARG_KIND_VALUE,
        payload: on.to_le_bytes().to_vec(),
    };
    let reply = client::ioctl(&daemon.socket, &lock(1)).await.unwrap();
    assert_eq!((reply.ret, reply.errno), (0, 0));

    // The provider refuses the open with EIO while the pair is locked.
    let mut refused = client::open_slave(&daemon.socket, id).await.unwrap();
    assert_closed_silently(&mut refused).await;
    assert!(daemon.registry.lookup(id, Role::Slave).is_none());
    assert!(daemon.registry.contains(id));

    let (mut other, other_id) = client::open_master(&daemon.socket).await.unwrap();
    assert_ne!(other_id, id);
    let mut other_slave = client::open_slave(&daemon.socket, other_id).await.unwrap();
    other.write_all(b"ok").await.unwrap();
    assert_eq!(read_exactly(&mut other_slave, 2).await, b"ok");

    let reply = client::ioctl(&daemon.socket, &lock(0)).await.unwrap();
    assert_eq!(reply.ret, 0);
    let mut unlocked = client::open_slave(&daemon.socket, id).await.unwrap();
    unlocked.write_all(b"x").await.unwrap();
    timeout(WAIT, async {
        while daemon.registry.lookup(id, Role::Slave).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("unlocked slave was never registered");
}
