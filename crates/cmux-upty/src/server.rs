//! Dispatcher: accepts socket connections, validates the handshake and hands
//! each connection to the relay or ioctl engine on its own task.

use std::fs;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

use crate::error::BridgeError;
use crate::protocol::{self, Opcode};
use crate::provider::{ProviderKind, TerminalId, TerminalProvider};
use crate::registry::Registry;
use crate::{ioctl, relay};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IOCTL_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub provider: ProviderKind,
    /// `None` lets the registry grow without bound.
    pub max_terminals: Option<usize>,
    /// Bound on reading the magic, opcode and (for slaves) terminal id.
    pub handshake_timeout: Duration,
    /// Bound on a whole ioctl exchange. Relays have no timeout.
    pub ioctl_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: crate::socket_path(),
            provider: ProviderKind::default(),
            max_terminals: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ioctl_timeout: DEFAULT_IOCTL_TIMEOUT,
        }
    }
}

struct Shared {
    provider: Arc<dyn TerminalProvider>,
    registry: Arc<Registry>,
    handshake_timeout: Duration,
    ioctl_timeout: Duration,
}

pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    shared: Arc<Shared>,
    shutdown: Arc<Notify>,
}

/// Stops a running [`Server::serve`] loop. Connections already accepted keep
/// running until their clients go away.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl Server {
    /// Binds the rendezvous socket using the provider named in `config`.
    /// Must be called from within a tokio runtime.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let provider = config
            .provider
            .build()
            .with_context(|| format!("starting {:?} terminal provider", config.provider))?;
        Self::bind_with_provider(config, provider)
    }

    pub fn bind_with_provider(
        config: ServerConfig,
        provider: Arc<dyn TerminalProvider>,
    ) -> Result<Self> {
        let sock = config.socket_path;
        crate::ensure_socket_dir(&sock)?;
        if sock.exists() {
            let _ = fs::remove_file(&sock);
        }
        let listener =
            UnixListener::bind(&sock).with_context(|| format!("bind {}", sock.display()))?;

        Ok(Self {
            listener,
            socket_path: sock,
            shared: Arc::new(Shared {
                provider,
                registry: Arc::new(Registry::new(config.max_terminals)),
                handshake_timeout: config.handshake_timeout,
                ioctl_timeout: config.ioctl_timeout,
            }),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.shared.registry)
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Accepts connections until [`ServerHandle::shutdown`] is called, then
    /// removes the socket file.
    pub async fn serve(self) {
        info!(
            socket = %self.socket_path.display(),
            capacity = ?self.shared.registry.capacity(),
            "uptyd listening"
        );
        let mut seq: u64 = 0;
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            seq += 1;
                            spawn_connection(Arc::clone(&self.shared), stream, seq);
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("uptyd shutting down");
                    break;
                }
            }
        }
        let _ = fs::remove_file(&self.socket_path);
    }
}

fn spawn_connection(shared: Arc<Shared>, stream: UnixStream, seq: u64) {
    let span = info_span!("conn", seq, kind = field::Empty, id = field::Empty);
    tokio::spawn(
        async move {
            debug!("accepted connection");
            match AssertUnwindSafe(handle_connection(shared, stream))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log_failure(&e),
                Err(_) => error!("connection task panicked"),
            }
        }
        .instrument(span),
    );
}

fn log_failure(err: &BridgeError) {
    match err {
        BridgeError::Transport(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            debug!("client went away: {}", err)
        }
        BridgeError::Transport(_) => debug!("{}", err),
        _ => warn!("{}", err),
    }
}

/// What a connection asked for, after the handshake.
enum Request {
    OpenMaster,
    OpenSlave(TerminalId),
    Ioctl,
}

impl Request {
    fn kind(&self) -> &'static str {
        match self {
            Request::OpenMaster => "open-master",
            Request::OpenSlave(_) => "open-slave",
            Request::Ioctl => "ioctl",
        }
    }
}

async fn read_request(stream: &mut UnixStream) -> Result<Request, BridgeError> {
    match protocol::read_handshake(stream).await? {
        Opcode::OpenMaster => Ok(Request::OpenMaster),
        Opcode::OpenSlave => Ok(Request::OpenSlave(
            protocol::read_terminal_id(stream).await?,
        )),
        Opcode::Ioctl => Ok(Request::Ioctl),
    }
}

async fn handle_connection(shared: Arc<Shared>, mut stream: UnixStream) -> Result<(), BridgeError> {
    let request = timeout(shared.handshake_timeout, read_request(&mut stream))
        .await
        .map_err(|_| BridgeError::HandshakeTimeout(shared.handshake_timeout))??;
    Span::current().record("kind", request.kind());

    match request {
        Request::OpenMaster => open_master(&shared, stream).await,
        Request::OpenSlave(id) => {
            Span::current().record("id", id);
            open_slave(&shared, stream, id).await
        }
        Request::Ioctl => timeout(shared.ioctl_timeout, ioctl::serve(stream, &shared.registry))
            .await
            .map_err(|_| {
                BridgeError::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("ioctl exchange exceeded {:?}", shared.ioctl_timeout),
                ))
            })?,
    }
}

async fn open_master(shared: &Shared, mut stream: UnixStream) -> Result<(), BridgeError> {
    let (handle, id) = shared
        .provider
        .allocate_master()
        .map_err(BridgeError::ProviderOpenFailed)?;
    Span::current().record("id", id);

    if let Err(e) = shared.registry.register_master(id, &handle) {
        handle.release();
        return Err(e);
    }
    if let Err(e) = protocol::write_terminal_id(&mut stream, id).await {
        handle.release();
        return Err(e.into());
    }
    info!(id, "master opened");
    relay::run(handle, stream).await;
    Ok(())
}

async fn open_slave(shared: &Shared, stream: UnixStream, id: TerminalId) -> Result<(), BridgeError> {
    if !shared.registry.contains(id) {
        return Err(BridgeError::UnknownTerminalId(id));
    }
    let handle = shared.provider.open_slave(id).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            BridgeError::UnknownTerminalId(id)
        } else {
            BridgeError::ProviderOpenFailed(e)
        }
    })?;
    shared.registry.register_slave(id, &handle);
    info!(id, "slave opened");
    relay::run(handle, stream).await;
    Ok(())
}
