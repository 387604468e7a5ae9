use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use cmux_upty::{ProviderKind, Server, ServerConfig};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ProviderArg {
    /// In-process virtual pty pairs
    Memory,
    /// The host kernel's /dev/ptmx (Linux only)
    Host,
}

impl From<ProviderArg> for ProviderKind {
    fn from(p: ProviderArg) -> Self {
        match p {
            ProviderArg::Memory => ProviderKind::Memory,
            ProviderArg::Host => ProviderKind::Host,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "uptyd",
    version,
    about = "Bridge daemon exposing pseudo-terminal pairs over a Unix socket"
)]
struct Args {
    /// Rendezvous socket path.
    /// Defaults to $XDG_RUNTIME_DIR/cmux-upty/upty.sock (or /tmp when unset).
    #[arg(long, env = "UPTY_SOCKET")]
    socket: Option<PathBuf>,

    /// Terminal provider backing the pty pairs.
    #[arg(long, env = "UPTY_PROVIDER", value_enum, default_value_t = ProviderArg::Memory)]
    provider: ProviderArg,

    /// Refuse new masters once this many terminal ids are registered.
    #[arg(long, env = "UPTY_MAX_TERMINALS")]
    max_terminals: Option<usize>,

    #[arg(long, env = "UPTY_HANDSHAKE_TIMEOUT_MS", default_value_t = 10_000)]
    handshake_timeout_ms: u64,

    #[arg(long, env = "UPTY_IOCTL_TIMEOUT_MS", default_value_t = 30_000)]
    ioctl_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cmux_upty=info,uptyd=info".into()),
        )
        .compact()
        .init();

    let config = ServerConfig {
        socket_path: args.socket.unwrap_or_else(cmux_upty::socket_path),
        provider: args.provider.into(),
        max_terminals: args.max_terminals,
        handshake_timeout: Duration::from_millis(args.handshake_timeout_ms),
        ioctl_timeout: Duration::from_millis(args.ioctl_timeout_ms),
    };
    info!(
        socket = %config.socket_path.display(),
        provider = ?config.provider,
        max_terminals = ?config.max_terminals,
        "Starting uptyd"
    );

    // Installed before the socket appears so an early SIGTERM is not fatal.
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let server = Server::bind(config)?;
    let pid_path = cmux_upty::write_pid_file(server.socket_path())?;

    let handle = server.handle();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        handle.shutdown();
    });

    server.serve().await;
    let _ = std::fs::remove_file(pid_path);
    Ok(())
}
