use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use cmux_upty::protocol::{ARG_KIND_BUFFER, ARG_KIND_VALUE, MAX_IOCTL_ARG_LEN};
use cmux_upty::{client, IoctlRequest, Role};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

#[derive(Parser, Debug)]
#[command(name = "uptyctl", version, about = "Client for uptyd")]
struct Cli {
    /// Daemon socket. Defaults to $XDG_RUNTIME_DIR/cmux-upty/upty.sock.
    #[arg(long, env = "UPTY_SOCKET", global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Allocate a pty pair, print its terminal id on stderr and relay
    /// stdin/stdout to the master
    Master,
    /// Relay stdin/stdout to the slave of terminal ID
    Slave { id: u32 },
    /// Issue one ioctl against terminal ID
    Ioctl {
        id: u32,
        /// Target the master instead of the slave
        #[arg(long)]
        master: bool,
        /// Request code, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_u64)]
        request: u64,
        /// Inline integer argument
        #[arg(long, value_parser = parse_u64, conflicts_with = "hex")]
        value: Option<u64>,
        /// Buffer argument as hex bytes, e.g. 50001800
        #[arg(long)]
        hex: Option<String>,
    },
    /// Show the daemon's pid and whether it accepts connections
    Status,
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        bail!("hex argument has an odd number of digits");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| anyhow!("invalid hex byte at offset {i}"))
        })
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let result = runtime.block_on(run(cli));
    // A pending stdin read cannot be cancelled; do not wait for it.
    runtime.shutdown_background();
    result
}

async fn run(cli: Cli) -> Result<()> {
    let socket = cli.socket.unwrap_or_else(cmux_upty::socket_path);
    match cli.command {
        Commands::Master => {
            let (stream, id) = client::open_master(&socket).await?;
            eprintln!("{}", id);
            pump(stream).await
        }
        Commands::Slave { id } => {
            let stream = client::open_slave(&socket, id).await?;
            pump(stream).await
        }
        Commands::Ioctl {
            id,
            master,
            request,
            value,
            hex,
        } => {
            let (arg_kind, payload) = match (value, hex) {
                (Some(v), _) => (ARG_KIND_VALUE, v.to_le_bytes().to_vec()),
                (None, Some(h)) => (ARG_KIND_BUFFER, decode_hex(&h)?),
                (None, None) => (ARG_KIND_VALUE, 0u64.to_le_bytes().to_vec()),
            };
            if payload.len() > MAX_IOCTL_ARG_LEN {
                bail!("ioctl argument is limited to {} bytes", MAX_IOCTL_ARG_LEN);
            }
            let req = IoctlRequest {
                id,
                role: if master { Role::Master } else { Role::Slave },
                request,
                arg_kind,
                payload,
            };
            let reply = client::ioctl(&socket, &req).await?;
            println!(
                "ret={} errno={} payload={}",
                reply.ret,
                reply.errno,
                encode_hex(&reply.payload)
            );
            if reply.ret < 0 {
                return Err(io::Error::from_raw_os_error(reply.errno))
                    .with_context(|| format!("ioctl {:#x} failed", request));
            }
            Ok(())
        }
        Commands::Status => status(&socket).await,
    }
}

async fn status(socket: &Path) -> Result<()> {
    println!("socket: {}", socket.display());
    let pid_path = cmux_upty::pid_path(socket);
    match std::fs::read_to_string(&pid_path) {
        Ok(pid) => println!("pid: {}", pid.trim()),
        Err(_) => println!("pid: unknown"),
    }
    UnixStream::connect(socket)
        .await
        .with_context(|| format!("daemon not reachable at {}", socket.display()))?;
    println!("reachable: yes");
    Ok(())
}

/// Relays stdin to the daemon and the daemon's output to stdout until the
/// daemon closes the connection.
async fn pump(stream: UnixStream) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let inbound = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        tokio::io::copy(&mut stdin, &mut writer).await?;
        writer.shutdown().await
    });

    let mut stdout = tokio::io::stdout();
    let copied = tokio::io::copy(&mut reader, &mut stdout).await;
    stdout.flush().await?;
    inbound.abort();
    copied.context("relaying daemon output")?;
    Ok(())
}
