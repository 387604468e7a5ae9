//! Client side of the socket protocol, used by `uptyctl` and the tests.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tokio::net::UnixStream;

use crate::protocol::{self, IoctlReply, IoctlRequest, Opcode};
use crate::provider::TerminalId;

pub async fn connect(path: &Path, opcode: Opcode) -> Result<UnixStream> {
    let mut stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("connect {}", path.display()))?;
    protocol::write_handshake(&mut stream, opcode)
        .await
        .context("sending handshake")?;
    Ok(stream)
}

/// Allocates a new pty pair. The returned stream relays the master side.
pub async fn open_master(path: &Path) -> Result<(UnixStream, TerminalId)> {
    let mut stream = connect(path, Opcode::OpenMaster).await?;
    let id = protocol::read_terminal_id(&mut stream)
        .await
        .map_err(|e| anyhow!("daemon closed the connection without a terminal id: {e}"))?;
    Ok((stream, id))
}

/// Opens the slave of terminal `id`. The daemon sends no confirmation: an
/// unknown id shows up as EOF on the returned stream.
pub async fn open_slave(path: &Path, id: TerminalId) -> Result<UnixStream> {
    let mut stream = connect(path, Opcode::OpenSlave).await?;
    protocol::write_terminal_id(&mut stream, id)
        .await
        .context("sending terminal id")?;
    Ok(stream)
}

pub async fn ioctl(path: &Path, request: &IoctlRequest) -> Result<IoctlReply> {
    let mut stream = connect(path, Opcode::Ioctl).await?;
    request
        .write_to(&mut stream)
        .await
        .context("sending ioctl request")?;
    IoctlReply::read_from(&mut stream, request.payload.len())
        .await
        .map_err(|e| {
            anyhow!(
                "no reply for ioctl {:#x} on {} of terminal {}: {e}",
                request.request,
                request.role,
                request.id
            )
        })
}
