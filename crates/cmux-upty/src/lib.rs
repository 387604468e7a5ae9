use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub mod client;
pub mod error;
pub mod ioctl;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod relay;
pub mod server;

pub use error::BridgeError;
pub use protocol::{IoctlReply, IoctlRequest, Opcode, MAGIC};
pub use provider::{ProviderKind, PtyHandle, Role, SharedHandle, TerminalId, TerminalProvider};
pub use registry::Registry;
pub use server::{Server, ServerConfig, ServerHandle};

// ---------------- Path helpers ----------------

pub fn runtime_dir() -> PathBuf {
    if let Ok(p) = std::env::var("XDG_RUNTIME_DIR") {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    PathBuf::from("/tmp")
}

pub fn socket_path() -> PathBuf {
    runtime_dir().join("cmux-upty").join("upty.sock")
}

/// The pid file lives next to the socket it belongs to.
pub fn pid_path(socket: &Path) -> PathBuf {
    socket.with_file_name("uptyd.pid")
}

pub(crate) fn ensure_socket_dir(socket: &Path) -> Result<()> {
    if let Some(dir) = socket.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating dir {}", dir.display()))?;
    }
    Ok(())
}

pub fn write_pid_file(socket: &Path) -> Result<PathBuf> {
    let pid_path = pid_path(socket);
    fs::write(&pid_path, format!("{}\n", std::process::id()))
        .with_context(|| format!("writing pid file {}", pid_path.display()))?;
    Ok(pid_path)
}
