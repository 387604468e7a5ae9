use std::io;

use thiserror::Error;

use crate::provider::{Role, TerminalId};

/// Per-connection failures. None of these ever reach the accept loop; each is
/// logged at the boundary of the task that owns the connection.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("handshake magic mismatch: got {found:?}")]
    ProtocolMismatch { found: [u8; 4] },

    #[error("unknown opcode {0}")]
    ProtocolViolation(u8),

    #[error("handshake not completed within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("terminal id {0} was never allocated")]
    UnknownTerminalId(TerminalId),

    #[error("no live {role} handle for terminal id {id}")]
    UnknownHandle { id: TerminalId, role: Role },

    #[error("terminal provider failed to open handle: {0}")]
    ProviderOpenFailed(#[source] io::Error),

    #[error("terminal provider ioctl {request:#x} failed: {source}")]
    ProviderIoctlFailed {
        request: u64,
        #[source]
        source: io::Error,
    },

    #[error("control ioctl {0:#x} needs process context and is not forwarded")]
    ControlIoctlUnsupported(u64),

    #[error("terminal registry is full ({capacity} ids)")]
    RegistryFull { capacity: usize },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl BridgeError {
    /// Error code written into an ioctl reply for failures that are surfaced
    /// to the client instead of closing the connection.
    pub fn errno(&self) -> i32 {
        match self {
            BridgeError::ControlIoctlUnsupported(_) => libc::ENOTTY,
            BridgeError::ProviderIoctlFailed { source, .. } => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
            _ => libc::EIO,
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_for_rejected_control_ioctl_is_enotty() {
        let err = BridgeError::ControlIoctlUnsupported(0x540E);
        assert_eq!(err.errno(), libc::ENOTTY);
    }

    #[test]
    fn errno_falls_back_to_eio_without_os_error() {
        let err = BridgeError::ProviderIoctlFailed {
            request: 0x5401,
            source: io::Error::new(io::ErrorKind::Other, "boom"),
        };
        assert_eq!(err.errno(), libc::EIO);

        let err = BridgeError::ProviderIoctlFailed {
            request: 0x5401,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        };
        assert_eq!(err.errno(), libc::EINVAL);
    }
}
