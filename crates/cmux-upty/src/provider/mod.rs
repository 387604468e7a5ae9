//! Terminal provider interface.
//!
//! The daemon never implements pty semantics itself. A provider allocates
//! master handles, opens slaves by terminal id and performs I/O and ioctls on
//! handles. Two providers ship with the crate:
//! - [`MemoryProvider`]: in-process virtual pty pairs
//! - [`HostProvider`]: the host kernel's `/dev/ptmx` (Linux only)

use std::fmt;
use std::io;
use std::sync::Arc;

pub mod memory;
#[cfg(target_os = "linux")]
pub mod host;

#[cfg(target_os = "linux")]
pub use host::HostProvider;
pub use memory::MemoryProvider;

/// Numeric id of a pty pair (the pts number), chosen by the provider.
pub type TerminalId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    /// Nonzero targets the master, zero the slave.
    pub fn from_wire(byte: u8) -> Self {
        if byte != 0 {
            Role::Master
        } else {
            Role::Slave
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Role::Master => 1,
            Role::Slave => 0,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Slave => f.write_str("slave"),
        }
    }
}

/// Ioctl argument as handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlArg {
    /// Inline integer, not a pointer.
    Value(u64),
    /// Buffer passed by reference. Providers may rewrite it in place but must
    /// not change its length.
    Buffer(Vec<u8>),
}

/// Invoked by a provider on a readiness transition. Callbacks must not block.
pub type EventCallback = Box<dyn Fn() + Send + Sync>;

/// One open end of a pty pair.
///
/// All methods are non-blocking. `read` and `write` report "try again later"
/// as [`io::ErrorKind::WouldBlock`]; `write` may accept fewer bytes than
/// offered. Implementations must tolerate concurrent calls from the relay and
/// ioctl engines on the same handle.
pub trait PtyHandle: Send + Sync {
    fn id(&self) -> TerminalId;

    fn role(&self) -> Role;

    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Returns the ioctl's return value; errors carry the OS error number
    /// when one exists.
    fn ioctl(&self, request: u64, arg: &mut IoctlArg) -> io::Result<i32>;

    /// Edge-triggered: fires once per transition to readable, not per byte.
    /// A later registration replaces the earlier one.
    fn register_readable(&self, callback: EventCallback);

    /// Fires once when the peer end goes away.
    fn register_hangup(&self, callback: EventCallback);

    /// Closes the handle. Every later call fails; calling twice is a no-op.
    fn release(&self);
}

pub type SharedHandle = Arc<dyn PtyHandle>;

pub trait TerminalProvider: Send + Sync {
    fn allocate_master(&self) -> io::Result<(SharedHandle, TerminalId)>;

    /// Fails with [`io::ErrorKind::NotFound`] when `id` was never allocated.
    fn open_slave(&self, id: TerminalId) -> io::Result<SharedHandle>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    #[default]
    Memory,
    Host,
}

impl ProviderKind {
    pub fn build(self) -> io::Result<Arc<dyn TerminalProvider>> {
        match self {
            ProviderKind::Memory => Ok(Arc::new(MemoryProvider::new())),
            #[cfg(target_os = "linux")]
            ProviderKind::Host => Ok(Arc::new(HostProvider::new())),
            #[cfg(not(target_os = "linux"))]
            ProviderKind::Host => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "host pty provider is only available on Linux",
            )),
        }
    }
}

pub(crate) fn released_error() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}
