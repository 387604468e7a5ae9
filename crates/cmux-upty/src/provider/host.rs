//! Pty pairs backed by the host kernel's `/dev/ptmx`.
//!
//! Handles are non-blocking file descriptors registered with the tokio
//! reactor. A watcher task per handle turns reactor readiness into the
//! provider callbacks.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{
    released_error, EventCallback, IoctlArg, PtyHandle, Role, SharedHandle, TerminalId,
    TerminalProvider,
};
use crate::protocol::takes_integer_arg;

/// Pointer arguments always point into a zeroed scratch area at least this
/// large. Linux tty requests move at most a few hundred bytes (`termios2`,
/// `serial_struct`), so a request that writes more than the client sent
/// cannot overrun.
const IOCTL_SCRATCH_LEN: usize = 4096;

/// Generic fd requests that would change state the daemon relies on:
/// FIONBIO, FIOASYNC, FIOCLEX and FIONCLEX.
const FD_STATE_IOCTLS: [u64; 4] = [0x5421, 0x5452, 0x5451, 0x5450];

#[derive(Default)]
pub struct HostProvider {
    /// Pts numbers whose master is still open here. The kernel reuses a
    /// number once its master closes, so released ids must leave this set.
    allocated: Arc<DashSet<TerminalId>>,
}

impl HostProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TerminalProvider for HostProvider {
    fn allocate_master(&self) -> io::Result<(SharedHandle, TerminalId)> {
        let raw = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let master = unsafe { OwnedFd::from_raw_fd(raw) };
        if unsafe { libc::unlockpt(master.as_raw_fd()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut pts: libc::c_uint = 0;
        let pts_ptr: *mut libc::c_uint = &mut pts;
        let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCGPTN, pts_ptr) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        set_nonblocking(master.as_raw_fd())?;

        // Linux reports the master as hung up until a slave is open. Holding
        // one for the master's lifetime keeps the relay from ending early.
        let keeper = open_pts(pts)?;

        let id = pts as TerminalId;
        let mut handle = HostHandle::new(master, id, Role::Master, Some(keeper))?;
        handle.allocated = Some(Arc::clone(&self.allocated));
        self.allocated.insert(id);
        debug!(id, "allocated host pty");
        Ok((Arc::new(handle), id))
    }

    fn open_slave(&self, id: TerminalId) -> io::Result<SharedHandle> {
        // Held across the open so the master cannot be released (and its
        // number reused) in between.
        let Some(_live) = self.allocated.get(&id) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("pty {id} is not allocated by this daemon"),
            ));
        };
        let slave = open_pts(id)?;
        Ok(Arc::new(HostHandle::new(slave, id, Role::Slave, None)?))
    }
}

fn open_pts(id: TerminalId) -> io::Result<OwnedFd> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(format!("/dev/pts/{id}"))?;
    Ok(OwnedFd::from(file))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn ioctl_with_scratch(raw: RawFd, request: u64, seed: &[u8]) -> io::Result<(i32, Vec<u8>)> {
    let mut scratch = vec![0u8; IOCTL_SCRATCH_LEN.max(seed.len())];
    scratch[..seed.len()].copy_from_slice(seed);
    let ret = unsafe { libc::ioctl(raw, request as _, scratch.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((ret, scratch))
}

type CallbackSlot = Arc<Mutex<Option<EventCallback>>>;

fn fire(slot: &CallbackSlot) {
    if let Some(callback) = slot.lock().as_ref() {
        callback();
    }
}

pub struct HostHandle {
    id: TerminalId,
    role: Role,
    fd: RwLock<Option<Arc<AsyncFd<OwnedFd>>>>,
    keeper: Mutex<Option<OwnedFd>>,
    readable: CallbackSlot,
    hangup: CallbackSlot,
    watching: AtomicBool,
    closed: Arc<Notify>,
    /// Set on masters so release can retire the id.
    allocated: Option<Arc<DashSet<TerminalId>>>,
}

impl HostHandle {
    fn new(fd: OwnedFd, id: TerminalId, role: Role, keeper: Option<OwnedFd>) -> io::Result<Self> {
        let fd = AsyncFd::with_interest(fd, Interest::READABLE)?;
        Ok(Self {
            id,
            role,
            fd: RwLock::new(Some(Arc::new(fd))),
            keeper: Mutex::new(keeper),
            readable: Arc::new(Mutex::new(None)),
            hangup: Arc::new(Mutex::new(None)),
            watching: AtomicBool::new(false),
            closed: Arc::new(Notify::new()),
            allocated: None,
        })
    }

    fn start_watcher(&self) {
        if self.watching.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(fd) = self.fd.read().clone() else {
            return;
        };
        let readable = Arc::clone(&self.readable);
        let hangup = Arc::clone(&self.hangup);
        let closed = Arc::clone(&self.closed);
        let id = self.id;
        let role = self.role;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.notified() => break,
                    guard = fd.readable() => {
                        let mut guard = match guard {
                            Ok(guard) => guard,
                            Err(e) => {
                                warn!(id, %role, "pty readiness failed: {}", e);
                                fire(&hangup);
                                break;
                            }
                        };
                        let ready = guard.ready();
                        guard.clear_ready();
                        fire(&readable);
                        if ready.is_read_closed() {
                            debug!(id, %role, "pty hung up");
                            fire(&hangup);
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl PtyHandle for HostHandle {
    fn id(&self) -> TerminalId {
        self.id
    }

    fn role(&self) -> Role {
        self.role
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = self.fd.read();
        let fd = guard.as_ref().ok_or_else(released_error)?;
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let guard = self.fd.read();
        let fd = guard.as_ref().ok_or_else(released_error)?;
        let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn ioctl(&self, request: u64, arg: &mut IoctlArg) -> io::Result<i32> {
        if FD_STATE_IOCTLS.contains(&request) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let guard = self.fd.read();
        let raw = guard.as_ref().ok_or_else(released_error)?.as_raw_fd();
        match arg {
            IoctlArg::Value(value) if takes_integer_arg(request) => {
                let ret = unsafe { libc::ioctl(raw, request as _, *value as libc::c_ulong) };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret)
                }
            }
            IoctlArg::Buffer(_) if takes_integer_arg(request) => {
                Err(io::Error::from_raw_os_error(libc::EINVAL))
            }
            // Any other request takes a pointer: the value is handed over as
            // the pointee, never as an address.
            IoctlArg::Value(value) => {
                let (ret, _) = ioctl_with_scratch(raw, request, &value.to_le_bytes())?;
                Ok(ret)
            }
            IoctlArg::Buffer(buf) => {
                let (ret, scratch) = ioctl_with_scratch(raw, request, buf)?;
                let len = buf.len();
                buf.copy_from_slice(&scratch[..len]);
                Ok(ret)
            }
        }
    }

    fn register_readable(&self, callback: EventCallback) {
        *self.readable.lock() = Some(callback);
        self.start_watcher();
    }

    fn register_hangup(&self, callback: EventCallback) {
        *self.hangup.lock() = Some(callback);
        self.start_watcher();
    }

    fn release(&self) {
        let Some(fd) = self.fd.write().take() else {
            return;
        };
        // Retire the id while the fd is still open so the kernel cannot have
        // reused the number yet.
        if let Some(allocated) = &self.allocated {
            allocated.remove(&self.id);
        }
        self.keeper.lock().take();
        self.closed.notify_one();
        drop(fd);
        debug!(id = self.id, role = %self.role, "released host pty handle");
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        self.release();
    }
}
