//! In-process virtual pty pairs.
//!
//! Bytes pass through unchanged (no line discipline). Each direction is a
//! bounded queue so a stalled reader pushes back on the writer with
//! `WouldBlock`. The pair keeps a window size, a raw termios blob and the pts
//! lock flag so the usual tty ioctls behave.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    released_error, EventCallback, IoctlArg, PtyHandle, Role, SharedHandle, TerminalId,
    TerminalProvider,
};
use crate::protocol::{
    FIONREAD, TCGETS, TCSETS, TCSETSF, TCSETSW, TIOCGPTLCK, TIOCGPTN, TIOCGWINSZ, TIOCSPTLCK,
    TIOCSWINSZ,
};

/// Bytes buffered per direction before writes report `WouldBlock`.
pub const QUEUE_CAPACITY: usize = 64 * 1024;

/// `struct winsize`: rows, cols, xpixel, ypixel as u16.
const WINSIZE_LEN: usize = 8;
/// Kernel `struct termios` as used by `TCGETS`.
const TERMIOS_LEN: usize = 36;
const DEFAULT_WINSIZE: [u8; WINSIZE_LEN] = [24, 0, 80, 0, 0, 0, 0, 0];

#[derive(Default)]
pub struct MemoryProvider {
    pairs: Arc<DashMap<TerminalId, Arc<PtyPair>>>,
    next_id: AtomicU32,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pairs whose master is still open.
    pub fn live_pairs(&self) -> usize {
        self.pairs.len()
    }
}

impl TerminalProvider for MemoryProvider {
    fn allocate_master(&self) -> io::Result<(SharedHandle, TerminalId)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pair = Arc::new(PtyPair::new(id));
        let events = Arc::new(EventSlots::default());
        *pair.master_events.lock() = Some(Arc::clone(&events));
        self.pairs.insert(id, Arc::clone(&pair));
        debug!(id, "allocated in-memory pty pair");
        let handle = MemoryHandle {
            pair,
            role: Role::Master,
            events,
            released: AtomicBool::new(false),
            provider_pairs: Some(Arc::clone(&self.pairs)),
        };
        Ok((Arc::new(handle), id))
    }

    fn open_slave(&self, id: TerminalId) -> io::Result<SharedHandle> {
        let pair = self
            .pairs
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no pty pair {id}"))
            })?;
        if pair.locked.load(Ordering::Acquire) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        let events = Arc::new(EventSlots::default());
        pair.slave_events.lock().push(Arc::downgrade(&events));
        Ok(Arc::new(MemoryHandle {
            pair,
            role: Role::Slave,
            events,
            released: AtomicBool::new(false),
            provider_pairs: None,
        }))
    }
}

#[derive(Default)]
struct EventSlots {
    readable: Mutex<Option<EventCallback>>,
    hangup: Mutex<Option<EventCallback>>,
    hung_up: AtomicBool,
}

impl EventSlots {
    fn fire_readable(&self) {
        if let Some(callback) = self.readable.lock().as_ref() {
            callback();
        }
    }

    fn fire_hangup(&self) {
        if self.hung_up.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(callback) = self.hangup.lock().as_ref() {
            callback();
        }
    }
}

struct PtyPair {
    id: TerminalId,
    /// Written by the master, read by slaves.
    to_slave: Mutex<VecDeque<u8>>,
    /// Written by slaves, read by the master.
    to_master: Mutex<VecDeque<u8>>,
    winsize: Mutex<[u8; WINSIZE_LEN]>,
    termios: Mutex<[u8; TERMIOS_LEN]>,
    locked: AtomicBool,
    master_open: AtomicBool,
    master_events: Mutex<Option<Arc<EventSlots>>>,
    slave_events: Mutex<Vec<Weak<EventSlots>>>,
}

impl PtyPair {
    fn new(id: TerminalId) -> Self {
        Self {
            id,
            to_slave: Mutex::new(VecDeque::new()),
            to_master: Mutex::new(VecDeque::new()),
            winsize: Mutex::new(DEFAULT_WINSIZE),
            termios: Mutex::new([0; TERMIOS_LEN]),
            locked: AtomicBool::new(false),
            master_open: AtomicBool::new(true),
            master_events: Mutex::new(None),
            slave_events: Mutex::new(Vec::new()),
        }
    }

    fn live_slave_events(&self) -> Vec<Arc<EventSlots>> {
        let mut slots = self.slave_events.lock();
        slots.retain(|weak| weak.strong_count() > 0);
        slots.iter().filter_map(Weak::upgrade).collect()
    }

    fn master_event_slots(&self) -> Option<Arc<EventSlots>> {
        self.master_events.lock().clone()
    }
}

pub struct MemoryHandle {
    pair: Arc<PtyPair>,
    role: Role,
    events: Arc<EventSlots>,
    released: AtomicBool,
    /// Set on master handles so release can drop the pair from the provider.
    provider_pairs: Option<Arc<DashMap<TerminalId, Arc<PtyPair>>>>,
}

impl MemoryHandle {
    fn ensure_open(&self) -> io::Result<()> {
        if self.released.load(Ordering::Acquire) {
            Err(released_error())
        } else {
            Ok(())
        }
    }

    fn inbound(&self) -> &Mutex<VecDeque<u8>> {
        match self.role {
            Role::Master => &self.pair.to_master,
            Role::Slave => &self.pair.to_slave,
        }
    }

    fn outbound(&self) -> &Mutex<VecDeque<u8>> {
        match self.role {
            Role::Master => &self.pair.to_slave,
            Role::Slave => &self.pair.to_master,
        }
    }

    fn peer_gone(&self) -> bool {
        match self.role {
            // Slaves may come and go for the master's whole life.
            Role::Master => false,
            Role::Slave => !self.pair.master_open.load(Ordering::Acquire),
        }
    }

    fn notify_peer_readable(&self) {
        match self.role {
            Role::Master => {
                for slots in self.pair.live_slave_events() {
                    slots.fire_readable();
                }
            }
            Role::Slave => {
                if let Some(slots) = self.pair.master_event_slots() {
                    slots.fire_readable();
                }
            }
        }
    }
}

impl PtyHandle for MemoryHandle {
    fn id(&self) -> TerminalId {
        self.pair.id
    }

    fn role(&self) -> Role {
        self.role
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let mut queue = self.inbound().lock();
        if queue.is_empty() {
            if buf.is_empty() {
                return Ok(0);
            }
            return if self.peer_gone() {
                Err(io::Error::from_raw_os_error(libc::EIO))
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(queue.len());
        for (dst, src) in buf.iter_mut().zip(queue.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        if self.peer_gone() {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        let was_empty;
        let n;
        {
            let mut queue = self.outbound().lock();
            let space = QUEUE_CAPACITY.saturating_sub(queue.len());
            if space == 0 && !buf.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            n = buf.len().min(space);
            was_empty = queue.is_empty();
            queue.extend(&buf[..n]);
        }
        if was_empty && n > 0 {
            self.notify_peer_readable();
        }
        Ok(n)
    }

    fn ioctl(&self, request: u64, arg: &mut IoctlArg) -> io::Result<i32> {
        self.ensure_open()?;
        match (request, arg) {
            (TIOCGWINSZ, IoctlArg::Buffer(buf)) => {
                copy_prefix(&*self.pair.winsize.lock(), buf);
                Ok(0)
            }
            (TIOCSWINSZ, IoctlArg::Buffer(buf)) => {
                copy_prefix(buf, &mut *self.pair.winsize.lock());
                Ok(0)
            }
            (TCGETS, IoctlArg::Buffer(buf)) => {
                copy_prefix(&*self.pair.termios.lock(), buf);
                Ok(0)
            }
            (TCSETS | TCSETSW | TCSETSF, IoctlArg::Buffer(buf)) => {
                copy_prefix(buf, &mut *self.pair.termios.lock());
                Ok(0)
            }
            (FIONREAD, IoctlArg::Buffer(buf)) => {
                let pending = self.inbound().lock().len() as i32;
                copy_prefix(&pending.to_le_bytes(), buf);
                Ok(0)
            }
            (TIOCGPTN, IoctlArg::Buffer(buf)) if self.role == Role::Master => {
                copy_prefix(&self.pair.id.to_le_bytes(), buf);
                Ok(0)
            }
            (TIOCSPTLCK, arg) if self.role == Role::Master => {
                let lock = match arg {
                    IoctlArg::Value(v) => *v != 0,
                    IoctlArg::Buffer(buf) => buf.iter().any(|b| *b != 0),
                };
                self.pair.locked.store(lock, Ordering::Release);
                Ok(0)
            }
            (TIOCGPTLCK, IoctlArg::Buffer(buf)) if self.role == Role::Master => {
                let locked = self.pair.locked.load(Ordering::Acquire) as i32;
                copy_prefix(&locked.to_le_bytes(), buf);
                Ok(0)
            }
            (TIOCGWINSZ | TIOCSWINSZ | TCGETS | TCSETS | TCSETSW | TCSETSF | FIONREAD, _) => {
                Err(io::Error::from_raw_os_error(libc::EFAULT))
            }
            _ => Err(io::Error::from_raw_os_error(libc::ENOTTY)),
        }
    }

    fn register_readable(&self, callback: EventCallback) {
        *self.events.readable.lock() = Some(callback);
    }

    fn register_hangup(&self, callback: EventCallback) {
        let already_gone = self.peer_gone();
        *self.events.hangup.lock() = Some(callback);
        if already_gone {
            self.events.fire_hangup();
        }
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.role {
            Role::Master => {
                self.pair.master_open.store(false, Ordering::Release);
                if let Some(pairs) = &self.provider_pairs {
                    pairs.remove(&self.pair.id);
                }
                for slots in self.pair.live_slave_events() {
                    slots.fire_hangup();
                }
            }
            Role::Slave => {}
        }
        debug!(id = self.pair.id, role = %self.role, "released in-memory pty handle");
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Copies as much of `src` as fits; a short client buffer gets a prefix.
fn copy_prefix(src: &[u8], dst: &mut [u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}
