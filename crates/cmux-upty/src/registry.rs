//! Terminal id → handle table shared by the dispatcher and the ioctl engine.
//!
//! Entries hold weak references: the relay that opened a handle owns it, the
//! registry only lets later ioctl requests find it while it is alive. Entries
//! are never removed, so an id stays "known" for the daemon's lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::BridgeError;
use crate::provider::{PtyHandle, Role, SharedHandle, TerminalId};

#[derive(Default)]
struct Entry {
    master: Option<Weak<dyn PtyHandle>>,
    /// Every slave opened for this id, oldest first.
    slaves: Vec<Weak<dyn PtyHandle>>,
}

pub struct Registry {
    entries: RwLock<HashMap<TerminalId, Entry>>,
    /// `None` means the table grows without bound.
    capacity: Option<usize>,
}

impl Registry {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of terminal ids ever registered.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` was registered by an open-master request.
    pub fn contains(&self, id: TerminalId) -> bool {
        self.entries
            .read()
            .get(&id)
            .is_some_and(|entry| entry.master.is_some())
    }

    pub fn register_master(&self, id: TerminalId, handle: &SharedHandle) -> Result<(), BridgeError> {
        let mut entries = self.entries.write();
        if let Some(capacity) = self.capacity {
            if !entries.contains_key(&id) && entries.len() >= capacity {
                return Err(BridgeError::RegistryFull { capacity });
            }
        }
        entries.entry(id).or_default().master = Some(Arc::downgrade(handle));
        Ok(())
    }

    pub fn register_slave(&self, id: TerminalId, handle: &SharedHandle) {
        let mut entries = self.entries.write();
        let entry = entries.entry(id).or_default();
        entry.slaves.retain(|weak| weak.strong_count() > 0);
        entry.slaves.push(Arc::downgrade(handle));
    }

    /// Live handle for `(id, role)`. For slaves this is the most recently
    /// opened one that has not been released yet.
    pub fn lookup(&self, id: TerminalId, role: Role) -> Option<SharedHandle> {
        let entries = self.entries.read();
        let entry = entries.get(&id)?;
        match role {
            Role::Master => entry.master.as_ref()?.upgrade(),
            Role::Slave => entry.slaves.iter().rev().find_map(Weak::upgrade),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(None)
    }
}
