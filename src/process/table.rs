//! Process Table
//!
//! Maps live identifiers to their process records. A record is in the table
//! from the moment it is registered until it is reaped.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

use super::pcb::{Process, ProcessId, ProcessState};

pub struct ProcessTable {
    /// All registered processes indexed by PID
    processes: RwLock<BTreeMap<ProcessId, Arc<Process>>>,
}

impl ProcessTable {
    /// Create a new empty process table
    pub const fn new() -> Self {
        Self {
            processes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a process under its own identifier.
    pub fn insert(&self, process: Arc<Process>) {
        let pid = process.pid();
        let previous = self.processes.write().insert(pid, process);
        assert!(previous.is_none(), "pid {} registered twice", pid);
    }

    pub fn lookup(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.processes.read().get(&pid).cloned()
    }

    /// Remove a process. The identifier is recycled once the last reference
    /// to the record goes away.
    pub fn remove(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.processes.write().remove(&pid)
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.processes.read().contains_key(&pid)
    }

    /// Get count of processes
    pub fn count(&self) -> usize {
        self.processes.read().len()
    }

    /// Get a snapshot of all processes, ordered by PID.
    ///
    /// The table lock is dropped before any record is inspected.
    pub fn snapshot(&self) -> Vec<ProcessSnapshot> {
        let records: Vec<Arc<Process>> = self.processes.read().values().cloned().collect();
        records
            .iter()
            .map(|proc| ProcessSnapshot {
                pid: proc.pid(),
                parent: proc.parent_pid(),
                state: proc.state(),
                name: proc.name(),
            })
            .collect()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Lightweight snapshot of a process for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub pid: ProcessId,
    pub parent: Option<ProcessId>,
    pub state: ProcessState,
    pub name: String,
}
