// Process identifier allocation for the lifecycle core
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::pcb::{ProcessError, ProcessId};

/// Bounded identifier allocator over `[1, max_pid]`.
///
/// Fresh identifiers are handed out in increasing order; released ones are
/// kept on a recycle list and reused before the counter moves on.
#[derive(Debug)]
pub struct PidAllocator {
    max_pid: ProcessId,
    inner: Mutex<RecycleState>,
}

#[derive(Debug)]
struct RecycleState {
    next: ProcessId,
    recycled: Vec<ProcessId>,
}

impl PidAllocator {
    pub fn new(max_pid: ProcessId) -> Arc<Self> {
        assert!(max_pid >= 1, "identifier domain must not be empty");
        Arc::new(Self {
            max_pid,
            inner: Mutex::new(RecycleState {
                next: 1,
                recycled: Vec::new(),
            }),
        })
    }

    /// Allocate an identifier, bound to the returned handle's lifetime.
    pub fn allocate(self: &Arc<Self>) -> Result<PidHandle, ProcessError> {
        let mut state = self.inner.lock();
        let pid = if let Some(pid) = state.recycled.pop() {
            pid
        } else if state.next <= self.max_pid {
            state.next += 1;
            state.next - 1
        } else {
            return Err(ProcessError::ResourceExhausted);
        };
        drop(state);
        Ok(PidHandle {
            pid,
            allocator: Arc::clone(self),
        })
    }

    fn release(&self, pid: ProcessId) {
        let mut state = self.inner.lock();
        assert!(
            pid >= 1 && pid < state.next,
            "pid {} was never allocated",
            pid
        );
        assert!(
            !state.recycled.iter().any(|p| *p == pid),
            "pid {} has been deallocated!",
            pid
        );
        state.recycled.push(pid);
    }

    pub fn max_pid(&self) -> ProcessId {
        self.max_pid
    }

    /// Whether `pid` lies in the identifier domain at all.
    pub fn in_domain(&self, pid: ProcessId) -> bool {
        pid >= 1 && pid <= self.max_pid
    }

    /// Number of identifiers currently bound to a handle.
    pub fn in_use(&self) -> usize {
        let state = self.inner.lock();
        (state.next - 1) as usize - state.recycled.len()
    }
}

/// Owns one live identifier; dropping it returns the identifier to its allocator.
#[derive(Debug)]
pub struct PidHandle {
    pid: ProcessId,
    allocator: Arc<PidAllocator>,
}

impl PidHandle {
    pub fn pid(&self) -> ProcessId {
        self.pid
    }
}

impl Drop for PidHandle {
    fn drop(&mut self) {
        log::trace!("release pid {}", self.pid);
        self.allocator.release(self.pid);
    }
}
