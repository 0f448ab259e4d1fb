// Process Control Block (PCB) for the lifecycle core
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use spin::{Mutex, MutexGuard};

use super::pid::PidHandle;
use super::scheduler::{SchedError, Scheduler, ThreadId};
use crate::services::file_system_service::LoadError;
use crate::services::memory_service::{AddressSpace, CopyStrError, Fault, VmError};
use crate::sync::Condvar;

/// Process ID type
pub type ProcessId = u64;

/// Process state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running, // Has an execution context and an address space
    Zombie,  // Exited, exit code waiting to be collected
    Reaped,  // Collected (or orphaned at exit); about to disappear
}

/// Process Control Block
///
/// Identity is fixed for the record's whole life. Everything that another
/// process may look at sits in `inner`, behind the record's one lock, paired
/// with `exit_cv`. The address space slot is only ever touched by the
/// process's own execution context, so its lock is never contended and may
/// be held across calls that block on memory.
pub struct Process {
    pid: ProcessId,
    space: Mutex<Option<Box<dyn AddressSpace>>>,
    inner: Mutex<ProcessInner>,
    exit_cv: Condvar,
}

pub struct ProcessInner {
    pub name: String,
    pub state: ProcessState,
    pub parent: Option<Weak<Process>>,
    pub children: Vec<ProcessId>,
    pub exit_code: Option<i32>,
    pub thread: Option<ThreadId>,
    // Held until the record is reaped, not until the last `Arc` goes away.
    id: Option<PidHandle>,
}

impl ProcessInner {
    /// Exit code, once the process has published one.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_code
    }

    /// A parent that exits severs the link first, so a link that is still
    /// set and still resolves belongs to a running parent.
    fn has_live_parent(&self) -> bool {
        self.parent
            .as_ref()
            .map_or(false, |p| p.strong_count() > 0)
    }

    fn reap(&mut self) -> Option<PidHandle> {
        self.parent = None;
        self.state = ProcessState::Reaped;
        self.id.take()
    }
}

impl Process {
    pub fn new(
        pid: PidHandle,
        name: String,
        parent: Option<Weak<Process>>,
        space: Box<dyn AddressSpace>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pid: pid.pid(),
            space: Mutex::new(Some(space)),
            inner: Mutex::new(ProcessInner {
                name,
                state: ProcessState::Running,
                parent,
                children: Vec::new(),
                exit_code: None,
                thread: None,
                id: Some(pid),
            }),
            exit_cv: Condvar::new(),
        })
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn set_name(&self, name: String) {
        self.inner.lock().name = name;
    }

    pub fn state(&self) -> ProcessState {
        self.inner.lock().state
    }

    pub fn parent_pid(&self) -> Option<ProcessId> {
        let parent = self.inner.lock().parent.clone();
        parent.and_then(|p| p.upgrade()).map(|p| p.pid())
    }

    pub fn set_thread(&self, thread: ThreadId) {
        self.inner.lock().thread = Some(thread);
    }

    // ---- children --------------------------------------------------------

    pub fn has_child(&self, pid: ProcessId) -> bool {
        self.inner.lock().children.contains(&pid)
    }

    pub fn children(&self) -> Vec<ProcessId> {
        self.inner.lock().children.clone()
    }

    pub fn add_child(&self, pid: ProcessId) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.children.contains(&pid));
        inner.children.push(pid);
    }

    pub fn remove_child(&self, pid: ProcessId) -> bool {
        let mut inner = self.inner.lock();
        match inner.children.iter().position(|c| *c == pid) {
            Some(idx) => {
                inner.children.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn take_children(&self) -> Vec<ProcessId> {
        core::mem::take(&mut self.inner.lock().children)
    }

    // ---- address space ---------------------------------------------------

    fn space_slot(&self) -> MutexGuard<'_, Option<Box<dyn AddressSpace>>> {
        match self.space.try_lock() {
            Some(slot) => slot,
            None => panic!("address space of pid {} touched concurrently", self.pid),
        }
    }

    pub fn has_space(&self) -> bool {
        self.space_slot().is_some()
    }

    /// Run `f` against the installed address space.
    ///
    /// Only valid while the process is running; a missing address space
    /// there is a broken invariant. `f` must not reach back into this
    /// process's address space slot.
    pub fn with_space<R>(&self, f: impl FnOnce(&mut dyn AddressSpace) -> R) -> R {
        let mut slot = self.space_slot();
        match slot.as_deref_mut() {
            Some(space) => f(space),
            None => panic!("pid {} has no address space while running", self.pid()),
        }
    }

    pub fn activate_space(&self) {
        self.with_space(|space| space.activate());
    }

    /// Detach the address space so nothing can activate it again.
    pub fn take_space(&self) -> Option<Box<dyn AddressSpace>> {
        self.space_slot().take()
    }

    /// Install `space`, handing back the one it replaces.
    pub fn replace_space(&self, space: Box<dyn AddressSpace>) -> Box<dyn AddressSpace> {
        let old = self.space_slot().replace(space);
        match old {
            Some(old) => old,
            None => panic!("pid {} replaced an address space it did not have", self.pid()),
        }
    }

    // ---- exit / wait -----------------------------------------------------

    /// Publish `code` and wake every waiter.
    ///
    /// Returns the identifier when nobody can ever collect the code (no
    /// running parent). The record is then already marked reaped; the caller
    /// drops it from the table before dropping the identifier.
    pub fn publish_exit(&self, code: i32, scheduler: &dyn Scheduler) -> Option<PidHandle> {
        assert!(
            !self.has_space(),
            "pid {} published its exit code while still owning an address space",
            self.pid()
        );
        let mut inner = self.inner.lock();
        assert!(
            inner.state == ProcessState::Running && inner.exit_code.is_none(),
            "pid {} exited twice",
            self.pid()
        );
        inner.exit_code = Some(code);
        inner.thread = None;
        let released = if inner.has_live_parent() {
            inner.state = ProcessState::Zombie;
            None
        } else {
            inner.reap()
        };
        self.exit_cv.notify_all(scheduler);
        released
    }

    /// Block until the exit code is published, then return it.
    pub fn wait_for_exit(&self, scheduler: &dyn Scheduler) -> i32 {
        self.exit_cv
            .wait_until(&self.inner, scheduler, |inner| inner.exit_status())
    }

    /// Exit code if already published; never blocks.
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lock().exit_status()
    }

    /// Sever the link to the parent, which is exiting.
    ///
    /// Returns the identifier if this record is a zombie; it is then marked
    /// reaped and the caller must drop it from the table.
    pub fn detach_parent(&self) -> Option<PidHandle> {
        let mut inner = self.inner.lock();
        inner.parent = None;
        if inner.state == ProcessState::Zombie {
            inner.reap()
        } else {
            None
        }
    }

    /// Claim a zombie for reaping, handing back its identifier. `None` if it
    /// is not a zombie.
    pub fn mark_reaped(&self) -> Option<PidHandle> {
        let mut inner = self.inner.lock();
        if inner.state == ProcessState::Zombie {
            inner.reap()
        } else {
            None
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.exit_cv.waiter_count()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Process")
            .field("pid", &self.pid())
            .field("name", &inner.name)
            .field("state", &inner.state)
            .field("children", &inner.children)
            .field("exit_code", &inner.exit_code)
            .field("thread", &inner.thread)
            .finish()
    }
}

/// Process management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    InvalidArgument,
    InvalidPointer,
    NoSuchProcess,
    NotMyChild,
    ArgumentListTooLong,
    NameTooLong,
    ResourceExhausted,
    OutOfMemory,
    NoSuchFile,
    ExecFormat,
    ThreadSpawnFailed,
}

impl ProcessError {
    /// os161 errno value for this error.
    pub fn errno(&self) -> i32 {
        match self {
            ProcessError::OutOfMemory => 3,         // ENOMEM
            ProcessError::InvalidPointer => 6,      // EFAULT
            ProcessError::NameTooLong => 7,         // ENAMETOOLONG
            ProcessError::InvalidArgument => 8,     // EINVAL
            ProcessError::ResourceExhausted => 12,  // ENPROC
            ProcessError::ExecFormat => 13,         // ENOEXEC
            ProcessError::ArgumentListTooLong => 14, // E2BIG
            ProcessError::NoSuchProcess => 15,      // ESRCH
            ProcessError::NotMyChild => 16,         // ECHILD
            ProcessError::NoSuchFile => 19,         // ENOENT
            ProcessError::ThreadSpawnFailed => 3,   // ENOMEM
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessError::InvalidArgument => write!(f, "Invalid argument"),
            ProcessError::InvalidPointer => write!(f, "Bad user address"),
            ProcessError::NoSuchProcess => write!(f, "No such process"),
            ProcessError::NotMyChild => write!(f, "Not a child of the caller"),
            ProcessError::ArgumentListTooLong => write!(f, "Argument list too long"),
            ProcessError::NameTooLong => write!(f, "File name too long"),
            ProcessError::ResourceExhausted => write!(f, "Too many processes"),
            ProcessError::OutOfMemory => write!(f, "Out of memory"),
            ProcessError::NoSuchFile => write!(f, "No such file"),
            ProcessError::ExecFormat => write!(f, "Exec format error"),
            ProcessError::ThreadSpawnFailed => write!(f, "Could not start execution context"),
        }
    }
}

impl From<VmError> for ProcessError {
    fn from(_: VmError) -> Self {
        ProcessError::OutOfMemory
    }
}

impl From<Fault> for ProcessError {
    fn from(_: Fault) -> Self {
        ProcessError::InvalidPointer
    }
}

impl From<SchedError> for ProcessError {
    fn from(_: SchedError) -> Self {
        ProcessError::ThreadSpawnFailed
    }
}

impl From<LoadError> for ProcessError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::NotFound => ProcessError::NoSuchFile,
            LoadError::BadFormat | LoadError::Io => ProcessError::ExecFormat,
            LoadError::OutOfMemory => ProcessError::OutOfMemory,
        }
    }
}

impl From<CopyStrError> for ProcessError {
    fn from(e: CopyStrError) -> Self {
        match e {
            CopyStrError::Fault(_) => ProcessError::InvalidPointer,
            CopyStrError::TooLong => ProcessError::NameTooLong,
        }
    }
}
