// Execution-context contract consumed by the lifecycle core
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;

use super::context::CpuRegisters;
use super::pcb::Process;

/// Identifier of one scheduler-managed execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Body of a new execution context. Runs once, on the new context.
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// No room for another execution context (stack, TCB, ...).
    OutOfResources,
}

/// The thread/CPU scheduler as seen by the lifecycle core.
///
/// `block_current` and `wake` must have permit semantics: a `wake` delivered
/// to a context that is not blocked yet makes its next `block_current`
/// return immediately. Spurious returns from `block_current` are allowed;
/// callers re-check their condition.
pub trait Scheduler: Send + Sync {
    /// Start a new execution context running `entry`.
    ///
    /// On failure `entry` is dropped without running.
    fn spawn(&self, name: &str, entry: ThreadEntry) -> Result<ThreadId, SchedError>;

    /// The execution context making this call.
    fn current(&self) -> ThreadId;

    /// Suspend the calling context until it is woken.
    fn block_current(&self);

    /// Make `thread` runnable again.
    fn wake(&self, thread: ThreadId);

    /// Tear down the calling context. Never returns.
    ///
    /// The lifecycle core has released everything it owns for the process
    /// before calling this. Values still on the retired context's stack are
    /// dropped if the implementation unwinds it and leaked otherwise; either
    /// is allowed.
    fn retire_current(&self) -> !;
}

/// Return-to-user path: load `frame` and drop to user mode as `process`.
pub trait UserMode: Send + Sync {
    fn enter_user(&self, process: Arc<Process>, frame: CpuRegisters) -> !;
}
