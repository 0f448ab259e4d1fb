//! Lifecycle configuration.
//!
//! Compile-time limits for the identifier space and for `execv` argument
//! handling, plus [`LifecycleConfig`], the runtime copy of those limits that a
//! [`ProcessService`](crate::services::process_service::ProcessService) is
//! built with.

/// Highest process identifier handed out. Identifiers live in `[1, MAX_PID]`.
pub const MAX_PID: u64 = 256;

/// Maximum number of entries in an `execv` argument vector.
pub const MAX_ARGS: usize = 64;

/// Maximum total size of the argument strings, terminators included.
pub const ARG_MAX_BYTES: usize = 64 * 1024;

/// Maximum length of an executable path, terminator included.
pub const PATH_MAX: usize = 1024;

/// Size of a user pointer in the argv array.
pub const POINTER_SIZE: u64 = core::mem::size_of::<u64>() as u64;

/// Stack pointer alignment at program entry (x86-64 SysV ABI).
pub const STACK_ALIGN: u64 = 16;

/// First address past the user half of the address space.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Suffix appended to the parent's name for a forked child.
pub const FORK_NAME_SUFFIX: &str = "_forked";

/// Runtime limits for a process service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub max_pid: u64,
    pub max_args: usize,
    pub arg_max_bytes: usize,
    pub path_max: usize,
}

impl LifecycleConfig {
    pub const fn new() -> Self {
        Self {
            max_pid: MAX_PID,
            max_args: MAX_ARGS,
            arg_max_bytes: ARG_MAX_BYTES,
            path_max: PATH_MAX,
        }
    }

    pub const fn with_max_pid(mut self, max_pid: u64) -> Self {
        self.max_pid = max_pid;
        self
    }

    pub const fn with_max_args(mut self, max_args: usize) -> Self {
        self.max_args = max_args;
        self
    }

    pub const fn with_arg_max_bytes(mut self, arg_max_bytes: usize) -> Self {
        self.arg_max_bytes = arg_max_bytes;
        self
    }

    pub const fn with_path_max(mut self, path_max: usize) -> Self {
        self.path_max = path_max;
        self
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::new()
    }
}
