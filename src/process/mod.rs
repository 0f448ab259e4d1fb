// Process Management Module for the lifecycle core
pub mod context;
pub mod pcb;
pub mod pid;
pub mod scheduler;
pub mod table;
pub mod user_stack;
pub mod wait_status;

pub use context::CpuRegisters;
pub use pcb::{Process, ProcessError, ProcessId, ProcessState};
pub use pid::{PidAllocator, PidHandle};
pub use scheduler::{SchedError, Scheduler, ThreadEntry, ThreadId, UserMode};
pub use table::{ProcessSnapshot, ProcessTable};
