// src/syscalls.rs
use alloc::sync::Arc;
use core::fmt;

use crate::process::context::CpuRegisters;
use crate::process::pcb::{Process, ProcessError};
use crate::services::process_service::{process_service, ProcessService};

/// System call numbers
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNumber {
    Exit = 0,
    GetPid = 1,
    Fork = 2,
    WaitPid = 3,
    Execv = 4,
}

impl TryFrom<u64> for SyscallNumber {
    type Error = SyscallError;

    fn try_from(num: u64) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(SyscallNumber::Exit),
            1 => Ok(SyscallNumber::GetPid),
            2 => Ok(SyscallNumber::Fork),
            3 => Ok(SyscallNumber::WaitPid),
            4 => Ok(SyscallNumber::Execv),
            _ => Err(SyscallError::InvalidSyscall),
        }
    }
}

/// System call arguments (up to 6 arguments in x86_64)
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs {
    pub arg0: u64,  // rdi
    pub arg1: u64,  // rsi
    pub arg2: u64,  // rdx
    pub arg3: u64,  // r10
    pub arg4: u64,  // r8
    pub arg5: u64,  // r9
}

impl SyscallArgs {
    pub fn from_frame(frame: &CpuRegisters) -> Self {
        Self {
            arg0: frame.rdi,
            arg1: frame.rsi,
            arg2: frame.rdx,
            arg3: frame.r10,
            arg4: frame.r8,
            arg5: frame.r9,
        }
    }
}

/// System call result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallResult {
    Success(u64),
    Error(SyscallError),
}

/// System call errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall,
    InvalidArgument,
    BadAddress,
    NoSuchProcess,
    NotChild,
    ArgumentListTooLong,
    NameTooLong,
    TooManyProcesses,
    OutOfMemory,
    NoSuchFile,
    ExecFormat,
    ServiceUnavailable,
}

impl SyscallError {
    /// os161 errno value reported to user programs.
    pub fn errno(&self) -> i32 {
        match self {
            SyscallError::InvalidSyscall => 1,       // ENOSYS
            SyscallError::OutOfMemory => 3,          // ENOMEM
            SyscallError::BadAddress => 6,           // EFAULT
            SyscallError::NameTooLong => 7,          // ENAMETOOLONG
            SyscallError::InvalidArgument => 8,      // EINVAL
            SyscallError::TooManyProcesses => 12,    // ENPROC
            SyscallError::ExecFormat => 13,          // ENOEXEC
            SyscallError::ArgumentListTooLong => 14, // E2BIG
            SyscallError::NoSuchProcess => 15,       // ESRCH
            SyscallError::NotChild => 16,            // ECHILD
            SyscallError::NoSuchFile => 19,          // ENOENT
            SyscallError::ServiceUnavailable => 1,   // ENOSYS
        }
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyscallError::InvalidSyscall => write!(f, "Invalid syscall number"),
            SyscallError::InvalidArgument => write!(f, "Invalid argument"),
            SyscallError::BadAddress => write!(f, "Bad address"),
            SyscallError::NoSuchProcess => write!(f, "No such process"),
            SyscallError::NotChild => write!(f, "Not a child process"),
            SyscallError::ArgumentListTooLong => write!(f, "Argument list too long"),
            SyscallError::NameTooLong => write!(f, "File name too long"),
            SyscallError::TooManyProcesses => write!(f, "Too many processes"),
            SyscallError::OutOfMemory => write!(f, "Out of memory"),
            SyscallError::NoSuchFile => write!(f, "No such file"),
            SyscallError::ExecFormat => write!(f, "Exec format error"),
            SyscallError::ServiceUnavailable => write!(f, "Process service not initialized"),
        }
    }
}

impl From<ProcessError> for SyscallError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::InvalidArgument => SyscallError::InvalidArgument,
            ProcessError::InvalidPointer => SyscallError::BadAddress,
            ProcessError::NoSuchProcess => SyscallError::NoSuchProcess,
            ProcessError::NotMyChild => SyscallError::NotChild,
            ProcessError::ArgumentListTooLong => SyscallError::ArgumentListTooLong,
            ProcessError::NameTooLong => SyscallError::NameTooLong,
            ProcessError::ResourceExhausted => SyscallError::TooManyProcesses,
            ProcessError::OutOfMemory | ProcessError::ThreadSpawnFailed => SyscallError::OutOfMemory,
            ProcessError::NoSuchFile => SyscallError::NoSuchFile,
            ProcessError::ExecFormat => SyscallError::ExecFormat,
        }
    }
}

impl From<Result<u64, ProcessError>> for SyscallResult {
    fn from(result: Result<u64, ProcessError>) -> Self {
        match result {
            Ok(value) => SyscallResult::Success(value),
            Err(e) => SyscallResult::Error(e.into()),
        }
    }
}

/// Convert syscall result to u64 for return value
impl From<SyscallResult> for u64 {
    fn from(result: SyscallResult) -> u64 {
        match result {
            SyscallResult::Success(value) => value,
            SyscallResult::Error(err) => {
                // Use high bit to indicate error
                0x8000_0000_0000_0000 | (err.errno() as u64)
            }
        }
    }
}

/// Handle a system call from `caller` through the installed process service.
///
/// `frame` is the caller's saved user state; arguments are taken from it.
/// `caller` is the entry path's own reference to the calling process and is
/// consumed by `Exit`.
pub fn handle_syscall(caller: Arc<Process>, syscall_num: u64, frame: &CpuRegisters) -> SyscallResult {
    match process_service() {
        Some(service) => dispatch(service, caller, syscall_num, frame),
        None => SyscallResult::Error(SyscallError::ServiceUnavailable),
    }
}

/// Handle a system call against an explicit process service.
pub fn dispatch(
    service: &ProcessService,
    caller: Arc<Process>,
    syscall_num: u64,
    frame: &CpuRegisters,
) -> SyscallResult {
    let args = SyscallArgs::from_frame(frame);
    let number = match SyscallNumber::try_from(syscall_num) {
        Ok(number) => number,
        Err(e) => {
            log::warn!("pid {}: unknown syscall {}", caller.pid(), syscall_num);
            return SyscallResult::Error(e);
        }
    };

    match number {
        SyscallNumber::Exit => syscall_exit(service, caller, args),
        SyscallNumber::GetPid => syscall_get_pid(service, &caller),
        SyscallNumber::Fork => syscall_fork(service, &caller, frame),
        SyscallNumber::WaitPid => syscall_waitpid(service, &caller, args),
        SyscallNumber::Execv => syscall_execv(service, &caller, args),
    }
}

// Individual syscall implementations
pub fn syscall_exit(service: &ProcessService, caller: Arc<Process>, args: SyscallArgs) -> ! {
    // `int` argument: only the low 32 bits of rdi are meaningful.
    let exit_code = args.arg0 as i32;
    service.exit(caller, exit_code)
}

pub fn syscall_get_pid(service: &ProcessService, caller: &Arc<Process>) -> SyscallResult {
    SyscallResult::Success(service.getpid(caller))
}

pub fn syscall_fork(service: &ProcessService, caller: &Arc<Process>, frame: &CpuRegisters) -> SyscallResult {
    service.fork(caller, frame).into()
}

pub fn syscall_waitpid(service: &ProcessService, caller: &Arc<Process>, args: SyscallArgs) -> SyscallResult {
    // A negative pid arrives sign-extended and fails the range check.
    let pid = args.arg0;
    let status_ptr = args.arg1;
    let options = args.arg2;
    service.waitpid(caller, pid, status_ptr, options).into()
}

pub fn syscall_execv(service: &ProcessService, caller: &Arc<Process>, args: SyscallArgs) -> SyscallResult {
    let path_ptr = args.arg0;
    let argv_ptr = args.arg1;
    match service.execv(caller, path_ptr, argv_ptr) {
        Ok(never) => match never {},
        Err(e) => SyscallResult::Error(e.into()),
    }
}
