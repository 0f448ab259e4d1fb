// Program loader contract used by execv and spawn_program
use alloc::boxed::Box;
use core::fmt;
use x86_64::VirtAddr;

use super::memory_service::AddressSpace;

/// Loader errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// No file at the given path.
    NotFound,
    /// The file is not a loadable executable.
    BadFormat,
    /// Mapping a segment into the target address space failed.
    OutOfMemory,
    /// Reading the file failed.
    Io,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadError::NotFound => write!(f, "No such file"),
            LoadError::BadFormat => write!(f, "Exec format error"),
            LoadError::OutOfMemory => write!(f, "Out of memory while loading"),
            LoadError::Io => write!(f, "I/O error while loading"),
        }
    }
}

/// An executable that has been opened and whose headers were accepted.
pub trait Executable: Send {
    /// Map the program's segments into `space` and return its entry point.
    fn load(&self, space: &mut dyn AddressSpace) -> Result<VirtAddr, LoadError>;
}

/// Resolves paths to executables.
pub trait Loader: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn Executable>, LoadError>;
}
