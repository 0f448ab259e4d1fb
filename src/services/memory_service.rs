// Address-space contract and the user/kernel memory bridge
use alloc::boxed::Box;
use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::config::{POINTER_SIZE, USER_SPACE_END};

/// Address-space service errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfMemory,
}

/// A user access touched memory it may not touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub addr: u64,
}

/// Errors from copying a NUL-terminated string in from user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrError {
    Fault(Fault),
    /// No terminator within the allowed length.
    TooLong,
}

impl From<Fault> for CopyStrError {
    fn from(f: Fault) -> Self {
        CopyStrError::Fault(f)
    }
}

/// One process's memory mappings.
///
/// Owned by exactly one process record at a time. Dropping the box destroys
/// the address space and everything mapped in it.
pub trait AddressSpace: Send {
    /// Deep copy; the result shares nothing mutable with `self`.
    fn duplicate(&self) -> Result<Box<dyn AddressSpace>, VmError>;

    /// Make this the address space the MMU translates through.
    fn activate(&self);

    /// Map the user stack region and return its top.
    fn define_stack(&mut self) -> Result<VirtAddr, VmError>;

    /// Read user memory at `addr` into `buf`.
    fn read(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<(), Fault>;

    /// Write `data` to user memory at `addr`.
    fn write(&mut self, addr: VirtAddr, data: &[u8]) -> Result<(), Fault>;
}

/// Creation side of the address-space service.
pub trait VmService: Send + Sync {
    fn create(&self) -> Result<Box<dyn AddressSpace>, VmError>;

    /// Stop translating through whatever address space is active.
    fn deactivate(&self);
}

/// Validate a raw user pointer for an access of `len` bytes.
///
/// Null, non-canonical and kernel-half addresses (or ranges running into the
/// kernel half) are rejected.
pub fn user_addr(raw: u64, len: usize) -> Result<VirtAddr, Fault> {
    let fault = Fault { addr: raw };
    if raw == 0 {
        return Err(fault);
    }
    let addr = VirtAddr::try_new(raw).map_err(|_| fault)?;
    let end = raw.checked_add(len as u64).ok_or(fault)?;
    if end > USER_SPACE_END {
        return Err(fault);
    }
    Ok(addr)
}

/// Copy `buf.len()` bytes in from user address `src`.
pub fn copy_in(space: &dyn AddressSpace, src: u64, buf: &mut [u8]) -> Result<(), Fault> {
    let addr = user_addr(src, buf.len())?;
    space.read(addr, buf)
}

/// Copy `data` out to user address `dst`.
pub fn copy_out(space: &mut dyn AddressSpace, dst: u64, data: &[u8]) -> Result<(), Fault> {
    let addr = user_addr(dst, data.len())?;
    space.write(addr, data)
}

/// Read one user pointer (little endian) from `src`.
pub fn copy_in_ptr(space: &dyn AddressSpace, src: u64) -> Result<u64, Fault> {
    let mut raw = [0u8; POINTER_SIZE as usize];
    copy_in(space, src, &mut raw)?;
    Ok(u64::from_le_bytes(raw))
}

/// Copy a NUL-terminated string in from `src`, without its terminator.
///
/// The bytes come back exactly as user memory holds them; no encoding is
/// assumed. `max` bounds the string including its terminator. The string is
/// read byte by byte so a short string near the end of a mapping does not
/// fault.
pub fn copy_in_str(space: &dyn AddressSpace, src: u64, max: usize) -> Result<Vec<u8>, CopyStrError> {
    user_addr(src, 1)?;
    let mut bytes = Vec::new();
    for offset in 0..max as u64 {
        let mut byte = [0u8; 1];
        copy_in(space, src + offset, &mut byte)?;
        if byte[0] == 0 {
            return Ok(bytes);
        }
        bytes.push(byte[0]);
    }
    Err(CopyStrError::TooLong)
}
