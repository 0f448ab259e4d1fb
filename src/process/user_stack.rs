// Initial user stack for a freshly loaded program
use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::config::{POINTER_SIZE, STACK_ALIGN};
use crate::services::memory_service::{copy_out, user_addr, AddressSpace, Fault};

/// Where `main(argc, argv)` finds its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStack {
    /// Initial stack pointer, 16-byte aligned.
    pub sp: VirtAddr,
    /// Address of `argv[0]`.
    pub argv: VirtAddr,
    pub argc: usize,
}

/// Lay out `args` below `top`, each followed by a NUL.
///
/// ```text
///  top -> | "argv[0]\0" | "argv[1]\0" | ... | pad | argv[0] | argv[1] | ... | NULL |  <- argv
///         (strings pushed first, highest)          (pointer array, 8-byte aligned)
///  sp  =  argv rounded down to 16
/// ```
pub fn build(space: &mut dyn AddressSpace, top: VirtAddr, args: &[Vec<u8>]) -> Result<UserStack, Fault> {
    let mut sp = top.as_u64();
    let mut pointers: Vec<u64> = Vec::with_capacity(args.len() + 1);

    for arg in args {
        let len = arg.len() as u64 + 1;
        sp = sp.checked_sub(len).ok_or(Fault { addr: sp })?;
        copy_out(space, sp, arg)?;
        copy_out(space, sp + arg.len() as u64, &[0])?;
        pointers.push(sp);
    }
    pointers.push(0);

    sp = user_addr(sp, 0)?.align_down(POINTER_SIZE).as_u64();
    let array_len = pointers.len() as u64 * POINTER_SIZE;
    sp = sp.checked_sub(array_len).ok_or(Fault { addr: sp })?;
    let argv = sp;
    for (i, ptr) in pointers.iter().enumerate() {
        copy_out(space, argv + i as u64 * POINTER_SIZE, &ptr.to_le_bytes())?;
    }

    let sp = user_addr(argv, 0)?.align_down(STACK_ALIGN);
    Ok(UserStack {
        sp,
        argv: VirtAddr::new(argv),
        argc: args.len(),
    })
}
