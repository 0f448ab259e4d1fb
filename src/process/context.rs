// Saved user register state for the lifecycle core
use x86_64::VirtAddr;

/// User-mode code segment selector (GDT index 4, RPL 3).
pub const USER_CS: u64 = 0x23;
/// User-mode data/stack segment selector (GDT index 3, RPL 3).
pub const USER_DS: u64 = 0x1B;
/// RFLAGS with only the interrupt flag (and the always-one bit) set.
pub const USER_RFLAGS: u64 = 0x202;

/// Register snapshot of a user thread at the point it entered the kernel.
///
/// This is what `fork` duplicates for the child and what `execv` builds from
/// scratch for the new program image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,    // Instruction pointer
    pub rflags: u64, // CPU flags
    pub cs: u64,     // Code segment
    pub ss: u64,     // Stack segment
}

impl Default for CpuRegisters {
    fn default() -> Self {
        Self {
            rax: 0, rbx: 0, rcx: 0, rdx: 0,
            rsi: 0, rdi: 0, rbp: 0, rsp: 0,
            r8: 0, r9: 0, r10: 0, r11: 0,
            r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0, rflags: USER_RFLAGS,
            cs: USER_CS, ss: USER_DS,
        }
    }
}

impl CpuRegisters {
    /// Initial frame of a freshly loaded program: `main(argc, argv)` with the
    /// stack pointer at the prepared user stack.
    pub fn program_entry(entry: VirtAddr, stack: VirtAddr, argc: usize, argv: VirtAddr) -> Self {
        Self {
            rip: entry.as_u64(),
            rsp: stack.as_u64(),
            rdi: argc as u64,
            rsi: argv.as_u64(),
            ..Self::default()
        }
    }

    /// Copy of this frame as the forked child must see it: same place in the
    /// program, but `fork` returns 0.
    ///
    /// `syscall` has already advanced `rip` past the instruction, so it is
    /// left alone.
    pub fn fork_child(&self) -> Self {
        Self {
            rax: 0,
            ..*self
        }
    }

    /// Value handed back to user mode as the syscall result.
    pub fn return_value(&self) -> u64 {
        self.rax
    }
}
