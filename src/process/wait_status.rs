// Encoded status word stored by waitpid
//
// The low two bits carry how the process ended; the exit code sits above
// them. Only normal exit exists here (no signals).

const WAIT_SHIFT: u32 = 2;
const WAIT_MASK: i32 = 0b11;

/// How-ended tag for a normal `exit`.
pub const WAIT_EXITED: i32 = 0;

/// Smallest and largest exit codes that survive encoding. Codes outside
/// `[EXIT_CODE_MIN, EXIT_CODE_MAX]` lose their top two bits.
pub const EXIT_CODE_MIN: i32 = -(1 << 29);
pub const EXIT_CODE_MAX: i32 = (1 << 29) - 1;

/// Status word for a process that called `exit(code)`.
///
/// Exact only for codes in `[EXIT_CODE_MIN, EXIT_CODE_MAX]`, as with the
/// classic `_MKWAIT_EXIT`.
pub const fn make_exit(code: i32) -> i32 {
    (code << WAIT_SHIFT) | WAIT_EXITED
}

/// Whether `status` describes a normal exit.
pub const fn exited(status: i32) -> bool {
    status & WAIT_MASK == WAIT_EXITED
}

/// Exit code carried in `status`.
pub const fn exit_code_of(status: i32) -> i32 {
    status >> WAIT_SHIFT
}
