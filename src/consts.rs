//! Target constants.

/// Width of a general-purpose register on x86_64, in bytes.
pub const REGISTER_WIDTH: u64 = 8;

/// Required stack alignment at call boundaries, in bytes.
pub const STACK_ALIGNMENT: u64 = 16;

/// Size of one System V classification eightbyte, in bytes.
pub const EIGHTBYTE: u64 = 8;

/// Offset from `rbp` of the first overflow argument in a callee's frame:
/// the saved `rbp` and the return address sit below it.
pub const FIRST_OVERFLOW_ARG: i64 = 16;
