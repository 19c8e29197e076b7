//! DWARF call frame information, from `.eh_frame` (optionally indexed by
//! `.eh_frame_hdr`) or `.debug_frame`.
//!
//! # how it works
//! every function gets a Frame Description Entry (FDE) that shares common
//! bits with others through a Common Information Entry (CIE). together they
//! hold instructions for a tiny virtual machine (yes, that is basically a
//! programming language) which produces a table like this:
//!
//! ```text
//! LOC  CFA      rbx  rbp  ra
//! 1000 rsp+8    u    u    c-8
//! 1001 rsp+16   u    c-16 c-8
//! 1004 rbp+16   u    c-16 c-8
//! ```
//!
//! to unwind a frame we find the FDE covering the pc, run its instructions up
//! to the pc to get the row, compute the CFA (the stack pointer of the caller
//! right before the call) and recover the caller's registers from it.
//!
//! See <https://dwarfstd.org/doc/DWARF5.pdf> §6.4 for more information if more
//! information is desired.

mod cfa;
mod eh_frame_hdr;
mod expr;
mod parse;
mod section;

pub use cfa::{CfaRule, Instruction, LocationRules, RegisterRule};
pub use expr::Expr;
pub use parse::{Cie, Encoding, Fde, SectionKind};
pub use section::{eval, DwarfSection, SectionRange};

#[cfg(test)]
pub(crate) use section::tests::{CfiBuilder, X86_64_CIE};
