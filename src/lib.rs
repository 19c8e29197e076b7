//! Call stack unwinding for other processes and captured snapshots.
//!
//! An [`Unwinder`] walks a stack one frame at a time. It finds the map that
//! owns the pc in [`Maps`], asks the object file mapped there to recover the
//! caller's [`Regs`] from `.ARM.exidx`, `.eh_frame` or `.debug_frame`, and
//! reads everything through [`Memory`].

#[macro_use]
extern crate tracing;

mod error;

pub mod arm;
pub mod dwarf;
pub mod elf;
pub mod maps;
pub mod memory;
pub mod regs;
pub mod unwinder;

pub use elf::{Elf, ElfInfo, ElfLoader, UnwindSource};
pub use error::{Error, MapsError, Result};
pub use maps::{MapFlags, MapInfo, Maps};
pub use memory::Memory;
pub use regs::{ArchKind, Regs};
pub use unwinder::{FrameData, Outcome, Trace, UnwindConfig, UnwindState, Unwinder};
