//! Architecture-tagged register sets.
//!
//! Register numbers are DWARF register numbers for every architecture, so the
//! CFI evaluator can index a set directly with the columns it decodes.

#[cfg(test)]
mod tests;

use core::fmt;

use crate::{memory::Memory, Result};

pub const ARM_REG_R4: u16 = 4;
pub const ARM_REG_SP: u16 = 13;
pub const ARM_REG_LR: u16 = 14;
pub const ARM_REG_PC: u16 = 15;

pub const ARM64_REG_LR: u16 = 30;
pub const ARM64_REG_SP: u16 = 31;
pub const ARM64_REG_PC: u16 = 32;

pub const X86_REG_EBP: u16 = 5;
pub const X86_REG_SP: u16 = 4;
pub const X86_REG_PC: u16 = 8;

pub const X86_64_REG_RBP: u16 = 6;
pub const X86_64_REG_SP: u16 = 7;
pub const X86_64_REG_PC: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchKind {
    Arm,
    Arm64,
    X86,
    X86_64,
}

impl ArchKind {
    pub fn total_regs(self) -> usize {
        match self {
            ArchKind::Arm => 16,
            ArchKind::Arm64 => 33,
            ArchKind::X86 => 9,
            ArchKind::X86_64 => 17,
        }
    }

    pub fn sp_reg(self) -> u16 {
        match self {
            ArchKind::Arm => ARM_REG_SP,
            ArchKind::Arm64 => ARM64_REG_SP,
            ArchKind::X86 => X86_REG_SP,
            ArchKind::X86_64 => X86_64_REG_SP,
        }
    }

    pub fn pc_reg(self) -> u16 {
        match self {
            ArchKind::Arm => ARM_REG_PC,
            ArchKind::Arm64 => ARM64_REG_PC,
            ArchKind::X86 => X86_REG_PC,
            ArchKind::X86_64 => X86_64_REG_PC,
        }
    }

    /// The column that holds the return address in compiler-generated CFI.
    pub fn return_address_reg(self) -> u16 {
        match self {
            ArchKind::Arm => ARM_REG_LR,
            ArchKind::Arm64 => ARM64_REG_LR,
            ArchKind::X86 => X86_REG_PC,
            ArchKind::X86_64 => X86_64_REG_PC,
        }
    }

    pub fn is_32bit(self) -> bool {
        matches!(self, ArchKind::Arm | ArchKind::X86)
    }

    /// Size of a machine word in bytes.
    pub fn address_size(self) -> u8 {
        if self.is_32bit() {
            4
        } else {
            8
        }
    }
}

impl fmt::Display for ArchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchKind::Arm => "arm",
            ArchKind::Arm64 => "arm64",
            ArchKind::X86 => "x86",
            ArchKind::X86_64 => "x86_64",
        })
    }
}

/// A machine word that a register set can be made of.
pub trait AddressWord: Copy + Default + Eq + fmt::Debug + fmt::LowerHex + Into<u64> {
    /// Keeps the low bits of `value` that fit into the word.
    fn truncate(value: u64) -> Self;
}

impl AddressWord for u32 {
    fn truncate(value: u64) -> Self {
        value as u32
    }
}

impl AddressWord for u64 {
    fn truncate(value: u64) -> Self {
        value
    }
}

/// Register storage for one word width.
///
/// `pc` and `sp` are the logical values the unwinder reasons about. They are
/// kept next to the architectural slots in `regs` and only diverge while a
/// step is in progress.
#[derive(Clone, PartialEq, Eq)]
pub struct RegsImpl<W: AddressWord> {
    arch: ArchKind,
    regs: Box<[W]>,
    pc: W,
    sp: W,
}

impl<W: AddressWord> RegsImpl<W> {
    fn new(arch: ArchKind) -> Self {
        Self {
            arch,
            regs: vec![W::default(); arch.total_regs()].into_boxed_slice(),
            pc: W::default(),
            sp: W::default(),
        }
    }

    pub fn get(&self, reg: u16) -> Option<W> {
        self.regs.get(usize::from(reg)).copied()
    }

    pub fn set(&mut self, reg: u16, value: W) -> bool {
        match self.regs.get_mut(usize::from(reg)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

impl<W: AddressWord> fmt::Debug for RegsImpl<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Regs")
            .field("arch", &self.arch)
            .field("pc", &format_args!("{:#x}", self.pc))
            .field("sp", &format_args!("{:#x}", self.sp))
            .field("regs", &format_args!("{:x?}", self.regs))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Regs {
    W32(RegsImpl<u32>),
    W64(RegsImpl<u64>),
}

macro_rules! with_regs {
    ($regs:expr, $inner:ident => $body:expr) => {
        match $regs {
            Regs::W32($inner) => $body,
            Regs::W64($inner) => $body,
        }
    };
}

impl Regs {
    pub fn new(arch: ArchKind) -> Self {
        if arch.is_32bit() {
            Regs::W32(RegsImpl::new(arch))
        } else {
            Regs::W64(RegsImpl::new(arch))
        }
    }

    /// Builds a register set from raw register values in DWARF order. The
    /// logical pc and sp are taken from their architectural slots.
    pub fn from_raw(arch: ArchKind, values: &[u64]) -> Self {
        let mut regs = Self::new(arch);
        for (reg, &value) in (0..).zip(values.iter().take(arch.total_regs())) {
            regs.set(reg, value);
        }
        let pc = regs.get(arch.pc_reg()).unwrap_or_default();
        let sp = regs.get(arch.sp_reg()).unwrap_or_default();
        regs.set_pc(pc);
        regs.set_sp(sp);
        regs
    }

    pub fn arch(&self) -> ArchKind {
        with_regs!(self, r => r.arch)
    }

    pub fn is_32bit(&self) -> bool {
        matches!(self, Regs::W32(_))
    }

    pub fn total_regs(&self) -> usize {
        self.arch().total_regs()
    }

    pub fn sp_reg(&self) -> u16 {
        self.arch().sp_reg()
    }

    pub fn pc_reg(&self) -> u16 {
        self.arch().pc_reg()
    }

    pub fn return_address_reg(&self) -> u16 {
        self.arch().return_address_reg()
    }

    pub fn pc(&self) -> u64 {
        with_regs!(self, r => r.pc.into())
    }

    pub fn sp(&self) -> u64 {
        with_regs!(self, r => r.sp.into())
    }

    /// Sets the logical pc and its architectural slot.
    pub fn set_pc(&mut self, pc: u64) {
        with_regs!(self, r => {
            r.pc = AddressWord::truncate(pc);
            let reg = r.arch.pc_reg();
            r.set(reg, AddressWord::truncate(pc));
        })
    }

    /// Sets the logical sp and its architectural slot.
    pub fn set_sp(&mut self, sp: u64) {
        with_regs!(self, r => {
            r.sp = AddressWord::truncate(sp);
            let reg = r.arch.sp_reg();
            r.set(reg, AddressWord::truncate(sp));
        })
    }

    /// Value of an architectural register slot.
    pub fn get(&self, reg: u16) -> Option<u64> {
        with_regs!(self, r => r.get(reg).map(Into::into))
    }

    /// Writes an architectural register slot, truncating to the word width.
    /// Returns false if the register does not exist.
    pub fn set(&mut self, reg: u16, value: u64) -> bool {
        with_regs!(self, r => r.set(reg, AddressWord::truncate(value)))
    }

    /// Reads one machine word of this set's width.
    pub fn read_word(&self, memory: &dyn Memory, addr: u64) -> Result<u64> {
        match self {
            Regs::W32(_) => memory.read_u32(addr).map(u64::from),
            Regs::W64(_) => memory.read_u64(addr),
        }
    }

    /// How far a return address has to move back to land inside the call
    /// instruction that produced it. `rel_pc` is object-relative and
    /// `elf_memory` is the object the pc belongs to.
    pub fn pc_adjustment(&self, rel_pc: u64, load_bias: u64, elf_memory: &dyn Memory) -> u64 {
        match self.arch() {
            ArchKind::Arm => {
                let Some(adjusted) = rel_pc.checked_sub(load_bias) else {
                    return 0;
                };
                if adjusted < 5 {
                    return 0;
                }
                if adjusted & 1 != 0 {
                    // thumb: bl/blx are 32 bits, everything else that calls is 16
                    match elf_memory.read_u32(adjusted - 5) {
                        Ok(value) if value & 0xe000_f000 == 0xe000_f000 => 4,
                        _ => 2,
                    }
                } else {
                    4
                }
            }
            ArchKind::Arm64 => {
                if rel_pc < 4 {
                    0
                } else {
                    4
                }
            }
            ArchKind::X86 | ArchKind::X86_64 => {
                if rel_pc == 0 {
                    0
                } else {
                    1
                }
            }
        }
    }
}
