//! The EHABI unwind instruction interpreter.
//!
//! Instructions are a byte stream operating on a virtual stack pointer
//! (`vsp`) that starts out as the current sp:
//!
//! ```text
//! 00xxxxxx            vsp = vsp + (xxxxxx << 2) + 4
//! 01xxxxxx            vsp = vsp - (xxxxxx << 2) - 4
//! 10000000 00000000   refuse to unwind
//! 1000iiii iiiiiiii   pop up to 12 integer registers under mask {r15-r12}, {r11-r4}
//! 1001nnnn            vsp = r[nnnn] (nnnn != 13, 15)
//! 10100nnn            pop r4-r[4+nnn]
//! 10101nnn            pop r4-r[4+nnn], r14
//! 10110000            finish
//! 10110001 0000iiii   pop integer registers under mask {r3, r2, r1, r0}
//! 10110010 uleb128    vsp = vsp + 0x204 + (uleb128 << 2)
//! 10110011 sssscccc   pop VFP double-precision registers d[ssss]-d[ssss+cccc] (FSTMFDX)
//! 101101nn            spare
//! 10111nnn            pop VFP double-precision registers d8-d[8+nnn] (FSTMFDX)
//! 11000nnn            pop wireless MMX registers wR10-wR[10+nnn] (nnn != 6, 7)
//! 11000110 sssscccc   pop wireless MMX registers wR[ssss]-wR[ssss+cccc]
//! 11000111 0000iiii   pop wireless MMX integer registers under mask {wCGR3-wCGR0}
//! 11001000 sssscccc   pop VFP double precision registers d[16+ssss]-d[16+ssss+cccc] (VPUSH)
//! 11001001 sssscccc   pop VFP double precision registers d[ssss]-d[ssss+cccc] (VPUSH)
//! 11010nnn            pop VFP double-precision registers d8-d[8+nnn] (VPUSH)
//! everything else     spare
//! ```
//!
//! Floating point and MMX registers are not tracked, popping them only moves
//! `vsp`.

#[cfg(test)]
mod tests;

use std::collections::VecDeque;

use crate::{
    memory::Memory,
    regs::{Regs, ARM_REG_LR, ARM_REG_PC, ARM_REG_R4, ARM_REG_SP},
    Error, Result,
};

const EXIDX_CANTUNWIND: u32 = 1;
const OP_FINISH: u8 = 0xb0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    Finished,
}

/// Executes the unwind instructions of one table entry against a register
/// set.
pub struct ArmExidx<'a> {
    pc: u64,
    regs: &'a mut Regs,
    elf_memory: &'a dyn Memory,
    process_memory: &'a dyn Memory,
    data: VecDeque<u8>,
    cfa: u32,
    pc_set: bool,
}

impl<'a> ArmExidx<'a> {
    /// `pc` is only used to report errors. The virtual stack pointer starts
    /// at the current sp of `regs`.
    pub fn new(
        pc: u64,
        regs: &'a mut Regs,
        elf_memory: &'a dyn Memory,
        process_memory: &'a dyn Memory,
    ) -> Self {
        let cfa = regs.sp() as u32;
        Self {
            pc,
            regs,
            elf_memory,
            process_memory,
            data: VecDeque::new(),
            cfa,
            pc_set: false,
        }
    }

    pub fn cfa(&self) -> u32 {
        self.cfa
    }

    /// The unwind instruction bytes extracted so far.
    pub fn data(&self) -> &VecDeque<u8> {
        &self.data
    }

    /// The caller's pc and sp after [`eval`](Self::eval): the popped pc if
    /// there was one, otherwise the link register.
    pub fn caller_pc_sp(&self) -> (u64, u64) {
        let reg = if self.pc_set { ARM_REG_PC } else { ARM_REG_LR };
        (self.regs.get(reg).unwrap_or_default(), u64::from(self.cfa))
    }

    /// Collects the unwind instructions of the entry at `entry_offset`, from
    /// the entry itself or from `.ARM.extab`.
    pub fn extract_entry_data(&mut self, entry_offset: u64) -> Result<()> {
        self.data.clear();
        if entry_offset & 1 != 0 {
            return Err(Error::malformed(format!(
                "exidx entry offset {entry_offset:#x} is not aligned"
            )));
        }

        let data = self.elf_memory.read_u32(entry_offset + 4)?;
        if data == EXIDX_CANTUNWIND {
            debug!("entry at {entry_offset:#x} is EXIDX_CANTUNWIND");
            return Err(Error::NoUnwindInfo { pc: self.pc });
        }

        if data & (1 << 31) != 0 {
            // compact model inlined into the entry
            let personality = (data >> 24) & 0xf;
            if personality != 0 {
                return Err(Error::malformed(format!(
                    "inline exidx entry with personality {personality}"
                )));
            }
            self.data.extend(&data.to_be_bytes()[1..]);
            self.push_implicit_finish();
            return Ok(());
        }

        let mut addr = u64::from(super::prel31_addr((entry_offset + 4) as u32, data));
        let data = self.elf_memory.read_u32(addr)?;

        let table_words;
        if data & (1 << 31) != 0 {
            let personality = (data >> 24) & 0xf;
            match personality {
                0 => {
                    table_words = 0;
                    self.data.push_back((data >> 16) as u8);
                }
                1 | 2 => {
                    table_words = (data >> 16) & 0xff;
                    addr += 4;
                }
                _ => {
                    return Err(Error::malformed(format!(
                        "extab entry with personality {personality}"
                    )))
                }
            }
            self.data.push_back((data >> 8) as u8);
            self.data.push_back(data as u8);
        } else {
            // generic model, skip the personality routine
            addr += 4;
            let data = self.elf_memory.read_u32(addr)?;
            table_words = data >> 24;
            self.data.extend(&data.to_be_bytes()[1..]);
            addr += 4;
        }

        if table_words > 5 {
            return Err(Error::malformed(format!(
                "extab entry with {table_words} additional words"
            )));
        }
        for _ in 0..table_words {
            let data = self.elf_memory.read_u32(addr)?;
            self.data.extend(&data.to_be_bytes());
            addr += 4;
        }

        self.push_implicit_finish();
        trace!("unwind instructions {:x?}", self.data);
        Ok(())
    }

    fn push_implicit_finish(&mut self) {
        if self.data.back() != Some(&OP_FINISH) {
            self.data.push_back(OP_FINISH);
        }
    }

    /// Runs instructions until a finish.
    pub fn eval(&mut self) -> Result<()> {
        while self.decode()? == Status::Running {}
        Ok(())
    }

    fn next_byte(&mut self) -> Result<u8> {
        self.data
            .pop_front()
            .ok_or_else(|| Error::malformed("unwind instructions end in the middle of an opcode"))
    }

    fn spare(&self, byte: u8) -> Error {
        Error::malformed(format!("spare exidx opcode {byte:#04x}"))
    }

    fn pop_reg(&mut self, reg: u16) -> Result<()> {
        let value = self.process_memory.read_u32(u64::from(self.cfa))?;
        self.regs.set(reg, u64::from(value));
        self.cfa = self.cfa.wrapping_add(4);
        Ok(())
    }

    fn decode(&mut self) -> Result<Status> {
        let Some(byte) = self.data.pop_front() else {
            return Ok(Status::Finished);
        };

        match byte >> 6 {
            0b00 => {
                let add = (u32::from(byte & 0x3f) << 2) + 4;
                trace!("{byte:#04x} vsp = vsp + {add}");
                self.cfa = self.cfa.wrapping_add(add);
                Ok(Status::Running)
            }
            0b01 => {
                let sub = (u32::from(byte & 0x3f) << 2) + 4;
                trace!("{byte:#04x} vsp = vsp - {sub}");
                self.cfa = self.cfa.wrapping_sub(sub);
                Ok(Status::Running)
            }
            0b10 => self.decode_prefix_10(byte),
            _ => self.decode_prefix_11(byte),
        }
    }

    fn decode_prefix_10(&mut self, byte: u8) -> Result<Status> {
        match byte >> 4 {
            0x8 => {
                let byte2 = self.next_byte()?;
                let mask = (u16::from(byte & 0xf) << 8) | u16::from(byte2);
                if mask == 0 {
                    debug!("{byte:#04x} {byte2:#04x} refuse to unwind");
                    return Err(Error::NoUnwindInfo { pc: self.pc });
                }
                trace!("{byte:#04x} {byte2:#04x} pop mask {mask:#x}");
                for bit in 0..12 {
                    if mask & (1 << bit) != 0 {
                        self.pop_reg(ARM_REG_R4 + bit)?;
                    }
                }
                if mask & (1 << (ARM_REG_SP - ARM_REG_R4)) != 0 {
                    self.cfa = self.regs.get(ARM_REG_SP).unwrap_or_default() as u32;
                }
                if mask & (1 << (ARM_REG_PC - ARM_REG_R4)) != 0 {
                    self.pc_set = true;
                }
                Ok(Status::Running)
            }
            0x9 => {
                let reg = u16::from(byte & 0xf);
                if reg == ARM_REG_SP || reg == ARM_REG_PC {
                    return Err(Error::malformed(format!("reserved exidx opcode {byte:#04x}")));
                }
                trace!("{byte:#04x} vsp = r{reg}");
                self.cfa = self.regs.get(reg).unwrap_or_default() as u32;
                Ok(Status::Running)
            }
            0xa => {
                let last = ARM_REG_R4 + u16::from(byte & 0x7);
                let with_lr = byte & 0x8 != 0;
                trace!("{byte:#04x} pop r4-r{last}{}", if with_lr { ", r14" } else { "" });
                for reg in ARM_REG_R4..=last {
                    self.pop_reg(reg)?;
                }
                if with_lr {
                    self.pop_reg(ARM_REG_LR)?;
                }
                Ok(Status::Running)
            }
            _ => self.decode_prefix_10_11(byte),
        }
    }

    fn decode_prefix_10_11(&mut self, byte: u8) -> Result<Status> {
        match byte {
            OP_FINISH => {
                trace!("{byte:#04x} finish");
                Ok(Status::Finished)
            }
            0xb1 => {
                let byte2 = self.next_byte()?;
                if byte2 == 0 || byte2 & 0xf0 != 0 {
                    return Err(self.spare(byte));
                }
                trace!("{byte:#04x} {byte2:#04x} pop r0-r3 mask {byte2:#x}");
                for reg in 0..4 {
                    if byte2 & (1 << reg) != 0 {
                        self.pop_reg(reg)?;
                    }
                }
                Ok(Status::Running)
            }
            0xb2 => {
                let mut value: u32 = 0;
                let mut shift = 0;
                loop {
                    let byte = self.next_byte()?;
                    if shift < 32 {
                        value |= u32::from(byte & 0x7f) << shift;
                    }
                    shift += 7;
                    if byte & 0x80 == 0 {
                        break;
                    }
                }
                let add = 0x204u32.wrapping_add(value << 2);
                trace!("{byte:#04x} vsp = vsp + {add}");
                self.cfa = self.cfa.wrapping_add(add);
                Ok(Status::Running)
            }
            0xb3 => {
                let byte2 = self.next_byte()?;
                let add = u32::from(byte2 & 0xf) * 8 + 12;
                trace!("{byte:#04x} {byte2:#04x} pop vfp (fstmfdx), vsp = vsp + {add}");
                self.cfa = self.cfa.wrapping_add(add);
                Ok(Status::Running)
            }
            0xb8..=0xbf => {
                let add = u32::from(byte & 0x7) * 8 + 12;
                trace!("{byte:#04x} pop vfp d8 (fstmfdx), vsp = vsp + {add}");
                self.cfa = self.cfa.wrapping_add(add);
                Ok(Status::Running)
            }
            _ => Err(self.spare(byte)),
        }
    }

    fn decode_prefix_11(&mut self, byte: u8) -> Result<Status> {
        match byte {
            0xc0..=0xc5 => {
                let add = u32::from(byte & 0x7) * 8 + 8;
                trace!("{byte:#04x} pop wR10, vsp = vsp + {add}");
                self.cfa = self.cfa.wrapping_add(add);
            }
            0xc6 | 0xc8 | 0xc9 => {
                let byte2 = self.next_byte()?;
                let add = u32::from(byte2 & 0xf) * 8 + 8;
                trace!("{byte:#04x} {byte2:#04x} vsp = vsp + {add}");
                self.cfa = self.cfa.wrapping_add(add);
            }
            0xc7 => {
                let byte2 = self.next_byte()?;
                if byte2 == 0 || byte2 & 0xf0 != 0 {
                    return Err(self.spare(byte));
                }
                let add = byte2.count_ones() * 4;
                trace!("{byte:#04x} {byte2:#04x} pop wCGR, vsp = vsp + {add}");
                self.cfa = self.cfa.wrapping_add(add);
            }
            0xd0..=0xd7 => {
                let add = u32::from(byte & 0x7) * 8 + 8;
                trace!("{byte:#04x} pop vfp d8 (vpush), vsp = vsp + {add}");
                self.cfa = self.cfa.wrapping_add(add);
            }
            _ => return Err(self.spare(byte)),
        }
        Ok(Status::Running)
    }
}
