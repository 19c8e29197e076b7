//! The call frame instruction virtual machine.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4.2 Call Frame Instructions
//!
//! Running the CIE's initial instructions and then the FDE's instructions up
//! to a pc yields the row of the CFI table for that pc, see [`LocationRules`].
#![allow(non_upper_case_globals)]


use std::collections::BTreeMap;

use super::{
    expr::Expr,
    parse::{Cie, Cursor, Fde},
};
use crate::{memory::Memory, Error, Result};

/// How to recover one register of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterRule {
    /// A register that has this rule has no recoverable value in the previous
    /// frame. (By convention, it is not preserved by a callee.)
    Undefined,
    /// This register has not been modified from the previous frame.
    SameValue,
    /// The previous value of this register is saved at the address CFA+N.
    Offset(i64),
    /// The previous value of this register is the value CFA+N.
    ValOffset(i64),
    /// The previous value of this register is stored in another register,
    /// plus an offset.
    Register { reg: u16, offset: i64 },
    /// The previous value of this register is located at the address produced
    /// by executing the expression.
    Expression(Expr),
    /// The previous value of this register is the value produced by executing
    /// the expression.
    ValExpression(Expr),
}

/// How to compute the canonical frame address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CfaRule {
    /// No instruction defined the CFA yet.
    #[default]
    Undefined,
    RegisterOffset { register: u16, offset: i64 },
    Expression(Expr),
}

/// One row of the CFI table.
///
/// Registers without an entry keep their value ("same value").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocationRules {
    pub cfa: CfaRule,
    pub registers: BTreeMap<u16, RegisterRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    //-------- 6.4.2.1 Row Creation Instructions
    //
    /// Creates a new row at the given address. The operand is encoded with
    /// the FDE address encoding of the CIE.
    SetLoc(u64),
    /// Creates a new row at the current location plus
    /// delta * code_alignment_factor. The delta is encoded with the opcode.
    AdvanceLoc(u8),
    /// Like [`AdvanceLoc`](Self::AdvanceLoc) with a ubyte delta.
    AdvanceLoc1(u8),
    /// Like [`AdvanceLoc`](Self::AdvanceLoc) with a uhalf delta.
    AdvanceLoc2(u16),
    /// Like [`AdvanceLoc`](Self::AdvanceLoc) with a uword delta.
    AdvanceLoc4(u32),
    //
    //-------- 6.4.2.2 CFA Definition Instructions
    //
    /// Defines the CFA as register + (non-factored) offset.
    DefCfa { register_number: u64, offset: u64 },
    /// Like [`DefCfa`](Self::DefCfa), but the offset is signed and factored
    /// by the data_alignment_factor.
    DefCfaSf {
        register_number: u64,
        factored_offset: i64,
    },
    /// Changes the CFA register, keeping the old offset. Only valid if the
    /// CFA is register + offset.
    DefCfaRegister(u64),
    /// Changes the CFA offset, keeping the old register. Only valid if the
    /// CFA is register + offset.
    DefCfaOffset(u64),
    /// Like [`DefCfaOffset`](Self::DefCfaOffset), but signed and factored.
    DefCfaOffsetSf(i64),
    /// The CFA is computed by an expression.
    DefCfaExpression(Expr),
    //
    //-------- 6.4.2.3 Register Rule Instructions
    //
    Undefined(u64),
    SameValue(u64),
    /// The register is saved at CFA + factored_offset * data_alignment_factor.
    /// The register number is encoded with the opcode.
    Offset {
        register_number: u64,
        factored_offset: u64,
    },
    /// Like [`Offset`](Self::Offset) with a LEB128 register number.
    OffsetExtended {
        register_number: u64,
        factored_offset: u64,
    },
    /// Like [`OffsetExtended`](Self::OffsetExtended) with a signed offset.
    OffsetExtendedSf {
        register_number: u64,
        factored_offset: i64,
    },
    /// The register's value is CFA + factored_offset * data_alignment_factor.
    ValOffset {
        register_number: u64,
        factored_offset: u64,
    },
    ValOffsetSf {
        register_number: u64,
        factored_offset: i64,
    },
    /// The register's value is in `from_register`.
    Register {
        target_register: u64,
        from_register: u64,
    },
    /// The register is saved at the address the expression computes. The CFA
    /// is pushed before the expression runs.
    Expression { register: u64, expr: Expr },
    /// The register's value is what the expression computes. The CFA is
    /// pushed before the expression runs.
    ValExpression { register: u64, expr: Expr },
    /// Resets a register to the rule the CIE's initial instructions gave it.
    /// The register number is encoded with the opcode.
    Restore(u64),
    RestoreExtended(u64),
    //
    //-------- 6.4.2.4 Row State Instructions
    //
    /// Pushes the set of rules for every register onto an implicit stack.
    RememberState,
    /// Pops the set of rules off the implicit stack into the current row.
    RestoreState,
    //
    //-------- 6.4.2.5 Padding Instruction
    //
    Nop,
    //
    //-------- GNU extensions
    //
    /// The size of the arguments pushed on the stack. Only needed for
    /// landing pads, unwinding ignores it.
    GnuArgsSize(u64),
    /// Obsolete. The register is saved at CFA - offset, unfactored.
    GnuNegativeOffsetExtended { register_number: u64, offset: u64 },
}

const DW_CFA_advance_loc_hi: u8 = 0x01;
const DW_CFA_offset_hi: u8 = 0x02;
const DW_CFA_restore_hi: u8 = 0x03;

const DW_CFA_nop: u8 = 0;
const DW_CFA_set_loc: u8 = 0x01;
const DW_CFA_advance_loc1: u8 = 0x02;
const DW_CFA_advance_loc2: u8 = 0x03;
const DW_CFA_advance_loc4: u8 = 0x04;
const DW_CFA_offset_extended: u8 = 0x05;
const DW_CFA_restore_extended: u8 = 0x06;
const DW_CFA_undefined: u8 = 0x07;
const DW_CFA_same_value: u8 = 0x08;
const DW_CFA_register: u8 = 0x09;
const DW_CFA_remember_state: u8 = 0x0a;
const DW_CFA_restore_state: u8 = 0x0b;
const DW_CFA_def_cfa: u8 = 0x0c;
const DW_CFA_def_cfa_register: u8 = 0x0d;
const DW_CFA_def_cfa_offset: u8 = 0x0e;
const DW_CFA_def_cfa_expression: u8 = 0x0f;
const DW_CFA_expression: u8 = 0x10;
const DW_CFA_offset_extended_sf: u8 = 0x11;
const DW_CFA_def_cfa_sf: u8 = 0x12;
const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
const DW_CFA_val_offset: u8 = 0x14;
const DW_CFA_val_offset_sf: u8 = 0x15;
const DW_CFA_val_expression: u8 = 0x16;
const DW_CFA_GNU_args_size: u8 = 0x2e;
const DW_CFA_GNU_negative_offset_extended: u8 = 0x2f;

/// Decodes a call frame instruction stream.
pub(crate) struct InstrIter<'a> {
    cursor: Cursor<'a>,
    cie: &'a Cie,
    failed: bool,
}

impl<'a> InstrIter<'a> {
    /// `cursor` covers exactly the instructions.
    pub(crate) fn new(cursor: Cursor<'a>, cie: &'a Cie) -> Self {
        Self {
            cursor,
            cie,
            failed: false,
        }
    }

    fn uleb128(&mut self) -> Result<u64> {
        self.cursor.read_uleb128()
    }

    fn ileb128(&mut self) -> Result<i64> {
        self.cursor.read_ileb128()
    }

    fn expr(&mut self) -> Result<Expr> {
        let len = self.uleb128()?;
        Ok(Expr::new(self.cursor.read_bytes(len)?))
    }

    fn decode(&mut self) -> Result<Instruction> {
        let b = self.cursor.read_u8()?;
        let low_6 = b & (u8::MAX >> 2);
        Ok(match b >> 6 {
            DW_CFA_advance_loc_hi => Instruction::AdvanceLoc(low_6),
            DW_CFA_offset_hi => Instruction::Offset {
                register_number: u64::from(low_6),
                factored_offset: self.uleb128()?,
            },
            DW_CFA_restore_hi => Instruction::Restore(u64::from(low_6)),
            _ => match b {
                DW_CFA_nop => Instruction::Nop,
                DW_CFA_set_loc => {
                    let encoding = self.cie.fde_address_encoding;
                    Instruction::SetLoc(self.cursor.read_encoded(encoding, None)?)
                }
                DW_CFA_advance_loc1 => Instruction::AdvanceLoc1(self.cursor.read_u8()?),
                DW_CFA_advance_loc2 => Instruction::AdvanceLoc2(self.cursor.read_u16()?),
                DW_CFA_advance_loc4 => Instruction::AdvanceLoc4(self.cursor.read_u32()?),
                DW_CFA_offset_extended => Instruction::OffsetExtended {
                    register_number: self.uleb128()?,
                    factored_offset: self.uleb128()?,
                },
                DW_CFA_restore_extended => Instruction::RestoreExtended(self.uleb128()?),
                DW_CFA_undefined => Instruction::Undefined(self.uleb128()?),
                DW_CFA_same_value => Instruction::SameValue(self.uleb128()?),
                DW_CFA_register => Instruction::Register {
                    target_register: self.uleb128()?,
                    from_register: self.uleb128()?,
                },
                DW_CFA_remember_state => Instruction::RememberState,
                DW_CFA_restore_state => Instruction::RestoreState,
                DW_CFA_def_cfa => Instruction::DefCfa {
                    register_number: self.uleb128()?,
                    offset: self.uleb128()?,
                },
                DW_CFA_def_cfa_register => Instruction::DefCfaRegister(self.uleb128()?),
                DW_CFA_def_cfa_offset => Instruction::DefCfaOffset(self.uleb128()?),
                DW_CFA_def_cfa_expression => Instruction::DefCfaExpression(self.expr()?),
                DW_CFA_expression => Instruction::Expression {
                    register: self.uleb128()?,
                    expr: self.expr()?,
                },
                DW_CFA_offset_extended_sf => Instruction::OffsetExtendedSf {
                    register_number: self.uleb128()?,
                    factored_offset: self.ileb128()?,
                },
                DW_CFA_def_cfa_sf => Instruction::DefCfaSf {
                    register_number: self.uleb128()?,
                    factored_offset: self.ileb128()?,
                },
                DW_CFA_def_cfa_offset_sf => Instruction::DefCfaOffsetSf(self.ileb128()?),
                DW_CFA_val_offset => Instruction::ValOffset {
                    register_number: self.uleb128()?,
                    factored_offset: self.uleb128()?,
                },
                DW_CFA_val_offset_sf => Instruction::ValOffsetSf {
                    register_number: self.uleb128()?,
                    factored_offset: self.ileb128()?,
                },
                DW_CFA_val_expression => Instruction::ValExpression {
                    register: self.uleb128()?,
                    expr: self.expr()?,
                },
                DW_CFA_GNU_args_size => Instruction::GnuArgsSize(self.uleb128()?),
                DW_CFA_GNU_negative_offset_extended => Instruction::GnuNegativeOffsetExtended {
                    register_number: self.uleb128()?,
                    offset: self.uleb128()?,
                },
                _ => {
                    return Err(Error::malformed(format!(
                        "unknown call frame instruction {b:#04x} at {:#x}",
                        self.cursor.pos() - 1
                    )))
                }
            },
        })
    }
}

impl Iterator for InstrIter<'_> {
    type Item = Result<Instruction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor.is_empty() {
            return None;
        }
        let instruction = self.decode();
        self.failed = instruction.is_err();
        Some(instruction)
    }
}

fn reg_num(reg: u64) -> Result<u16> {
    u16::try_from(reg).map_err(|_| Error::malformed(format!("register number {reg} is too large")))
}

/// Builds the row of the CFI table that covers a pc.
struct CfaVm<'a> {
    cie: &'a Cie,
    loc: u64,
    rules: LocationRules,
    /// The rules after the CIE's initial instructions, for `restore`.
    initial: Option<LocationRules>,
    stack: Vec<LocationRules>,
}

/// Whether to keep executing instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    PastPc,
}

impl<'a> CfaVm<'a> {
    fn new(cie: &'a Cie, loc: u64) -> Self {
        Self {
            cie,
            loc,
            rules: LocationRules::default(),
            initial: None,
            stack: Vec::new(),
        }
    }

    fn run(&mut self, instructions: InstrIter<'_>, pc: u64) -> Result<()> {
        for instruction in instructions {
            let instruction = instruction?;
            trace!(loc = ?self.loc, "{instruction:?}");
            if self.execute(instruction, pc)? == Flow::PastPc {
                break;
            }
        }
        Ok(())
    }

    fn advance(&mut self, delta: u64, pc: u64) -> Flow {
        self.set_loc(
            self.loc
                .wrapping_add(delta.wrapping_mul(self.cie.code_alignment_factor)),
            pc,
        )
    }

    fn set_loc(&mut self, loc: u64, pc: u64) -> Flow {
        self.loc = loc;
        if loc > pc {
            Flow::PastPc
        } else {
            Flow::Continue
        }
    }

    fn factored(&self, offset: i64) -> i64 {
        offset.wrapping_mul(self.cie.data_alignment_factor)
    }

    fn set_rule(&mut self, reg: u64, rule: RegisterRule) -> Result<()> {
        self.rules.registers.insert(reg_num(reg)?, rule);
        Ok(())
    }

    fn restore(&mut self, reg: u64) -> Result<()> {
        let reg = reg_num(reg)?;
        let initial = self
            .initial
            .as_ref()
            .ok_or_else(|| Error::malformed("restore in the initial instructions of a CIE"))?;
        match initial.registers.get(&reg) {
            Some(rule) => {
                let rule = rule.clone();
                self.rules.registers.insert(reg, rule);
            }
            None => {
                self.rules.registers.remove(&reg);
            }
        }
        Ok(())
    }

    fn cfa_register_offset(&mut self) -> Result<(&mut u16, &mut i64)> {
        match &mut self.rules.cfa {
            CfaRule::RegisterOffset { register, offset } => Ok((register, offset)),
            cfa => Err(Error::malformed(format!(
                "CFA register or offset changed while the CFA is {cfa:?}"
            ))),
        }
    }

    fn execute(&mut self, instruction: Instruction, pc: u64) -> Result<Flow> {
        match instruction {
            Instruction::SetLoc(loc) => return Ok(self.set_loc(loc, pc)),
            Instruction::AdvanceLoc(delta) | Instruction::AdvanceLoc1(delta) => {
                return Ok(self.advance(u64::from(delta), pc))
            }
            Instruction::AdvanceLoc2(delta) => return Ok(self.advance(u64::from(delta), pc)),
            Instruction::AdvanceLoc4(delta) => return Ok(self.advance(u64::from(delta), pc)),
            Instruction::DefCfa {
                register_number,
                offset,
            } => {
                self.rules.cfa = CfaRule::RegisterOffset {
                    register: reg_num(register_number)?,
                    offset: offset as i64,
                };
            }
            Instruction::DefCfaSf {
                register_number,
                factored_offset,
            } => {
                self.rules.cfa = CfaRule::RegisterOffset {
                    register: reg_num(register_number)?,
                    offset: self.factored(factored_offset),
                };
            }
            Instruction::DefCfaRegister(reg) => {
                let reg = reg_num(reg)?;
                *self.cfa_register_offset()?.0 = reg;
            }
            Instruction::DefCfaOffset(offset) => {
                *self.cfa_register_offset()?.1 = offset as i64;
            }
            Instruction::DefCfaOffsetSf(factored_offset) => {
                let offset = self.factored(factored_offset);
                *self.cfa_register_offset()?.1 = offset;
            }
            Instruction::DefCfaExpression(expr) => self.rules.cfa = CfaRule::Expression(expr),
            Instruction::Undefined(reg) => self.set_rule(reg, RegisterRule::Undefined)?,
            Instruction::SameValue(reg) => self.set_rule(reg, RegisterRule::SameValue)?,
            Instruction::Offset {
                register_number,
                factored_offset,
            }
            | Instruction::OffsetExtended {
                register_number,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset as i64);
                self.set_rule(register_number, RegisterRule::Offset(offset))?;
            }
            Instruction::OffsetExtendedSf {
                register_number,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset);
                self.set_rule(register_number, RegisterRule::Offset(offset))?;
            }
            Instruction::ValOffset {
                register_number,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset as i64);
                self.set_rule(register_number, RegisterRule::ValOffset(offset))?;
            }
            Instruction::ValOffsetSf {
                register_number,
                factored_offset,
            } => {
                let offset = self.factored(factored_offset);
                self.set_rule(register_number, RegisterRule::ValOffset(offset))?;
            }
            Instruction::Register {
                target_register,
                from_register,
            } => {
                let reg = reg_num(from_register)?;
                self.set_rule(target_register, RegisterRule::Register { reg, offset: 0 })?;
            }
            Instruction::Expression { register, expr } => {
                self.set_rule(register, RegisterRule::Expression(expr))?
            }
            Instruction::ValExpression { register, expr } => {
                self.set_rule(register, RegisterRule::ValExpression(expr))?
            }
            Instruction::Restore(reg) | Instruction::RestoreExtended(reg) => self.restore(reg)?,
            Instruction::RememberState => self.stack.push(self.rules.clone()),
            Instruction::RestoreState => {
                self.rules = self
                    .stack
                    .pop()
                    .ok_or_else(|| Error::malformed("restore_state without remember_state"))?;
            }
            Instruction::Nop | Instruction::GnuArgsSize(_) => {}
            Instruction::GnuNegativeOffsetExtended {
                register_number,
                offset,
            } => {
                let rule = RegisterRule::Offset((offset as i64).wrapping_neg());
                self.set_rule(register_number, rule)?;
            }
        }
        Ok(Flow::Continue)
    }
}

/// Replays the CIE's initial instructions and then the FDE's instructions up
/// to `pc`. `memory` is the object memory the entries were parsed from and
/// `vaddr_bias` maps its offsets to virtual addresses.
pub(crate) fn location_rules(
    memory: &dyn Memory,
    vaddr_bias: u64,
    fde: &Fde,
    pc: u64,
) -> Result<LocationRules> {
    let cie = &*fde.cie;
    let cursor = |start, end| Cursor::new(memory, start, end, vaddr_bias, cie.address_size);

    let mut vm = CfaVm::new(cie, fde.pc_start);
    vm.run(
        InstrIter::new(cursor(cie.cfa_instructions_offset, cie.cfa_instructions_end), cie),
        u64::MAX,
    )?;
    vm.initial = Some(vm.rules.clone());
    vm.loc = fde.pc_start;

    vm.run(
        InstrIter::new(cursor(fde.cfa_instructions_offset, fde.cfa_instructions_end), cie),
        pc,
    )?;

    debug!(rules = ?vm.rules, "location rules for {pc:#x}");
    Ok(vm.rules)
}
