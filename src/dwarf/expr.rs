//! DWARF expressions, as far as call frame information uses them.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §2.5 DWARF Expressions
//!
//! An expression is a small stack machine program. Values are target address
//! sized; on 32-bit targets every result is truncated to 32 bits and signed
//! operations look at bit 31.
#![allow(non_upper_case_globals)]


use std::fmt;

use super::parse::Cursor;
use crate::{
    memory::{Memory, MemoryBuffer},
    regs::Regs,
    Error, Result,
};

/// Bounds the work a single expression can do, `bra` and `skip` can loop.
const MAX_EXECUTED_OPS: usize = 0x10000;

const DW_OP_addr: u8 = 0x03;
const DW_OP_deref: u8 = 0x06;
const DW_OP_const1u: u8 = 0x08;
const DW_OP_const1s: u8 = 0x09;
const DW_OP_const2u: u8 = 0x0a;
const DW_OP_const2s: u8 = 0x0b;
const DW_OP_const4u: u8 = 0x0c;
const DW_OP_const4s: u8 = 0x0d;
const DW_OP_const8u: u8 = 0x0e;
const DW_OP_const8s: u8 = 0x0f;
const DW_OP_constu: u8 = 0x10;
const DW_OP_consts: u8 = 0x11;
const DW_OP_dup: u8 = 0x12;
const DW_OP_drop: u8 = 0x13;
const DW_OP_over: u8 = 0x14;
const DW_OP_pick: u8 = 0x15;
const DW_OP_swap: u8 = 0x16;
const DW_OP_rot: u8 = 0x17;
const DW_OP_abs: u8 = 0x19;
const DW_OP_and: u8 = 0x1a;
const DW_OP_div: u8 = 0x1b;
const DW_OP_minus: u8 = 0x1c;
const DW_OP_mod: u8 = 0x1d;
const DW_OP_mul: u8 = 0x1e;
const DW_OP_neg: u8 = 0x1f;
const DW_OP_not: u8 = 0x20;
const DW_OP_or: u8 = 0x21;
const DW_OP_plus: u8 = 0x22;
const DW_OP_plus_uconst: u8 = 0x23;
const DW_OP_shl: u8 = 0x24;
const DW_OP_shr: u8 = 0x25;
const DW_OP_shra: u8 = 0x26;
const DW_OP_xor: u8 = 0x27;
const DW_OP_bra: u8 = 0x28;
const DW_OP_eq: u8 = 0x29;
const DW_OP_ge: u8 = 0x2a;
const DW_OP_gt: u8 = 0x2b;
const DW_OP_le: u8 = 0x2c;
const DW_OP_lt: u8 = 0x2d;
const DW_OP_ne: u8 = 0x2e;
const DW_OP_skip: u8 = 0x2f;
const DW_OP_lit0: u8 = 0x30;
const DW_OP_lit31: u8 = 0x4f;
const DW_OP_reg0: u8 = 0x50;
const DW_OP_reg31: u8 = 0x6f;
const DW_OP_breg0: u8 = 0x70;
const DW_OP_breg31: u8 = 0x8f;
const DW_OP_regx: u8 = 0x90;
const DW_OP_bregx: u8 = 0x92;
const DW_OP_deref_size: u8 = 0x94;
const DW_OP_nop: u8 = 0x96;

/// The bytes of one DWARF expression, copied out of the object file.
#[derive(Clone, PartialEq, Eq)]
pub struct Expr(Box<[u8]>);

impl Expr {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Runs the expression and returns the value on top of the stack.
    ///
    /// `initial` is pushed before the first operation; register rules push
    /// the CFA this way. `regs` provides `DW_OP_breg*` and `memory`
    /// `DW_OP_deref*`.
    pub fn evaluate(&self, regs: &Regs, memory: &dyn Memory, initial: Option<u64>) -> Result<u64> {
        let code = MemoryBuffer::new(self.0.to_vec());
        let address_size = if regs.is_32bit() { 4 } else { 8 };
        let mut machine = Machine {
            ops: Cursor::new(&code, 0, self.0.len() as u64, 0, address_size),
            stack: initial.into_iter().collect(),
            regs,
            memory,
        };
        machine.run()?;
        let result = machine.pop()?;
        trace!("expression {self:?} = {result:#x}");
        Ok(result)
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({:02x?})", self.0)
    }
}

fn shift(amount: u64) -> Option<u32> {
    u32::try_from(amount).ok()
}

struct Machine<'a> {
    ops: Cursor<'a>,
    stack: Vec<u64>,
    regs: &'a Regs,
    memory: &'a dyn Memory,
}

impl Machine<'_> {
    fn is_32bit(&self) -> bool {
        self.regs.is_32bit()
    }

    fn word(&self, value: u64) -> u64 {
        if self.is_32bit() {
            value & 0xffff_ffff
        } else {
            value
        }
    }

    fn signed(&self, value: u64) -> i64 {
        if self.is_32bit() {
            value as u32 as i32 as i64
        } else {
            value as i64
        }
    }

    fn push(&mut self, value: u64) {
        let value = self.word(value);
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<u64> {
        self.stack
            .pop()
            .ok_or_else(|| Error::malformed("expression stack underflow"))
    }

    fn peek(&self, depth: usize) -> Result<u64> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .map(|idx| self.stack[idx])
            .ok_or_else(|| Error::malformed(format!("expression stack has no entry {depth}")))
    }

    fn register(&self, reg: u64) -> Result<u64> {
        u16::try_from(reg)
            .ok()
            .and_then(|reg| self.regs.get(reg))
            .ok_or_else(|| Error::malformed(format!("expression reads unknown register {reg}")))
    }

    fn jump(&mut self, offset: i16) -> Result<()> {
        let target = self.ops.pos().wrapping_add(offset as i64 as u64);
        self.ops.set_pos(target)
    }

    fn run(&mut self) -> Result<()> {
        let mut executed = 0;
        while !self.ops.is_empty() {
            executed += 1;
            if executed > MAX_EXECUTED_OPS {
                return Err(Error::malformed("expression does not terminate"));
            }
            let op = self.ops.read_u8()?;
            self.execute(op)?;
        }
        Ok(())
    }

    fn binary(&mut self, f: impl FnOnce(&Self, u64, u64) -> Result<u64>) -> Result<()> {
        let top = self.pop()?;
        let second = self.pop()?;
        let value = f(&*self, second, top)?;
        self.push(value);
        Ok(())
    }

    fn compare(&mut self, f: impl FnOnce(i64, i64) -> bool) -> Result<()> {
        self.binary(|m, a, b| Ok(u64::from(f(m.signed(a), m.signed(b)))))
    }

    fn execute(&mut self, op: u8) -> Result<()> {
        match op {
            DW_OP_addr => {
                let value = self.ops.read_address()?;
                self.push(value);
            }
            DW_OP_deref => {
                let addr = self.pop()?;
                let value = self.regs.read_word(self.memory, addr)?;
                self.push(value);
            }
            DW_OP_deref_size => {
                let size = self.ops.read_u8()?;
                let max = if self.is_32bit() { 4 } else { 8 };
                if size == 0 || size > max {
                    return Err(Error::malformed(format!("deref_size of {size} bytes")));
                }
                let addr = self.pop()?;
                let mut bytes = [0; 8];
                self.memory.read_fully(addr, &mut bytes[..usize::from(size)])?;
                self.push(u64::from_le_bytes(bytes));
            }
            DW_OP_const1u => {
                let value = self.ops.read_u8()?;
                self.push(u64::from(value));
            }
            DW_OP_const1s => {
                let value = self.ops.read_u8()? as i8;
                self.push(value as i64 as u64);
            }
            DW_OP_const2u => {
                let value = self.ops.read_u16()?;
                self.push(u64::from(value));
            }
            DW_OP_const2s => {
                let value = self.ops.read_u16()? as i16;
                self.push(value as i64 as u64);
            }
            DW_OP_const4u => {
                let value = self.ops.read_u32()?;
                self.push(u64::from(value));
            }
            DW_OP_const4s => {
                let value = self.ops.read_u32()? as i32;
                self.push(value as i64 as u64);
            }
            DW_OP_const8u | DW_OP_const8s => {
                let value = self.ops.read_u64()?;
                self.push(value);
            }
            DW_OP_constu => {
                let value = self.ops.read_uleb128()?;
                self.push(value);
            }
            DW_OP_consts => {
                let value = self.ops.read_ileb128()?;
                self.push(value as u64);
            }
            DW_OP_dup => {
                let value = self.peek(0)?;
                self.push(value);
            }
            DW_OP_drop => {
                self.pop()?;
            }
            DW_OP_over => {
                let value = self.peek(1)?;
                self.push(value);
            }
            DW_OP_pick => {
                let idx = self.ops.read_u8()?;
                let value = self.peek(usize::from(idx))?;
                self.push(value);
            }
            DW_OP_swap => {
                let top = self.pop()?;
                let second = self.pop()?;
                self.push(top);
                self.push(second);
            }
            DW_OP_rot => {
                let top = self.pop()?;
                let second = self.pop()?;
                let third = self.pop()?;
                self.push(top);
                self.push(third);
                self.push(second);
            }
            DW_OP_abs => {
                let value = self.pop()?;
                let value = self.signed(value).unsigned_abs();
                self.push(value);
            }
            DW_OP_neg => {
                let value = self.pop()?;
                let value = self.signed(value).wrapping_neg();
                self.push(value as u64);
            }
            DW_OP_not => {
                let value = self.pop()?;
                self.push(!value);
            }
            DW_OP_plus_uconst => {
                let add = self.ops.read_uleb128()?;
                let value = self.pop()?;
                self.push(value.wrapping_add(add));
            }
            DW_OP_and => self.binary(|_, a, b| Ok(a & b))?,
            DW_OP_or => self.binary(|_, a, b| Ok(a | b))?,
            DW_OP_xor => self.binary(|_, a, b| Ok(a ^ b))?,
            DW_OP_plus => self.binary(|_, a, b| Ok(a.wrapping_add(b)))?,
            DW_OP_minus => self.binary(|_, a, b| Ok(a.wrapping_sub(b)))?,
            DW_OP_mul => self.binary(|_, a, b| Ok(a.wrapping_mul(b)))?,
            DW_OP_div => self.binary(|m, a, b| {
                let (a, b) = (m.signed(a), m.signed(b));
                if b == 0 {
                    return Err(Error::malformed("expression divides by zero"));
                }
                Ok(a.wrapping_div(b) as u64)
            })?,
            DW_OP_mod => self.binary(|_, a, b| {
                if b == 0 {
                    return Err(Error::malformed("expression divides by zero"));
                }
                Ok(a % b)
            })?,
            DW_OP_shl => self.binary(|_, a, b| {
                Ok(shift(b).and_then(|b| a.checked_shl(b)).unwrap_or(0))
            })?,
            DW_OP_shr => self.binary(|m, a, b| {
                Ok(shift(b).and_then(|b| m.word(a).checked_shr(b)).unwrap_or(0))
            })?,
            DW_OP_shra => self.binary(|m, a, b| {
                let shift = b.min(63) as u32;
                Ok((m.signed(a) >> shift) as u64)
            })?,
            DW_OP_eq => self.compare(|a, b| a == b)?,
            DW_OP_ge => self.compare(|a, b| a >= b)?,
            DW_OP_gt => self.compare(|a, b| a > b)?,
            DW_OP_le => self.compare(|a, b| a <= b)?,
            DW_OP_lt => self.compare(|a, b| a < b)?,
            DW_OP_ne => self.compare(|a, b| a != b)?,
            DW_OP_skip => {
                let offset = self.ops.read_u16()? as i16;
                self.jump(offset)?;
            }
            DW_OP_bra => {
                let offset = self.ops.read_u16()? as i16;
                if self.pop()? != 0 {
                    self.jump(offset)?;
                }
            }
            DW_OP_lit0..=DW_OP_lit31 => self.push(u64::from(op - DW_OP_lit0)),
            DW_OP_breg0..=DW_OP_breg31 => {
                let base = self.register(u64::from(op - DW_OP_breg0))?;
                let offset = self.ops.read_ileb128()?;
                self.push(base.wrapping_add(offset as u64));
            }
            DW_OP_bregx => {
                let reg = self.ops.read_uleb128()?;
                let base = self.register(reg)?;
                let offset = self.ops.read_ileb128()?;
                self.push(base.wrapping_add(offset as u64));
            }
            DW_OP_reg0..=DW_OP_reg31 | DW_OP_regx => {
                return Err(Error::malformed(format!(
                    "register location {op:#04x} in a call frame expression"
                )))
            }
            DW_OP_nop => {}
            _ => return Err(Error::malformed(format!("unsupported expression opcode {op:#04x}"))),
        }
        Ok(())
    }
}
