//! Decoding of CIEs and FDEs.
//!
//! Everything here reads through a [`Cursor`] that is bounded by the end of
//! the section or entry it was created for, so a corrupt length never makes
//! the parser wander into unrelated memory.


use std::{fmt, sync::Arc};

use crate::{memory::Memory, Error, Result};

/// A bounded reader over object memory.
#[derive(Clone, Copy)]
pub(crate) struct Cursor<'a> {
    memory: &'a dyn Memory,
    pos: u64,
    end: u64,
    /// Added to a position to get the virtual address of that byte.
    vaddr_bias: u64,
    address_size: u8,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(
        memory: &'a dyn Memory,
        pos: u64,
        end: u64,
        vaddr_bias: u64,
        address_size: u8,
    ) -> Self {
        Self {
            memory,
            pos,
            end,
            vaddr_bias,
            address_size,
        }
    }

    pub(crate) fn pos(&self) -> u64 {
        self.pos
    }

    pub(crate) fn end(&self) -> u64 {
        self.end
    }

    pub(crate) fn address_size(&self) -> u8 {
        self.address_size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    /// Moves to `pos`, which may be at most the end.
    pub(crate) fn set_pos(&mut self, pos: u64) -> Result<()> {
        if pos > self.end {
            return Err(Error::malformed(format!(
                "seek to {pos:#x} past the end at {:#x}",
                self.end
            )));
        }
        self.pos = pos;
        Ok(())
    }

    /// The same cursor, ending at `end` instead.
    pub(crate) fn with_end(&self, end: u64) -> Result<Self> {
        if end > self.end || end < self.pos {
            return Err(Error::malformed(format!(
                "entry end {end:#x} outside of {:#x}..{:#x}",
                self.pos, self.end
            )));
        }
        Ok(Self { end, ..*self })
    }

    pub(crate) fn vaddr(&self, pos: u64) -> u64 {
        pos.wrapping_add(self.vaddr_bias)
    }

    fn check(&self, len: u64) -> Result<()> {
        match self.pos.checked_add(len) {
            Some(end) if end <= self.end => Ok(()),
            _ => Err(Error::malformed(format!(
                "index out of bounds, tried to read {len} bytes at {:#x} with the end at {:#x}",
                self.pos, self.end
            ))),
        }
    }

    pub(crate) fn skip(&mut self, len: u64) -> Result<()> {
        self.check(len)?;
        self.pos += len;
        Ok(())
    }

    pub(crate) fn read_bytes(&mut self, len: u64) -> Result<Vec<u8>> {
        self.check(len)?;
        let mut bytes = vec![0; len as usize];
        self.memory.read_fully(self.pos, &mut bytes)?;
        self.pos += len;
        Ok(bytes)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        self.check(1)?;
        let value = self.memory.read_u8(self.pos)?;
        self.pos += 1;
        Ok(value)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        self.check(2)?;
        let value = self.memory.read_u16(self.pos)?;
        self.pos += 2;
        Ok(value)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        self.check(4)?;
        let value = self.memory.read_u32(self.pos)?;
        self.pos += 4;
        Ok(value)
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        self.check(8)?;
        let value = self.memory.read_u64(self.pos)?;
        self.pos += 8;
        Ok(value)
    }

    /// Reads a word of the target's address size.
    pub(crate) fn read_address(&mut self) -> Result<u64> {
        if self.address_size == 4 {
            self.read_u32().map(u64::from)
        } else {
            self.read_u64()
        }
    }

    pub(crate) fn read_uleb128(&mut self) -> Result<u64> {
        let mut result = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0b0111_1111) << shift;
            }
            shift += 7;
            if (byte >> 7) == 0 {
                break;
            }
        }
        Ok(result)
    }

    pub(crate) fn read_ileb128(&mut self) -> Result<i64> {
        let mut result = 0;
        let mut shift = 0;

        let sign_bit_set = loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0b0111_1111) << shift;
            }
            shift += 7;
            if (byte >> 7) == 0 {
                break ((byte >> 6) & 1) == 1;
            }
        };
        if shift < 64 && sign_bit_set {
            result |= -1 << shift;
        }
        Ok(result)
    }

    /// Reads a NUL terminated string.
    pub(crate) fn read_utf8_cstr(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            match self.read_u8()? {
                0 => break,
                byte => bytes.push(byte),
            }
        }
        String::from_utf8(bytes).map_err(|e| Error::malformed(format!("invalid utf8: {e}")))
    }

    /// Reads a pointer with the given `DW_EH_PE` encoding. `datarel_base` is
    /// the base for `DW_EH_PE_datarel`, which only has a meaning inside
    /// `.eh_frame_hdr`.
    pub(crate) fn read_encoded(
        &mut self,
        encoding: Encoding,
        datarel_base: Option<u64>,
    ) -> Result<u64> {
        if encoding.is_omit() {
            return Err(Error::malformed("read of an omitted pointer"));
        }
        if encoding.is_indirect() {
            return Err(Error::malformed(format!(
                "indirect pointer encoding {encoding:?} is not supported"
            )));
        }

        let application = encoding.application()?;
        if let ValueApplication::DW_EH_PE_aligned = application {
            let size = u64::from(self.address_size);
            let aligned = self.pos.wrapping_add(size - 1) & !(size - 1);
            self.set_pos(aligned)?;
        }

        let field_pos = self.pos;
        let value = match encoding.format()? {
            ValueFormat::DW_EH_PE_absptr => self.read_address()?,
            ValueFormat::DW_EH_PE_uleb128 => self.read_uleb128()?,
            ValueFormat::DW_EH_PE_udata2 => u64::from(self.read_u16()?),
            ValueFormat::DW_EH_PE_udata4 => u64::from(self.read_u32()?),
            ValueFormat::DW_EH_PE_udata8 => self.read_u64()?,
            ValueFormat::DW_EH_PE_sleb128 => self.read_ileb128()? as u64,
            ValueFormat::DW_EH_PE_sdata2 => self.read_u16()? as i16 as i64 as u64,
            ValueFormat::DW_EH_PE_sdata4 => self.read_u32()? as i32 as i64 as u64,
            ValueFormat::DW_EH_PE_sdata8 => self.read_u64()?,
        };

        let value = match application {
            ValueApplication::DW_EH_PE_absptr | ValueApplication::DW_EH_PE_aligned => value,
            ValueApplication::DW_EH_PE_pcrel => value.wrapping_add(self.vaddr(field_pos)),
            ValueApplication::DW_EH_PE_datarel => {
                let base = datarel_base.ok_or_else(|| {
                    Error::malformed("datarel pointer outside of .eh_frame_hdr")
                })?;
                value.wrapping_add(base)
            }
            ValueApplication::DW_EH_PE_textrel | ValueApplication::DW_EH_PE_funcrel => {
                return Err(Error::malformed(format!(
                    "pointer application {application:?} is not supported"
                )))
            }
        };

        if self.address_size == 4 {
            Ok(value & 0xffff_ffff)
        } else {
            Ok(value)
        }
    }
}

/// A `DW_EH_PE` pointer encoding byte.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct Encoding(pub u8);

impl Encoding {
    pub const ABSPTR: Encoding = Encoding(0x00);
    pub const OMIT: Encoding = Encoding(0xff);

    const INDIRECT: u8 = 0x80;

    pub fn is_omit(self) -> bool {
        self == Self::OMIT
    }

    pub fn is_indirect(self) -> bool {
        self.0 & Self::INDIRECT != 0
    }

    fn format(self) -> Result<ValueFormat> {
        Ok(match self.0 & 0b1111 {
            0x00 => ValueFormat::DW_EH_PE_absptr,
            0x01 => ValueFormat::DW_EH_PE_uleb128,
            0x02 => ValueFormat::DW_EH_PE_udata2,
            0x03 => ValueFormat::DW_EH_PE_udata4,
            0x04 => ValueFormat::DW_EH_PE_udata8,
            0x09 => ValueFormat::DW_EH_PE_sleb128,
            0x0A => ValueFormat::DW_EH_PE_sdata2,
            0x0B => ValueFormat::DW_EH_PE_sdata4,
            0x0C => ValueFormat::DW_EH_PE_sdata8,
            v => return Err(Error::malformed(format!("invalid pointer value format: {v:#x}"))),
        })
    }

    fn application(self) -> Result<ValueApplication> {
        Ok(match (self.0 & !Self::INDIRECT) >> 4 {
            0x0 => ValueApplication::DW_EH_PE_absptr,
            0x1 => ValueApplication::DW_EH_PE_pcrel,
            0x2 => ValueApplication::DW_EH_PE_textrel,
            0x3 => ValueApplication::DW_EH_PE_datarel,
            0x4 => ValueApplication::DW_EH_PE_funcrel,
            0x5 => ValueApplication::DW_EH_PE_aligned,
            v => {
                return Err(Error::malformed(format!(
                    "invalid pointer value application: {v:#x}"
                )))
            }
        })
    }

    /// The encoded size, if it does not depend on the value.
    pub(crate) fn size(self, address_size: u8) -> Option<u64> {
        match self.format().ok()? {
            ValueFormat::DW_EH_PE_absptr => Some(u64::from(address_size)),
            ValueFormat::DW_EH_PE_uleb128 | ValueFormat::DW_EH_PE_sleb128 => None,
            ValueFormat::DW_EH_PE_udata2 | ValueFormat::DW_EH_PE_sdata2 => Some(2),
            ValueFormat::DW_EH_PE_udata4 | ValueFormat::DW_EH_PE_sdata4 => Some(4),
            ValueFormat::DW_EH_PE_udata8 | ValueFormat::DW_EH_PE_sdata8 => Some(8),
        }
    }

    /// Only the value format, without the application. Address ranges are
    /// encoded like this.
    pub(crate) fn format_only(self) -> Encoding {
        Encoding(self.0 & 0b1111)
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_omit() {
            return f.write_str("DW_EH_PE_omit");
        }
        match (self.application(), self.format()) {
            (Ok(application), Ok(format)) => {
                if self.is_indirect() {
                    f.write_str("DW_EH_PE_indirect | ")?;
                }
                write!(f, "{application:?} | {format:?}")
            }
            _ => write!(f, "Encoding({:#04x})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types)]
enum ValueFormat {
    /// A value of the size of an address on the target.
    DW_EH_PE_absptr = 0x00,
    /// Unsigned value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_uleb128 = 0x01,
    /// A 2 bytes unsigned value.
    DW_EH_PE_udata2 = 0x02,
    /// A 4 bytes unsigned value.
    DW_EH_PE_udata4 = 0x03,
    /// An 8 bytes unsigned value.
    DW_EH_PE_udata8 = 0x04,
    /// Signed value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_sleb128 = 0x09,
    /// A 2 bytes signed value.
    DW_EH_PE_sdata2 = 0x0A,
    /// A 4 bytes signed value.
    DW_EH_PE_sdata4 = 0x0B,
    /// An 8 bytes signed value.
    DW_EH_PE_sdata8 = 0x0C,
}

#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types)]
enum ValueApplication {
    DW_EH_PE_absptr = 0x00,
    ///	Value is relative to the current program counter.
    DW_EH_PE_pcrel = 0x10,
    ///	Value is relative to the beginning of the .text section.
    DW_EH_PE_textrel = 0x20,
    ///	Value is relative to the beginning of the .got or .eh_frame_hdr
    /// section.
    DW_EH_PE_datarel = 0x30,
    ///	Value is relative to the beginning of the function.
    DW_EH_PE_funcrel = 0x40,
    ///	Value is aligned to an address unit sized boundary.
    DW_EH_PE_aligned = 0x50,
}

/// Which flavour of call frame information a section holds. They differ in
/// how CIEs are marked and how FDEs point at them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// `.eh_frame`: CIE id 0, CIE pointers relative to the pointer itself.
    EhFrame,
    /// `.debug_frame`: CIE id all ones, CIE pointers are section offsets.
    DebugFrame,
}

/// The length and id/pointer field every CIE and FDE starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryHeader {
    pub offset: u64,
    /// Where the CIE id or CIE pointer is stored.
    pub id_pos: u64,
    pub id: u64,
    /// First byte after the entry.
    pub end: u64,
    pub is_64: bool,
}

impl EntryHeader {
    pub(crate) fn is_cie(&self, kind: SectionKind) -> bool {
        match kind {
            SectionKind::EhFrame => self.id == 0,
            SectionKind::DebugFrame if self.is_64 => self.id == u64::MAX,
            SectionKind::DebugFrame => self.id == 0xffff_ffff,
        }
    }
}

/// Reads an entry header. `None` is the zero length terminator.
pub(crate) fn read_entry_header(cursor: &mut Cursor<'_>) -> Result<Option<EntryHeader>> {
    let offset = cursor.pos();
    let len = cursor.read_u32()?;
    let (len, is_64) = if len == 0xffff_ffff {
        (cursor.read_u64()?, true)
    } else {
        (u64::from(len), false)
    };
    if len == 0 {
        return Ok(None);
    }

    let id_pos = cursor.pos();
    let end = id_pos
        .checked_add(len)
        .filter(|&end| end <= cursor.end())
        .ok_or_else(|| {
            Error::malformed(format!(
                "entry at {offset:#x} with length {len:#x} overruns the section"
            ))
        })?;
    let id = if is_64 {
        cursor.read_u64()?
    } else {
        u64::from(cursor.read_u32()?)
    };

    trace!("entry at {offset:#x}: id {id:#x}, end {end:#x}");
    Ok(Some(EntryHeader {
        offset,
        id_pos,
        id,
        end,
        is_64,
    }))
}

/// Common Information Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cie {
    pub offset: u64,
    pub version: u8,
    /// A null-terminated UTF-8 string that identifies the augmentation to this
    /// CIE or to the FDEs that use it.
    ///
    /// If there is no augmentation, this value is a zero byte.
    pub augmentation_string: String,
    /// How FDE addresses are encoded (`R`).
    pub fde_address_encoding: Encoding,
    /// How the FDE LSDA pointer is encoded (`L`).
    pub lsda_encoding: Encoding,
    /// Address of the personality routine (`P`).
    pub personality_handler: Option<u64>,
    /// The frame is a signal trampoline (`S`).
    pub is_signal_frame: bool,
    pub address_size: u8,
    pub segment_size: u8,
    /// A constant that is factored out of all advance location instructions
    /// (see Section 6.4.2.1 on page 177). The resulting value is
    /// (operand * code_alignment_factor).
    pub code_alignment_factor: u64,
    /// A constant that is factored out of certain offset instructions (see
    /// Sections 6.4.2.2 on page 177 and 6.4.2.3 on page 179). The resulting
    /// value is (operand * data_alignment_factor).
    pub data_alignment_factor: i64,
    /// An unsigned LEB128 constant that indicates which column in the rule
    /// table represents the return address of the function. Note that this
    /// column might not correspond to an actual machine register.
    pub return_address_register: u64,
    /// Where the initial instructions start.
    pub cfa_instructions_offset: u64,
    pub cfa_instructions_end: u64,
}

/// Frame Description Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fde {
    pub offset: u64,
    pub cie: Arc<Cie>,
    /// The address of the first location associated with this table entry.
    pub pc_start: u64,
    /// One past the last location described by this entry.
    pub pc_end: u64,
    /// Address of the language specific data area, if the entry has one.
    pub lsda_address: Option<u64>,
    pub cfa_instructions_offset: u64,
    pub cfa_instructions_end: u64,
}

impl Fde {
    pub fn contains(&self, pc: u64) -> bool {
        (self.pc_start..self.pc_end).contains(&pc)
    }
}

/// Parses the body of a CIE. `cursor` is positioned after the CIE id and ends
/// with the entry.
#[instrument(level = "trace", skip(cursor))]
pub(crate) fn parse_cie(cursor: &mut Cursor<'_>, offset: u64) -> Result<Cie> {
    let version = cursor.read_u8()?;
    if !matches!(version, 1 | 3 | 4) {
        return Err(Error::malformed(format!(
            "unsupported CIE version {version} at {offset:#x}"
        )));
    }

    let augmentation_string = cursor.read_utf8_cstr()?;
    let mut address_size = cursor.address_size();
    let mut segment_size = 0;
    if version == 4 {
        address_size = cursor.read_u8()?;
        segment_size = cursor.read_u8()?;
        if !matches!(address_size, 4 | 8) {
            return Err(Error::malformed(format!(
                "CIE at {offset:#x} has address size {address_size}"
            )));
        }
    }

    let code_alignment_factor = cursor.read_uleb128()?;
    let data_alignment_factor = cursor.read_ileb128()?;
    let return_address_register = if version == 1 {
        u64::from(cursor.read_u8()?)
    } else {
        cursor.read_uleb128()?
    };

    let mut cie = Cie {
        offset,
        version,
        augmentation_string,
        fde_address_encoding: Encoding::ABSPTR,
        lsda_encoding: Encoding::OMIT,
        personality_handler: None,
        is_signal_frame: false,
        address_size,
        segment_size,
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        cfa_instructions_offset: 0,
        cfa_instructions_end: cursor.end(),
    };

    if cie.augmentation_string.starts_with('z') {
        let aug_len = cursor.read_uleb128()?;
        let aug_end = cursor.pos().checked_add(aug_len).unwrap_or(u64::MAX);
        let mut aug = cursor.with_end(aug_end)?;

        for code in cie.augmentation_string.bytes().skip(1) {
            match code {
                b'L' => cie.lsda_encoding = Encoding(aug.read_u8()?),
                b'P' => {
                    let encoding = Encoding(aug.read_u8()?);
                    cie.personality_handler = Some(aug.read_encoded(encoding, None)?);
                }
                b'R' => cie.fde_address_encoding = Encoding(aug.read_u8()?),
                b'S' => cie.is_signal_frame = true,
                _ => {
                    debug!("unknown augmentation {:?}, skipping the rest", code as char);
                    break;
                }
            }
        }
        cursor.set_pos(aug_end)?;
    }

    cie.cfa_instructions_offset = cursor.pos();
    trace!("{cie:?}");
    Ok(cie)
}

/// Parses the body of an FDE. `cursor` is positioned after the CIE pointer and
/// ends with the entry.
#[instrument(level = "trace", skip(cursor, cie))]
pub(crate) fn parse_fde(cursor: &mut Cursor<'_>, offset: u64, cie: Arc<Cie>) -> Result<Fde> {
    if cie.segment_size != 0 {
        cursor.skip(u64::from(cie.segment_size))?;
    }

    let pc_start = cursor.read_encoded(cie.fde_address_encoding, None)?;
    let pc_range = cursor.read_encoded(cie.fde_address_encoding.format_only(), None)?;

    let mut lsda_address = None;
    if cie.augmentation_string.starts_with('z') {
        let aug_len = cursor.read_uleb128()?;
        let aug_end = cursor.pos().checked_add(aug_len).unwrap_or(u64::MAX);
        if aug_len != 0 && !cie.lsda_encoding.is_omit() {
            let mut aug = cursor.with_end(aug_end)?;
            lsda_address =
                Some(aug.read_encoded(cie.lsda_encoding, None)?).filter(|&lsda| lsda != 0);
        }
        cursor.set_pos(aug_end)?;
    }

    let mut pc_end = pc_start.wrapping_add(pc_range);
    if cie.address_size == 4 {
        pc_end &= 0xffff_ffff;
    }

    let fde = Fde {
        offset,
        pc_start,
        pc_end,
        lsda_address,
        cfa_instructions_offset: cursor.pos(),
        cfa_instructions_end: cursor.end(),
        cie,
    };
    trace!("FDE covers {:#x}..{:#x}", fde.pc_start, fde.pc_end);
    Ok(fde)
}
