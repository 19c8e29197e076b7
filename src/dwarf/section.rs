//! One `.eh_frame` or `.debug_frame` section of an object file.


use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
};

use super::{
    cfa::{self, CfaRule, LocationRules, RegisterRule},
    eh_frame_hdr::EhFrameHdr,
    parse::{parse_cie, parse_fde, read_entry_header, Cie, Cursor, EntryHeader, Fde, SectionKind},
};
use crate::{memory::Memory, regs::Regs, Error, Result};

/// Where a section lives: `offset` addresses the object memory, `vaddr` is
/// the address the section is linked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionRange {
    pub offset: u64,
    pub vaddr: u64,
    pub size: u64,
}

impl SectionRange {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    /// Converts a virtual address inside the section to its object offset.
    pub fn offset_of(&self, vaddr: u64) -> Option<u64> {
        let delta = vaddr.checked_sub(self.vaddr)?;
        (delta < self.size).then(|| self.offset + delta)
    }

    pub(crate) fn cursor<'a>(&self, memory: &'a dyn Memory, address_size: u8) -> Cursor<'a> {
        Cursor::new(
            memory,
            self.offset,
            self.end(),
            self.vaddr.wrapping_sub(self.offset),
            address_size,
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    pc_start: u64,
    pc_end: u64,
    offset: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // entries are inserted whole, a poisoned cache is still consistent
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Call frame information of one object, found and evaluated on demand.
pub struct DwarfSection {
    memory: Arc<dyn Memory>,
    range: SectionRange,
    kind: SectionKind,
    address_size: u8,
    hdr: Option<EhFrameHdr>,
    cies: Mutex<HashMap<u64, Result<Arc<Cie>>>>,
    fdes: Mutex<HashMap<u64, Result<Arc<Fde>>>>,
    /// FDEs sorted by start address, built by a linear scan when there is no
    /// usable `.eh_frame_hdr`.
    index: OnceLock<Vec<IndexEntry>>,
}

impl DwarfSection {
    /// `memory` is the object memory that `range.offset` addresses and
    /// `address_size` the size of a target address (4 or 8).
    pub fn new(
        memory: Arc<dyn Memory>,
        range: SectionRange,
        kind: SectionKind,
        address_size: u8,
    ) -> Self {
        Self {
            memory,
            range,
            kind,
            address_size,
            hdr: None,
            cies: Mutex::default(),
            fdes: Mutex::default(),
            index: OnceLock::new(),
        }
    }

    /// Uses the search table of an `.eh_frame_hdr` for lookups. A header
    /// that can't be used is ignored and lookups scan the section instead.
    pub fn with_eh_frame_hdr(mut self, hdr: SectionRange) -> Self {
        match EhFrameHdr::parse(&*self.memory, hdr, self.address_size) {
            Ok(Some(parsed)) => {
                if parsed.eh_frame_vaddr() != self.range.vaddr {
                    debug!(
                        "eh_frame_hdr points at {:#x}, the section is at {:#x}",
                        parsed.eh_frame_vaddr(),
                        self.range.vaddr
                    );
                }
                trace!("eh_frame_hdr with {} entries", parsed.fde_count());
                self.hdr = Some(parsed);
            }
            Ok(None) => {}
            Err(err) => warn!("ignoring eh_frame_hdr at {:#x}: {err}", hdr.offset),
        }
        self
    }

    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    pub fn range(&self) -> SectionRange {
        self.range
    }

    pub fn has_eh_frame_hdr(&self) -> bool {
        self.hdr.is_some()
    }

    fn cursor(&self) -> Cursor<'_> {
        self.range.cursor(&*self.memory, self.address_size)
    }

    /// Reads the header of the entry at `offset` and returns it with a
    /// cursor over its body.
    fn entry_at(&self, offset: u64) -> Result<(EntryHeader, Cursor<'_>)> {
        if offset < self.range.offset {
            return Err(Error::malformed(format!(
                "entry offset {offset:#x} is before the section at {:#x}",
                self.range.offset
            )));
        }
        let mut cursor = self.cursor();
        cursor.set_pos(offset)?;
        let header = read_entry_header(&mut cursor)?
            .ok_or_else(|| Error::malformed(format!("entry at {offset:#x} is a terminator")))?;
        let body = cursor.with_end(header.end)?;
        Ok((header, body))
    }

    /// The CIE at `offset`, parsed once.
    pub(crate) fn cie_at(&self, offset: u64) -> Result<Arc<Cie>> {
        if let Some(cie) = lock(&self.cies).get(&offset) {
            return cie.clone();
        }

        let result = self.entry_at(offset).and_then(|(header, mut body)| {
            if !header.is_cie(self.kind) {
                return Err(Error::malformed(format!("expected a CIE at {offset:#x}")));
            }
            parse_cie(&mut body, offset).map(Arc::new)
        });
        lock(&self.cies).insert(offset, result.clone());
        result
    }

    /// The FDE at `offset`, parsed once.
    pub(crate) fn fde_at(&self, offset: u64) -> Result<Arc<Fde>> {
        if let Some(fde) = lock(&self.fdes).get(&offset) {
            return fde.clone();
        }

        let result = self.parse_fde_at(offset).map(Arc::new);
        lock(&self.fdes).insert(offset, result.clone());
        result
    }

    fn parse_fde_at(&self, offset: u64) -> Result<Fde> {
        let (header, mut body) = self.entry_at(offset)?;
        if header.is_cie(self.kind) {
            return Err(Error::malformed(format!(
                "expected an FDE at {offset:#x}, found a CIE"
            )));
        }

        let cie_offset = match self.kind {
            SectionKind::EhFrame => header.id_pos.checked_sub(header.id),
            SectionKind::DebugFrame => self.range.offset.checked_add(header.id),
        }
        .ok_or_else(|| {
            Error::malformed(format!(
                "FDE at {offset:#x} has an invalid CIE pointer {:#x}",
                header.id
            ))
        })?;

        let cie = self.cie_at(cie_offset)?;
        parse_fde(&mut body, offset, cie)
    }

    fn index(&self) -> &[IndexEntry] {
        self.index.get_or_init(|| self.build_index())
    }

    /// Scans every entry of the section. FDEs that fail to parse are left out.
    #[instrument(level = "debug", skip(self))]
    fn build_index(&self) -> Vec<IndexEntry> {
        let mut cursor = self.cursor();
        let mut index = Vec::new();

        while !cursor.is_empty() {
            let header = match read_entry_header(&mut cursor) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(err) => {
                    warn!("stopping the scan at {:#x}: {err}", cursor.pos());
                    break;
                }
            };

            if !header.is_cie(self.kind) {
                match self.fde_at(header.offset) {
                    Ok(fde) if fde.pc_start < fde.pc_end => index.push(IndexEntry {
                        pc_start: fde.pc_start,
                        pc_end: fde.pc_end,
                        offset: header.offset,
                    }),
                    Ok(_) => trace!("skipping empty FDE at {:#x}", header.offset),
                    Err(err) => warn!("skipping FDE at {:#x}: {err}", header.offset),
                }
            }

            // read_entry_header checked that the end is inside the section
            if cursor.set_pos(header.end).is_err() {
                break;
            }
        }

        index.sort_by_key(|entry| entry.pc_start);
        debug!("indexed {} FDEs", index.len());
        index
    }

    /// Finds the FDE whose range contains `pc`.
    #[instrument(level = "debug", skip(self))]
    pub fn find_fde(&self, pc: u64) -> Result<Arc<Fde>> {
        let no_info = Error::NoUnwindInfo { pc };

        let offset = match &self.hdr {
            Some(hdr) => {
                let Some(fde_vaddr) = hdr.find(&*self.memory, pc)? else {
                    return Err(no_info);
                };
                self.range.offset_of(fde_vaddr).ok_or_else(|| {
                    Error::malformed(format!(
                        "eh_frame_hdr points at {fde_vaddr:#x}, outside of the section"
                    ))
                })?
            }
            None => {
                let index = self.index();
                let idx = index.partition_point(|entry| entry.pc_start <= pc);
                match idx.checked_sub(1).map(|idx| index[idx]) {
                    Some(entry) if pc < entry.pc_end => entry.offset,
                    _ => return Err(no_info),
                }
            }
        };

        let fde = self.fde_at(offset)?;
        if !fde.contains(pc) {
            debug!("FDE at {offset:#x} ends at {:#x}", fde.pc_end);
            return Err(no_info);
        }
        Ok(fde)
    }

    /// The CFI table row of `fde` at `pc`.
    pub fn location_rules(&self, fde: &Fde, pc: u64) -> Result<LocationRules> {
        cfa::location_rules(
            &*self.memory,
            self.range.vaddr.wrapping_sub(self.range.offset),
            fde,
            pc,
        )
    }

    /// Unwinds one frame. `pc` is in the object's virtual address space.
    #[instrument(level = "debug", skip(self, regs, process_memory))]
    pub fn step(&self, pc: u64, regs: &mut Regs, process_memory: &dyn Memory) -> Result<()> {
        let fde = self.find_fde(pc)?;
        let rules = self.location_rules(&fde, pc)?;
        eval(&fde.cie, &rules, regs, process_memory)
    }
}

impl fmt::Debug for DwarfSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DwarfSection")
            .field("kind", &self.kind)
            .field("range", &self.range)
            .field("address_size", &self.address_size)
            .field("hdr", &self.hdr.is_some())
            .finish_non_exhaustive()
    }
}

/// Applies a row of the CFI table to `regs`, turning them into the caller's
/// registers. On error `regs` is left as it was.
pub fn eval(
    cie: &Cie,
    rules: &LocationRules,
    regs: &mut Regs,
    process_memory: &dyn Memory,
) -> Result<()> {
    let snapshot = regs.clone();
    let word = |value: u64| {
        if snapshot.is_32bit() {
            value & 0xffff_ffff
        } else {
            value
        }
    };
    let register = |reg: u16| {
        snapshot.get(reg).ok_or_else(|| {
            Error::malformed(format!("register {reg} does not exist on {}", snapshot.arch()))
        })
    };

    let sp_reg = snapshot.sp_reg();
    let cfa = match &rules.cfa {
        CfaRule::RegisterOffset { register: reg, offset } => {
            let base = if *reg == sp_reg && !rules.registers.contains_key(&sp_reg) {
                snapshot.sp()
            } else {
                register(*reg)?
            };
            word(base.wrapping_add(*offset as u64))
        }
        CfaRule::Expression(expr) => word(expr.evaluate(&snapshot, process_memory, None)?),
        CfaRule::Undefined => return Err(Error::malformed("no CFA rule")),
    };
    trace!("cfa = {cfa:#x}");

    let ra_reg = cie.return_address_register;
    let mut return_address = u16::try_from(ra_reg).ok().and_then(|reg| snapshot.get(reg));
    let mut caller = snapshot.clone();

    for (&reg, rule) in &rules.registers {
        let is_ra = u64::from(reg) == ra_reg;
        if usize::from(reg) >= snapshot.total_regs() && !is_ra {
            trace!("skipping register {reg} outside the register set");
            continue;
        }

        let value = match rule {
            RegisterRule::Undefined => {
                if is_ra {
                    return_address = Some(0);
                }
                continue;
            }
            RegisterRule::SameValue => continue,
            RegisterRule::Offset(offset) => {
                snapshot.read_word(process_memory, word(cfa.wrapping_add(*offset as u64)))?
            }
            RegisterRule::ValOffset(offset) => cfa.wrapping_add(*offset as u64),
            RegisterRule::Register { reg: from, offset } => {
                register(*from)?.wrapping_add(*offset as u64)
            }
            RegisterRule::Expression(expr) => {
                let addr = expr.evaluate(&snapshot, process_memory, Some(cfa))?;
                snapshot.read_word(process_memory, addr)?
            }
            RegisterRule::ValExpression(expr) => {
                expr.evaluate(&snapshot, process_memory, Some(cfa))?
            }
        };
        let value = word(value);
        trace!("r{reg} = {value:#x} ({rule:?})");

        if is_ra {
            return_address = Some(value);
        }
        caller.set(reg, value);
    }

    let Some(pc) = return_address else {
        return Err(Error::malformed(format!(
            "return address column {ra_reg} has no rule and is not a register of {}",
            snapshot.arch()
        )));
    };
    caller.set_pc(pc);
    caller.set_sp(cfa);
    debug!("dwarf step: pc {pc:#x}, sp {cfa:#x}");
    *regs = caller;
    Ok(())
}
