//! ARM exception index tables (`.ARM.exidx`).
//!
//! Source: Exception Handling ABI for the Arm Architecture (EHABI), §5 and §9.
//!
//! The table is a sorted array of 8 byte entries:
//! ```text
//! +-------------------------+----------------------------------+
//! | prel31 function start   | EXIDX_CANTUNWIND (1)             |
//! |                         | or 1ppppppp <three opcode bytes> |
//! |                         | or prel31 offset into .ARM.extab |
//! +-------------------------+----------------------------------+
//! ```
//! An entry covers everything from its function start up to the start of the
//! next entry.

mod exidx;
#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex};

pub use exidx::ArmExidx;

use crate::{memory::Memory, regs::Regs, Error, Result};

/// Decodes a PREL31 value stored at `offset`: a 31 bit signed offset relative
/// to its own location.
pub fn prel31_addr(offset: u32, data: u32) -> u32 {
    let value = ((data << 1) as i32) >> 1;
    offset.wrapping_add(value as u32)
}

#[derive(Debug)]
struct AddrCache {
    /// First and last function start, decoded on first use.
    bounds: Option<(u32, u32)>,
    addrs: Box<[Option<u32>]>,
}

/// The `PT_ARM_EXIDX` table of one object file.
pub struct ExidxTable {
    memory: Arc<dyn Memory>,
    start_offset: u64,
    total_entries: usize,
    load_bias: u64,
    cache: Mutex<AddrCache>,
}

impl ExidxTable {
    /// `start_offset` is where the table starts in `memory` and
    /// `total_entries` how many 8 byte entries it has.
    pub fn new(
        memory: Arc<dyn Memory>,
        start_offset: u64,
        total_entries: usize,
        load_bias: u64,
    ) -> Self {
        Self {
            memory,
            start_offset,
            total_entries,
            load_bias,
            cache: Mutex::new(AddrCache {
                bounds: None,
                addrs: vec![None; total_entries].into_boxed_slice(),
            }),
        }
    }

    /// Builds the table from the `p_vaddr` and `p_memsz` of its program
    /// header.
    pub fn from_program_header(
        memory: Arc<dyn Memory>,
        vaddr: u64,
        memsz: u64,
        load_bias: u64,
    ) -> Self {
        let entries = usize::try_from(memsz / 8).unwrap_or(0);
        Self::new(memory, vaddr.wrapping_sub(load_bias), entries, load_bias)
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn total_entries(&self) -> usize {
        self.total_entries
    }

    fn entry_offset(&self, idx: usize) -> u64 {
        self.start_offset + idx as u64 * 8
    }

    fn read_prel31(&self, idx: usize) -> Result<u32> {
        let offset = self.entry_offset(idx);
        let data = self.memory.read_u32(offset)?;
        Ok(prel31_addr(offset as u32, data))
    }

    fn cached_addr(&self, cache: &mut AddrCache, idx: usize) -> Result<u32> {
        if let Some(addr) = cache.addrs[idx] {
            return Ok(addr);
        }
        let addr = self.read_prel31(idx)?;
        cache.addrs[idx] = Some(addr);
        Ok(addr)
    }

    /// Function start address of entry `idx`, relative to the load bias.
    pub fn entry_addr(&self, idx: usize) -> Result<u32> {
        if idx >= self.total_entries {
            return Err(Error::malformed(format!(
                "exidx entry {idx} out of {} entries",
                self.total_entries
            )));
        }
        let mut cache = self.lock_cache();
        self.cached_addr(&mut cache, idx)
    }

    /// Function start addresses of every entry, in table order.
    pub fn iter(&self) -> impl Iterator<Item = Result<u32>> + '_ {
        (0..self.total_entries).map(|idx| self.entry_addr(idx))
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, AddrCache> {
        // entries are written whole, a poisoned cache is still consistent
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Finds the offset of the entry covering `pc`.
    #[instrument(level = "debug", skip(self))]
    pub fn find_entry(&self, pc: u64) -> Result<u64> {
        let no_info = Error::NoUnwindInfo { pc };
        if self.start_offset == 0 || self.total_entries == 0 {
            return Err(no_info);
        }

        let mut cache = self.lock_cache();
        let bounds = cache.bounds;
        let (first_addr, last_addr) = match bounds {
            Some(bounds) => bounds,
            None => {
                let first = self.cached_addr(&mut cache, 0)?;
                let last = self.cached_addr(&mut cache, self.total_entries - 1)?;
                trace!("exidx covers {first:#x}..{last:#x}");
                cache.bounds = Some((first, last));
                (first, last)
            }
        };

        let Some(pc) = pc.checked_sub(self.load_bias) else {
            return Err(no_info);
        };
        if pc < u64::from(first_addr) {
            return Err(no_info);
        }
        if pc >= u64::from(last_addr) {
            return Ok(self.entry_offset(self.total_entries - 1));
        }

        let mut first = 1;
        let mut last = self.total_entries - 1;
        while first <= last {
            let current = first + (last - first) / 2;
            let addr = u64::from(self.cached_addr(&mut cache, current)?);
            trace!(?first, ?last, ?current, "binary searching for {pc:#x}: {addr:#x}");
            if pc == addr {
                return Ok(self.entry_offset(current));
            }
            if pc < addr {
                if current == first {
                    return Ok(self.entry_offset(current - 1));
                }
                last = current - 1;
            } else {
                if current == last {
                    return Ok(self.entry_offset(current));
                }
                first = current + 1;
            }
        }
        Err(no_info)
    }

    /// Unwinds one frame. `regs` must be an ARM register set.
    pub fn step(&self, pc: u64, regs: &mut Regs, process_memory: &dyn Memory) -> Result<()> {
        let entry_offset = self.find_entry(pc)?;

        let mut exidx = ArmExidx::new(pc, regs, &*self.memory, process_memory);
        exidx.extract_entry_data(entry_offset)?;
        exidx.eval()?;
        let (new_pc, new_sp) = exidx.caller_pc_sp();

        debug!("exidx step: pc {new_pc:#x}, sp {new_sp:#x}");
        regs.set_pc(new_pc);
        regs.set_sp(new_sp);
        Ok(())
    }
}

impl std::fmt::Debug for ExidxTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExidxTable")
            .field("start_offset", &format_args!("{:#x}", self.start_offset))
            .field("total_entries", &self.total_entries)
            .field("load_bias", &format_args!("{:#x}", self.load_bias))
            .finish_non_exhaustive()
    }
}
