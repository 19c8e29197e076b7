//! The `.eh_frame_hdr` section: a sorted table of FDE start addresses that
//! the linker emits next to `.eh_frame`.
//!
//! See <https://refspecs.linuxfoundation.org/LSB_1.3.0/gLSB/gLSB/ehframehdr.html>
//! and <https://refspecs.linuxbase.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/ehframechpt.html>.
//!
//! ```text
//! u8       version (1)
//! u8       eh_frame_ptr_enc
//! u8       fde_count_enc
//! u8       table_enc
//! encoded  eh_frame_ptr
//! encoded  fde_count
//!          (initial_location, fde_address) * fde_count
//! ```
//! Table entries are relative to the start of the header (`datarel`).


use super::{parse::Encoding, section::SectionRange};
use crate::{memory::Memory, Result};

#[derive(Debug, Clone)]
pub(crate) struct EhFrameHdr {
    range: SectionRange,
    address_size: u8,
    /// Virtual address of `.eh_frame`.
    eh_frame_vaddr: u64,
    fde_count: u64,
    table_enc: Encoding,
    /// Object offset of the first table entry.
    table_offset: u64,
    /// Size of one half of a table entry.
    entry_size: u64,
}

impl EhFrameHdr {
    /// Parses the header. `None` means the header is unusable for lookups,
    /// either because it is not version 1 or because its table is missing or
    /// not made of fixed-size entries.
    #[instrument(level = "debug", skip(memory))]
    pub(crate) fn parse(
        memory: &dyn Memory,
        range: SectionRange,
        address_size: u8,
    ) -> Result<Option<Self>> {
        let mut cursor = range.cursor(memory, address_size);

        let version = cursor.read_u8()?;
        let eh_frame_ptr_enc = Encoding(cursor.read_u8()?);
        let fde_count_enc = Encoding(cursor.read_u8()?);
        let table_enc = Encoding(cursor.read_u8()?);

        if version != 1 {
            debug!("eh_frame_hdr version {version} is not 1");
            return Ok(None);
        }
        trace!(?eh_frame_ptr_enc, ?fde_count_enc, ?table_enc, "eh_frame_hdr");

        let eh_frame_vaddr = cursor.read_encoded(eh_frame_ptr_enc, Some(range.vaddr))?;
        if fde_count_enc.is_omit() || table_enc.is_omit() {
            debug!("eh_frame_hdr has no search table");
            return Ok(None);
        }
        let fde_count = cursor.read_encoded(fde_count_enc, Some(range.vaddr))?;

        let Some(entry_size) = table_enc.size(address_size) else {
            debug!(?table_enc, "eh_frame_hdr table entries are not fixed size");
            return Ok(None);
        };

        let table_offset = cursor.pos();
        let table_len = fde_count.saturating_mul(entry_size * 2);
        if table_len > cursor.end() - table_offset {
            warn!("eh_frame_hdr claims {fde_count} entries, more than the section holds");
            return Ok(None);
        }

        trace!("eh_frame at {eh_frame_vaddr:#x}, {fde_count} FDEs");
        Ok(Some(Self {
            range,
            address_size,
            eh_frame_vaddr,
            fde_count,
            table_enc,
            table_offset,
            entry_size,
        }))
    }

    pub(crate) fn eh_frame_vaddr(&self) -> u64 {
        self.eh_frame_vaddr
    }

    pub(crate) fn fde_count(&self) -> u64 {
        self.fde_count
    }

    fn read_entry(&self, memory: &dyn Memory, idx: u64, half: u64) -> Result<u64> {
        let mut cursor = self.range.cursor(memory, self.address_size);
        cursor.set_pos(self.table_offset + (idx * 2 + half) * self.entry_size)?;
        cursor.read_encoded(self.table_enc, Some(self.range.vaddr))
    }

    fn initial_location(&self, memory: &dyn Memory, idx: u64) -> Result<u64> {
        self.read_entry(memory, idx, 0)
    }

    fn fde_address(&self, memory: &dyn Memory, idx: u64) -> Result<u64> {
        self.read_entry(memory, idx, 1)
    }

    /// Finds the virtual address of the FDE with the greatest initial
    /// location that is not above `pc`. The FDE may still end before `pc`.
    pub(crate) fn find(&self, memory: &dyn Memory, pc: u64) -> Result<Option<u64>> {
        if self.fde_count == 0 {
            return Ok(None);
        }

        let mut base = 0;
        let mut len = self.fde_count;
        while len > 1 {
            let mid = base + len / 2;
            let value = self.initial_location(memory, mid)?;

            trace!(?base, ?len, ?mid, "binary searching for {pc:#x}: {value:#x}");

            match pc.cmp(&value) {
                std::cmp::Ordering::Less => {
                    len = mid - base;
                }
                std::cmp::Ordering::Equal => {
                    base = mid;
                    break;
                }
                std::cmp::Ordering::Greater => {
                    len -= mid - base;
                    base = mid;
                }
            }
        }

        if self.initial_location(memory, base)? > pc {
            return Ok(None);
        }
        let fde_address = self.fde_address(memory, base)?;
        debug!("eh_frame_hdr entry {base} for {pc:#x}: FDE at {fde_address:#x}");
        Ok(Some(fde_address))
    }
}
