//! The address space of a process: which regions exist, what backs them, and
//! which object file each of them belongs to.
//!
//! Text maps use the `/proc/<pid>/maps` line format:
//! ```text
//! 6f000000-6f01e000 rwxp 00000000 00:0c 16389419   /system/lib/libcomposer.so
//! ```
//!
//! Offline maps are a flat sequence of little-endian records:
//! ```text
//! u64 start | u64 end | u64 offset | u16 flags | u16 name_len | name
//! ```

#[cfg(test)]
mod tests;

use std::{
    path::Path,
    sync::{Arc, OnceLock},
};

use bitflags::bitflags;
use scroll::{Pread, LE};

use crate::{
    elf::{Elf, ElfLoader},
    memory::{Memory, MemoryFileAtOffset, MemoryRange},
    MapsError,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u16 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
        /// Backed by a device. Reading it can have side effects, so it is
        /// never unwound through.
        const DEVICE_MAP = 0x8000;
    }
}

/// One region of the address space.
///
/// The object file handle is created on first use and owned by the region.
#[derive(Debug)]
pub struct MapInfo {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub flags: MapFlags,
    pub name: String,
    elf: OnceLock<Option<Elf>>,
}

impl MapInfo {
    pub fn new(
        start: u64,
        end: u64,
        offset: u64,
        flags: MapFlags,
        name: impl Into<String>,
    ) -> Self {
        Self {
            start,
            end,
            offset,
            flags,
            name: name.into(),
            elf: OnceLock::new(),
        }
    }

    /// Parses one `/proc/<pid>/maps` line. A trailing newline is allowed.
    pub fn parse_line(line: &str) -> Option<MapInfo> {
        let line = line.strip_suffix('\n').unwrap_or(line);

        let (start, rest) = take_hex(line)?;
        let rest = rest.strip_prefix('-')?;
        let (end, rest) = take_hex(rest)?;
        let rest = skip_whitespace(rest)?;

        let perms_len = rest.find(char::is_whitespace)?;
        let (perms, rest) = rest.split_at(perms_len);
        let perms = perms.as_bytes();
        if perms.len() != 4 {
            return None;
        }
        let rest = skip_whitespace(rest)?;

        let (offset, rest) = take_hex(rest)?;
        let rest = skip_whitespace(rest)?;

        // device major:minor, unused
        let (_, rest) = take_hex(rest)?;
        let rest = rest.strip_prefix(':')?;
        let (_, rest) = take_hex(rest)?;
        let rest = skip_whitespace(rest)?;

        let inode_len = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if inode_len == 0 {
            return None;
        }
        let rest = &rest[inode_len..];
        let name = if rest.is_empty() {
            ""
        } else {
            skip_whitespace(rest)?
        };

        let mut flags = MapFlags::empty();
        if perms[0] == b'r' {
            flags |= MapFlags::READ;
        }
        if perms[1] == b'w' {
            flags |= MapFlags::WRITE;
        }
        if perms[2] == b'x' {
            flags |= MapFlags::EXEC;
        }
        if name.starts_with("/dev/") && !name.starts_with("/dev/ashmem/") {
            flags |= MapFlags::DEVICE_MAP;
        }

        Some(MapInfo::new(start, end, offset, flags, name))
    }

    pub fn contains(&self, pc: u64) -> bool {
        (self.start..self.end).contains(&pc)
    }

    /// Translates an absolute pc into the address space of the object file.
    pub fn rel_pc(&self, pc: u64, load_bias: u64) -> u64 {
        pc.wrapping_sub(self.start).wrapping_add(load_bias)
    }

    /// The object file mapped here, created on first call. `None` if the
    /// loader does not recognize the region, which is also remembered.
    pub fn elf(&self, process_memory: &Arc<dyn Memory>, loader: &dyn ElfLoader) -> Option<&Elf> {
        self.elf
            .get_or_init(|| {
                let memory = self.create_memory(process_memory);
                let info = loader.load(&memory);
                if info.is_none() {
                    debug!(
                        "no object file for map {:#x}-{:#x} {:?}",
                        self.start, self.end, self.name
                    );
                }
                info.map(|info| Elf::new(memory, info))
            })
            .as_ref()
    }

    /// The object file, if [`elf`](Self::elf) has created one already.
    pub fn cached_elf(&self) -> Option<&Elf> {
        self.elf.get().and_then(Option::as_ref)
    }

    fn create_memory(&self, process_memory: &Arc<dyn Memory>) -> Arc<dyn Memory> {
        if !self.name.is_empty() && !self.flags.contains(MapFlags::DEVICE_MAP) {
            match MemoryFileAtOffset::open(&self.name, self.offset) {
                Ok(file) => return Arc::new(file),
                Err(err) => trace!("cannot map {:?}: {err}, using process memory", self.name),
            }
        }
        Arc::new(MemoryRange::new(
            Arc::clone(process_memory),
            self.start,
            self.end - self.start,
            0,
        ))
    }
}

fn take_hex(s: &str) -> Option<(u64, &str)> {
    let len = s.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(s.len());
    if len == 0 {
        return None;
    }
    let value = u64::from_str_radix(&s[..len], 16).ok()?;
    Some((value, &s[len..]))
}

/// Skips at least one whitespace character.
fn skip_whitespace(s: &str) -> Option<&str> {
    let trimmed = s.trim_start();
    if trimmed.len() == s.len() {
        None
    } else {
        Some(trimmed)
    }
}

/// All regions of one address space, sorted by start address.
#[derive(Debug, Default)]
pub struct Maps {
    maps: Vec<MapInfo>,
}

impl Maps {
    /// Sorts `maps` and checks that no two of them overlap.
    pub fn new(mut maps: Vec<MapInfo>) -> Result<Self, MapsError> {
        maps.sort_by_key(|map| map.start);

        let mut prev_end = None;
        for map in &maps {
            if map.start >= map.end {
                return Err(MapsError::EmptyRegion {
                    start: map.start,
                    end: map.end,
                });
            }
            if prev_end.is_some_and(|prev_end| map.start < prev_end) {
                return Err(MapsError::Overlap {
                    start: map.start,
                    end: map.end,
                });
            }
            prev_end = Some(map.end);
        }

        Ok(Self { maps })
    }

    /// Parses the text format. Any line that does not parse fails the whole
    /// table.
    pub fn parse(text: &str) -> Result<Self, MapsError> {
        let maps = text
            .lines()
            .enumerate()
            .map(|(idx, line)| {
                MapInfo::parse_line(line).ok_or_else(|| MapsError::InvalidLine {
                    line_number: idx + 1,
                    line: line.to_owned(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!("parsed {} maps", maps.len());
        Self::new(maps)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MapsError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn for_pid(pid: i32) -> Result<Self, MapsError> {
        Self::from_file(format!("/proc/{pid}/maps"))
    }

    pub fn local() -> Result<Self, MapsError> {
        Self::from_file("/proc/self/maps")
    }

    /// Parses the binary offline format.
    pub fn parse_offline(bytes: &[u8]) -> Result<Self, MapsError> {
        let mut maps = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let record = offset;
            let truncated = |_: scroll::Error| MapsError::Truncated { offset: record };

            let start: u64 = bytes.gread_with(&mut offset, LE).map_err(truncated)?;
            let end: u64 = bytes.gread_with(&mut offset, LE).map_err(truncated)?;
            let map_offset: u64 = bytes.gread_with(&mut offset, LE).map_err(truncated)?;
            let flags: u16 = bytes.gread_with(&mut offset, LE).map_err(truncated)?;
            let name_len: u16 = bytes.gread_with(&mut offset, LE).map_err(truncated)?;

            let name = bytes
                .get(offset..offset + usize::from(name_len))
                .ok_or(MapsError::Truncated { offset: record })?;
            offset += usize::from(name_len);

            maps.push(MapInfo::new(
                start,
                end,
                map_offset,
                MapFlags::from_bits_truncate(flags),
                String::from_utf8_lossy(name),
            ));
        }
        debug!("parsed {} offline maps", maps.len());
        Self::new(maps)
    }

    pub fn from_offline_file(path: impl AsRef<Path>) -> Result<Self, MapsError> {
        let bytes = std::fs::read(path)?;
        Self::parse_offline(&bytes)
    }

    /// The region containing `pc`.
    pub fn find(&self, pc: u64) -> Option<&MapInfo> {
        let idx = self.maps.partition_point(|map| map.end <= pc);
        self.maps.get(idx).filter(|map| map.contains(pc))
    }

    pub fn get(&self, idx: usize) -> Option<&MapInfo> {
        self.maps.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MapInfo> {
        self.maps.iter()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}
