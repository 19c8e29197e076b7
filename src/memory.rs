//! Byte access to the memory of a process, a captured snapshot or an object
//! file.
//!
//! Everything above this module reads through [`Memory`] and never learns
//! which backing store answered.


use std::{
    fs::File,
    io::{self, Read},
    path::Path,
    sync::Arc,
};

use memmap2::Mmap;

use crate::{Error, Result};

pub trait Memory: Send + Sync {
    /// Copies up to `dst.len()` bytes starting at `addr` into `dst` and
    /// returns how many were copied. Short reads are not errors here.
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize;

    fn read_fully(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        let len = dst.len();
        if self.read(addr, dst) == len {
            Ok(())
        } else {
            Err(Error::MemoryReadFailure { addr, len })
        }
    }

    fn read_u8(&self, addr: u64) -> Result<u8> {
        let mut buf = [0; 1];
        self.read_fully(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16> {
        let mut buf = [0; 2];
        self.read_fully(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut buf = [0; 4];
        self.read_fully(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0; 8];
        self.read_fully(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl<M: Memory + ?Sized> Memory for Arc<M> {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        (**self).read(addr, dst)
    }
}

impl<M: Memory + ?Sized> Memory for &M {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        (**self).read(addr, dst)
    }
}

fn read_from_slice(data: &[u8], offset: u64, dst: &mut [u8]) -> usize {
    let Ok(offset) = usize::try_from(offset) else {
        return 0;
    };
    let Some(available) = data.len().checked_sub(offset) else {
        return 0;
    };
    let len = dst.len().min(available);
    dst[..len].copy_from_slice(&data[offset..offset + len]);
    len
}

/// Memory backed by an owned buffer whose first byte lives at `base`.
#[derive(Debug, Clone, Default)]
pub struct MemoryBuffer {
    base: u64,
    data: Vec<u8>,
}

impl MemoryBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_base(0, data)
    }

    pub fn with_base(base: u64, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Memory for MemoryBuffer {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        match addr.checked_sub(self.base) {
            Some(offset) => read_from_slice(&self.data, offset, dst),
            None => 0,
        }
    }
}

/// A read-only mapping of a file, addressed relative to `offset` in the
/// file.
#[derive(Debug)]
pub struct MemoryFileAtOffset {
    mmap: Mmap,
    offset: usize,
    size: usize,
}

impl MemoryFileAtOffset {
    pub fn open(path: impl AsRef<Path>, offset: u64) -> io::Result<Self> {
        Self::open_with_size(path, offset, u64::MAX)
    }

    /// Like [`open`](Self::open), but never exposes more than `size` bytes.
    pub fn open_with_size(path: impl AsRef<Path>, offset: u64, size: u64) -> io::Result<Self> {
        let file = File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset {offset:#x} is past the end of the file ({file_len:#x} bytes)"),
            ));
        }

        // SAFETY: the mapping is read-only. A file truncated underneath us is
        // the same hazard every mmap-based reader accepts.
        let mmap = unsafe { Mmap::map(&file)? };

        let size = (file_len - offset).min(size);
        let (Ok(offset), Ok(size)) = (usize::try_from(offset), usize::try_from(size)) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file region does not fit in the address space",
            ));
        };
        trace!(?offset, ?size, "mapped file {:?}", path.as_ref());

        Ok(Self { mmap, offset, size })
    }

    pub fn size(&self) -> u64 {
        self.size as u64
    }
}

impl Memory for MemoryFileAtOffset {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let region = &self.mmap[self.offset..self.offset + self.size];
        read_from_slice(region, addr, dst)
    }
}

/// A window of `length` bytes of another memory.
///
/// Reads at `offset + n` are served from `begin + n` of the backing memory.
#[derive(Clone)]
pub struct MemoryRange {
    memory: Arc<dyn Memory>,
    begin: u64,
    length: u64,
    offset: u64,
}

impl MemoryRange {
    pub fn new(memory: Arc<dyn Memory>, begin: u64, length: u64, offset: u64) -> Self {
        Self {
            memory,
            begin,
            length,
            offset,
        }
    }
}

impl std::fmt::Debug for MemoryRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRange")
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("length", &format_args!("{:#x}", self.length))
            .field("offset", &format_args!("{:#x}", self.offset))
            .finish_non_exhaustive()
    }
}

impl Memory for MemoryRange {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let Some(read_offset) = addr.checked_sub(self.offset) else {
            return 0;
        };
        if read_offset >= self.length {
            return 0;
        }
        let Some(read_addr) = self.begin.checked_add(read_offset) else {
            return 0;
        };
        let len = (dst.len() as u64).min(self.length - read_offset) as usize;
        self.memory.read(read_addr, &mut dst[..len])
    }
}

/// A memory snapshot file. The first eight bytes hold the address of the
/// first snapshot byte, the rest is the snapshot itself.
#[derive(Debug)]
pub struct MemoryOffline {
    range: MemoryRange,
}

impl MemoryOffline {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let mut header = [0; 8];
        File::open(path)?.read_exact(&mut header)?;
        let start = u64::from_le_bytes(header);

        let file = MemoryFileAtOffset::open(path, 0)?;
        let size = file.size() - header.len() as u64;
        debug!(?size, "offline memory {path:?} starts at {start:#x}");

        Ok(Self {
            range: MemoryRange::new(Arc::new(file), header.len() as u64, size, start),
        })
    }
}

impl Memory for MemoryOffline {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        self.range.read(addr, dst)
    }
}

/// Memory of another live process, read with `process_vm_readv`.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone, Copy)]
pub struct MemoryRemote {
    pid: libc::pid_t,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl MemoryRemote {
    pub fn new(pid: libc::pid_t) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Memory for MemoryRemote {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        process_vm_read(self.pid, addr, dst)
    }
}

/// Memory of the calling process.
///
/// This goes through `process_vm_readv` on our own pid so that unmapped
/// addresses come back as short reads instead of faults.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryLocal;

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Memory for MemoryLocal {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        // SAFETY: getpid has no preconditions.
        let pid = unsafe { libc::getpid() };
        process_vm_read(pid, addr, dst)
    }
}

/// A single `process_vm_readv` call never splits an iovec, so the remote side
/// is cut at page boundaries to let a read stop exactly where the mapping
/// ends.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn process_vm_read(pid: libc::pid_t, addr: u64, dst: &mut [u8]) -> usize {
    const MAX_IOVECS: usize = 64;

    // SAFETY: sysconf has no preconditions.
    let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as u64,
        _ => 4096,
    };

    let mut cur = addr;
    let mut total_read = 0;
    while total_read < dst.len() {
        let remaining = &mut dst[total_read..];
        let mut len = remaining.len();
        let local = libc::iovec {
            iov_base: remaining.as_mut_ptr().cast(),
            iov_len: len,
        };

        let mut remote = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_IOVECS];
        let mut used = 0;
        let mut requested = 0;
        while len > 0 && used < MAX_IOVECS {
            let Ok(base) = usize::try_from(cur) else {
                return total_read;
            };
            let misalignment = cur & (page_size - 1);
            let iov_len = ((page_size - misalignment) as usize).min(len);
            remote[used] = libc::iovec {
                iov_base: base as *mut libc::c_void,
                iov_len,
            };
            used += 1;
            len -= iov_len;
            requested += iov_len;
            let Some(next) = cur.checked_add(iov_len as u64) else {
                break;
            };
            cur = next;
        }

        // SAFETY: `local` points into `dst`, which is live and at least
        // `requested` bytes long. The remote iovecs are only read by the
        // kernel.
        let rc = unsafe { libc::process_vm_readv(pid, &local, 1, remote.as_ptr(), used as _, 0) };
        if rc <= 0 {
            trace!(?pid, ?total_read, "process_vm_readv failed for {addr:#x}");
            return total_read;
        }
        total_read += rc as usize;
        if (rc as usize) < requested {
            return total_read;
        }
    }
    total_read
}
