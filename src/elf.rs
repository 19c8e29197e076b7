//! The per-object unwind interface.
//!
//! Locating sections and program headers is left to an [`ElfLoader`]; this
//! module only turns what it reports into evaluators and picks one of them
//! for every step.


use std::{fmt, sync::Arc};

use crate::{
    arm::ExidxTable,
    dwarf::{DwarfSection, SectionKind, SectionRange},
    memory::Memory,
    regs::{ArchKind, Regs},
    Error, Result,
};

/// The parts of a program header the unwinder needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub vaddr: u64,
    pub memsz: u64,
}

/// Function names for an object, keyed by object-relative pc.
pub trait Symbols: Send + Sync {
    /// The function containing `rel_pc` and how far `rel_pc` is into it.
    fn function_name(&self, rel_pc: u64) -> Option<(String, u64)>;
}

/// What a loader found out about an object. Section offsets address the
/// object memory the loader was given.
pub struct ElfInfo {
    pub arch: ArchKind,
    pub load_bias: u64,
    /// `PT_ARM_EXIDX`
    pub exidx: Option<ProgramHeader>,
    pub eh_frame_hdr: Option<SectionRange>,
    pub eh_frame: Option<SectionRange>,
    pub debug_frame: Option<SectionRange>,
    pub symbols: Option<Box<dyn Symbols>>,
}

impl ElfInfo {
    /// An object without any unwind information yet.
    pub fn new(arch: ArchKind, load_bias: u64) -> Self {
        Self {
            arch,
            load_bias,
            exidx: None,
            eh_frame_hdr: None,
            eh_frame: None,
            debug_frame: None,
            symbols: None,
        }
    }
}

impl fmt::Debug for ElfInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElfInfo")
            .field("arch", &self.arch)
            .field("load_bias", &format_args!("{:#x}", self.load_bias))
            .field("exidx", &self.exidx)
            .field("eh_frame_hdr", &self.eh_frame_hdr)
            .field("eh_frame", &self.eh_frame)
            .field("debug_frame", &self.debug_frame)
            .field("symbols", &self.symbols.is_some())
            .finish()
    }
}

/// Recognizes object files.
pub trait ElfLoader {
    /// Describes the object in `memory`, or `None` if it isn't one.
    fn load(&self, memory: &Arc<dyn Memory>) -> Option<ElfInfo>;
}

impl<F> ElfLoader for F
where
    F: Fn(&Arc<dyn Memory>) -> Option<ElfInfo>,
{
    fn load(&self, memory: &Arc<dyn Memory>) -> Option<ElfInfo> {
        self(memory)
    }
}

/// The tables an object can be unwound with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnwindSource {
    ArmExidx,
    EhFrame,
    DebugFrame,
}

impl fmt::Display for UnwindSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnwindSource::ArmExidx => ".ARM.exidx",
            UnwindSource::EhFrame => ".eh_frame",
            UnwindSource::DebugFrame => ".debug_frame",
        })
    }
}

/// One mapped object file and its unwinders.
pub struct Elf {
    memory: Arc<dyn Memory>,
    arch: ArchKind,
    load_bias: u64,
    exidx: Option<ExidxTable>,
    eh_frame: Option<DwarfSection>,
    debug_frame: Option<DwarfSection>,
    symbols: Option<Box<dyn Symbols>>,
}

impl Elf {
    pub fn new(memory: Arc<dyn Memory>, info: ElfInfo) -> Self {
        let address_size = info.arch.address_size();

        let exidx = match info.exidx {
            Some(header) if info.arch == ArchKind::Arm => Some(ExidxTable::from_program_header(
                Arc::clone(&memory),
                header.vaddr,
                header.memsz,
                info.load_bias,
            )),
            Some(_) => {
                debug!("ignoring PT_ARM_EXIDX in a {} object", info.arch);
                None
            }
            None => None,
        };

        let eh_frame = info.eh_frame.map(|range| {
            let section =
                DwarfSection::new(Arc::clone(&memory), range, SectionKind::EhFrame, address_size);
            match info.eh_frame_hdr {
                Some(hdr) => section.with_eh_frame_hdr(hdr),
                None => section,
            }
        });
        let debug_frame = info.debug_frame.map(|range| {
            DwarfSection::new(
                Arc::clone(&memory),
                range,
                SectionKind::DebugFrame,
                address_size,
            )
        });

        Self {
            memory,
            arch: info.arch,
            load_bias: info.load_bias,
            exidx,
            eh_frame,
            debug_frame,
            symbols: info.symbols,
        }
    }

    pub fn arch(&self) -> ArchKind {
        self.arch
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    /// The object memory, addressed by file offset.
    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    pub fn has_source(&self, source: UnwindSource) -> bool {
        match source {
            UnwindSource::ArmExidx => self.exidx.is_some(),
            UnwindSource::EhFrame => self.eh_frame.is_some(),
            UnwindSource::DebugFrame => self.debug_frame.is_some(),
        }
    }

    pub fn exidx(&self) -> Option<&ExidxTable> {
        self.exidx.as_ref()
    }

    pub fn eh_frame(&self) -> Option<&DwarfSection> {
        self.eh_frame.as_ref()
    }

    pub fn debug_frame(&self) -> Option<&DwarfSection> {
        self.debug_frame.as_ref()
    }

    fn step_with(
        &self,
        source: UnwindSource,
        rel_pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
    ) -> Option<Result<()>> {
        match source {
            UnwindSource::ArmExidx => self
                .exidx
                .as_ref()
                .map(|exidx| exidx.step(rel_pc, regs, process_memory)),
            UnwindSource::EhFrame => self
                .eh_frame
                .as_ref()
                .map(|section| section.step(rel_pc, regs, process_memory)),
            UnwindSource::DebugFrame => self
                .debug_frame
                .as_ref()
                .map(|section| section.step(rel_pc, regs, process_memory)),
        }
    }

    /// Unwinds one frame at the object-relative `rel_pc`, trying the sources
    /// in `order`. The first one that succeeds wins. If none does, the first
    /// error other than [`Error::NoUnwindInfo`] is returned. `regs` is only
    /// written on success.
    #[instrument(level = "debug", skip(self, regs, process_memory))]
    pub fn step(
        &self,
        rel_pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
        order: &[UnwindSource],
    ) -> Result<()> {
        if regs.arch() != self.arch {
            return Err(Error::malformed(format!(
                "{} registers for a {} object",
                regs.arch(),
                self.arch
            )));
        }

        let mut informative = None;
        for &source in order {
            let mut attempt = regs.clone();
            match self.step_with(source, rel_pc, &mut attempt, process_memory) {
                None => trace!("no {source} in this object"),
                Some(Ok(())) => {
                    debug!("unwound with {source}");
                    *regs = attempt;
                    return Ok(());
                }
                Some(Err(err)) => {
                    debug!("{source} failed: {err}");
                    if informative.is_none() && !matches!(err, Error::NoUnwindInfo { .. }) {
                        informative = Some(err);
                    }
                }
            }
        }

        Err(informative.unwrap_or(Error::NoUnwindInfo { pc: rel_pc }))
    }

    pub fn function_name(&self, rel_pc: u64) -> Option<(String, u64)> {
        self.symbols.as_ref()?.function_name(rel_pc)
    }
}

impl fmt::Debug for Elf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Elf")
            .field("arch", &self.arch)
            .field("load_bias", &format_args!("{:#x}", self.load_bias))
            .field("exidx", &self.exidx)
            .field("eh_frame", &self.eh_frame)
            .field("debug_frame", &self.debug_frame)
            .finish_non_exhaustive()
    }
}
