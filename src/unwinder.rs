//! The step loop. Every step finds the map owning the pc, asks its object
//! file to recover the caller's registers and records the caller as a new
//! frame, until the stack ends or something goes wrong.


use std::{fmt, sync::Arc};

use crate::{
    elf::{Elf, ElfLoader, UnwindSource},
    maps::{MapFlags, MapInfo, Maps},
    memory::Memory,
    regs::{ArchKind, Regs},
    Error,
};

const MAX_FRAMES_VAR: &str = "UWUSTACK_MAX_FRAMES";

/// Limits, per-architecture source order and map filters of an unwind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindConfig {
    /// Frames recorded at most, the initial frame included.
    pub max_frames: usize,
    pub arm_order: Vec<UnwindSource>,
    /// Order for every architecture but ARM.
    pub default_order: Vec<UnwindSource>,
    /// Map basenames whose frames are left out until the first frame has
    /// been recorded.
    pub skip_initial_maps: Vec<String>,
    /// Map name suffixes, after the last `.`, that end the unwind before
    /// their frame is recorded.
    pub stop_at_map_suffixes: Vec<String>,
}

impl Default for UnwindConfig {
    fn default() -> Self {
        Self {
            max_frames: 64,
            arm_order: vec![
                UnwindSource::ArmExidx,
                UnwindSource::EhFrame,
                UnwindSource::DebugFrame,
            ],
            default_order: vec![UnwindSource::EhFrame, UnwindSource::DebugFrame],
            skip_initial_maps: Vec::new(),
            stop_at_map_suffixes: Vec::new(),
        }
    }
}

impl UnwindConfig {
    /// The defaults, with `UWUSTACK_MAX_FRAMES` applied if it is set.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = var(MAX_FRAMES_VAR) {
            match value.trim().parse() {
                Ok(max_frames) => config.max_frames = max_frames,
                Err(err) => warn!("ignoring {MAX_FRAMES_VAR}={value:?}: {err}"),
            }
        }
        config
    }

    pub fn with_max_frames(self, max_frames: usize) -> Self {
        Self { max_frames, ..self }
    }

    pub fn with_arm_order(self, arm_order: impl Into<Vec<UnwindSource>>) -> Self {
        Self {
            arm_order: arm_order.into(),
            ..self
        }
    }

    pub fn with_default_order(self, default_order: impl Into<Vec<UnwindSource>>) -> Self {
        Self {
            default_order: default_order.into(),
            ..self
        }
    }

    pub fn with_skip_initial_maps<S: Into<String>>(
        self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            skip_initial_maps: names.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_stop_at_map_suffixes<S: Into<String>>(
        self,
        suffixes: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            stop_at_map_suffixes: suffixes.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    fn skips(&self, map: &MapInfo) -> bool {
        let basename = map.name.rsplit('/').next().unwrap_or_default();
        self.skip_initial_maps.iter().any(|name| name == basename)
    }

    fn stops_at(&self, map: &MapInfo) -> bool {
        let Some((_, suffix)) = map.name.rsplit_once('.') else {
            return false;
        };
        self.stop_at_map_suffixes.iter().any(|stop| stop == suffix)
    }

    /// The sources to try for objects of `arch`, in order.
    pub fn order(&self, arch: ArchKind) -> &[UnwindSource] {
        match arch {
            ArchKind::Arm => &self.arm_order,
            _ => &self.default_order,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwindState {
    /// Holds the registers of the innermost frame.
    Ready(Regs),
    /// Holds the registers the last step recovered.
    Stepped(Regs),
    Done,
    Failed(Error),
}

/// One frame of a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameData {
    pub num: usize,
    pub arch: ArchKind,
    /// Absolute pc. For every frame but the innermost one it is moved back
    /// into the call instruction.
    pub pc: u64,
    /// `pc` relative to the object file, adjusted the same way.
    pub rel_pc: u64,
    pub sp: u64,
    pub map_name: String,
    pub map_start: u64,
    pub map_end: u64,
    pub map_offset: u64,
    pub map_flags: MapFlags,
    pub load_bias: u64,
    pub function_name: Option<String>,
    pub function_offset: u64,
}

impl fmt::Display for FrameData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = if self.arch.is_32bit() { 8 } else { 16 };
        write!(f, "  #{:02} pc {:0width$x}  ", self.num, self.rel_pc)?;
        if self.map_name.is_empty() {
            write!(f, "<anonymous:{:x}>", self.map_start)?;
        } else {
            f.write_str(&self.map_name)?;
        }
        if self.map_offset != 0 {
            write!(f, " (offset {:#x})", self.map_offset)?;
        }
        if let Some(name) = &self.function_name {
            write!(f, " ({name}+{})", self.function_offset)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed(Error),
}

/// The result of a full unwind. Frames are innermost first and are kept
/// when the unwind fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub frames: Vec<FrameData>,
    pub outcome: Outcome,
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "{frame}")?;
        }
        Ok(())
    }
}

/// Unwinds one thread, one frame per [`step`](Self::step).
pub struct Unwinder<'a> {
    maps: &'a Maps,
    process_memory: Arc<dyn Memory>,
    loader: &'a dyn ElfLoader,
    config: UnwindConfig,
    state: UnwindState,
    frames: Vec<FrameData>,
    /// Successful steps so far, skipped frames included.
    steps: usize,
}

impl<'a> Unwinder<'a> {
    /// Records the frame described by `regs` and gets ready to unwind it.
    /// With map filters configured, the frame may be skipped or the unwind
    /// may be over right away.
    pub fn new(
        maps: &'a Maps,
        process_memory: Arc<dyn Memory>,
        loader: &'a dyn ElfLoader,
        regs: Regs,
        config: UnwindConfig,
    ) -> Self {
        let mut unwinder = Self {
            maps,
            process_memory,
            loader,
            config,
            state: UnwindState::Done,
            frames: Vec::new(),
            steps: 0,
        };
        unwinder.state = unwinder.enter(regs);
        unwinder
    }

    pub fn state(&self) -> &UnwindState {
        &self.state
    }

    pub fn frames(&self) -> &[FrameData] {
        &self.frames
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, UnwindState::Done | UnwindState::Failed(_))
    }

    /// Unwinds one frame. Does nothing once the unwind has finished.
    #[instrument(level = "debug", skip(self), fields(frame = self.frames.len()))]
    pub fn step(&mut self) -> &UnwindState {
        if let UnwindState::Ready(regs) | UnwindState::Stepped(regs) = &self.state {
            let regs = regs.clone();
            self.state = self.next_state(regs);
        }
        &self.state
    }

    /// Steps until the unwind finishes.
    pub fn unwind(mut self) -> Trace {
        let outcome = loop {
            match self.step() {
                UnwindState::Ready(_) | UnwindState::Stepped(_) => {}
                UnwindState::Done => break Outcome::Done,
                UnwindState::Failed(err) => break Outcome::Failed(err.clone()),
            }
        };
        Trace {
            frames: self.frames,
            outcome,
        }
    }

    fn next_state(&mut self, regs: Regs) -> UnwindState {
        if self.frames.len() >= self.config.max_frames {
            debug!("reached the limit of {} frames", self.config.max_frames);
            return UnwindState::Done;
        }

        let maps = self.maps;
        let (pc, sp) = (regs.pc(), regs.sp());
        let Some(map) = maps.find(pc) else {
            debug!("no map contains pc {pc:#x}");
            return UnwindState::Failed(Error::MapNotFound { pc });
        };
        if is_device(Some(map)) || is_device(maps.find(sp)) {
            debug!("pc {pc:#x} or sp {sp:#x} is in a device map");
            return UnwindState::Failed(Error::NoUnwindInfo { pc });
        }
        let Some(elf) = self.elf(map) else {
            return UnwindState::Failed(Error::NoUnwindInfo { pc });
        };

        let innermost = self.steps == 0;
        let rel_pc = map
            .rel_pc(pc, elf.load_bias())
            .wrapping_sub(pc_adjustment(map, elf, &regs, innermost));
        trace!("unwinding pc {pc:#x} (rel_pc {rel_pc:#x}) in {:?}", map.name);

        let mut caller = regs.clone();
        let order = self.config.order(regs.arch());
        if let Err(err) = elf.step(rel_pc, &mut caller, &*self.process_memory, order) {
            debug!("step failed: {err}");
            return UnwindState::Failed(err);
        }

        if caller.pc() == 0 {
            debug!("reached the end of the stack");
            return UnwindState::Done;
        }
        if caller.pc() == pc && caller.sp() == sp {
            warn!("no progress at pc {pc:#x} sp {sp:#x}");
            return UnwindState::Failed(Error::NonProgress { pc, sp });
        }

        self.steps += 1;
        self.enter(caller)
    }

    /// Records the frame for `regs` unless a map filter says otherwise.
    fn enter(&mut self, regs: Regs) -> UnwindState {
        let map = self.maps.find(regs.pc());
        if let Some(map) = map.filter(|map| self.config.stops_at(map)) {
            debug!("stopping at {:?}", map.name);
            return UnwindState::Done;
        }

        match map {
            Some(map) if self.frames.is_empty() && self.config.skips(map) => {
                debug!("skipping frame at pc {:#x} in {:?}", regs.pc(), map.name);
            }
            _ => {
                let frame = self.frame_data(&regs, self.steps == 0);
                trace!("recorded frame {}: pc {:#x} sp {:#x}", frame.num, frame.pc, frame.sp);
                self.frames.push(frame);
            }
        }

        if self.steps == 0 {
            UnwindState::Ready(regs)
        } else {
            UnwindState::Stepped(regs)
        }
    }

    fn elf(&self, map: &'a MapInfo) -> Option<&'a Elf> {
        if is_device(Some(map)) {
            return None;
        }
        map.elf(&self.process_memory, self.loader)
    }

    fn frame_data(&self, regs: &Regs, innermost: bool) -> FrameData {
        let num = self.frames.len();
        let (pc, sp) = (regs.pc(), regs.sp());
        let mut frame = FrameData {
            num,
            arch: regs.arch(),
            pc,
            rel_pc: pc,
            sp,
            map_name: String::new(),
            map_start: 0,
            map_end: 0,
            map_offset: 0,
            map_flags: MapFlags::empty(),
            load_bias: 0,
            function_name: None,
            function_offset: 0,
        };

        let Some(map) = self.maps.find(pc) else {
            return frame;
        };
        frame.map_name = map.name.clone();
        frame.map_start = map.start;
        frame.map_end = map.end;
        frame.map_offset = map.offset;
        frame.map_flags = map.flags;

        match self.elf(map) {
            Some(elf) => {
                let adjustment = pc_adjustment(map, elf, regs, innermost);
                let rel_pc = map.rel_pc(pc, elf.load_bias()).wrapping_sub(adjustment);
                frame.pc = pc.wrapping_sub(adjustment);
                frame.rel_pc = rel_pc;
                frame.load_bias = elf.load_bias();
                if let Some((name, offset)) = elf.function_name(rel_pc) {
                    frame.function_name = Some(name);
                    frame.function_offset = offset;
                }
            }
            None => frame.rel_pc = map.rel_pc(pc, 0),
        }
        frame
    }
}

impl fmt::Debug for Unwinder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unwinder")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("frames", &self.frames.len())
            .finish_non_exhaustive()
    }
}

fn is_device(map: Option<&MapInfo>) -> bool {
    map.is_some_and(|map| map.flags.contains(MapFlags::DEVICE_MAP))
}

/// Return addresses point past the call, so every frame but the innermost
/// one is looked up slightly earlier.
fn pc_adjustment(map: &MapInfo, elf: &Elf, regs: &Regs, innermost: bool) -> u64 {
    if innermost {
        return 0;
    }
    let rel_pc = map.rel_pc(regs.pc(), elf.load_bias());
    regs.pc_adjustment(rel_pc, elf.load_bias(), &**elf.memory())
}
