use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uwustack::{
    dwarf::SectionRange,
    elf::Symbols,
    memory::MemoryBuffer,
    ArchKind, ElfInfo, Maps, Memory, Outcome, Regs, UnwindConfig, Unwinder,
};

const LIB_BASE: u64 = 0x5555_0000;
const EH_FRAME: u64 = 0x200;
const STACK_TOP: u64 = 0x7ffe_f000;

const MAPS: &str = "\
55550000-55552000 r-xp 00000000 00:00 0 /demo/libdemo.so
7ffe0000-7fff0000 rw-p 00000000 00:00 0 [stack]
";

/// Process memory stitched together from a few buffers.
struct Process(Vec<MemoryBuffer>);

impl Memory for Process {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        self.0
            .iter()
            .map(|region| region.read(addr, dst))
            .find(|&len| len > 0)
            .unwrap_or(0)
    }
}

struct DemoSymbols;

impl Symbols for DemoSymbols {
    fn function_name(&self, rel_pc: u64) -> Option<(String, u64)> {
        let (name, start) = match rel_pc {
            0x1000..=0x13ff => ("main", 0x1000),
            0x1400..=0x14ff => ("uwu_leaf", 0x1400),
            _ => return None,
        };
        Some((name.to_owned(), rel_pc - start))
    }
}

/// Appends a length-prefixed entry, padded with `DW_CFA_nop`.
fn entry(eh_frame: &mut Vec<u8>, body: &[u8]) {
    let len = body.len().next_multiple_of(4);
    eh_frame.extend_from_slice(&(len as u32).to_le_bytes());
    eh_frame.extend_from_slice(body);
    eh_frame.resize(eh_frame.len() + len - body.len(), 0);
}

fn fde(eh_frame: &mut Vec<u8>, pc: u32, len: u32, instructions: &[u8]) {
    let cie_pointer = (eh_frame.len() + 4) as u32;
    let mut body = Vec::new();
    body.extend_from_slice(&cie_pointer.to_le_bytes());
    body.extend_from_slice(&pc.to_le_bytes());
    body.extend_from_slice(&len.to_le_bytes());
    body.push(0);
    body.extend_from_slice(instructions);
    entry(eh_frame, &body);
}

/// `.eh_frame` with a `zR` CIE and two functions, `main` without a frame and
/// `uwu_leaf` pushing `rbp` first.
fn eh_frame() -> Vec<u8> {
    #[rustfmt::skip]
    let cie = [
        0, 0, 0, 0, // CIE id
        1, // version
        b'z', b'R', 0,
        1, // code alignment
        0x78, // data alignment -8
        16, // return address
        1, 0x03, // augmentation, udata4 pointers
        0x0c, 7, 8, // DW_CFA_def_cfa: RSP +8
        0x90, 1, // DW_CFA_offset: RIP -8
    ];

    let mut eh_frame = Vec::new();
    entry(&mut eh_frame, &cie);
    fde(&mut eh_frame, 0x1000, 0x400, &[]);
    // DW_CFA_advance_loc 1, DW_CFA_def_cfa_offset 16, DW_CFA_offset RBP -16
    fde(&mut eh_frame, 0x1400, 0x100, &[0x41, 0x0e, 0x10, 0x86, 0x02]);
    eh_frame.extend_from_slice(&[0; 4]);
    eh_frame
}

fn library() -> MemoryBuffer {
    let mut image = vec![0; 0x2000];
    image[..4].copy_from_slice(b"\x7fELF");
    let eh_frame = eh_frame();
    let start = EH_FRAME as usize;
    image[start..start + eh_frame.len()].copy_from_slice(&eh_frame);
    MemoryBuffer::with_base(LIB_BASE, image)
}

fn load(memory: &Arc<dyn Memory>) -> Option<ElfInfo> {
    if memory.read_u32(0).ok()? != u32::from_le_bytes(*b"\x7fELF") {
        return None;
    }
    let mut info = ElfInfo::new(ArchKind::X86_64, 0);
    info.eh_frame = Some(SectionRange {
        offset: EH_FRAME,
        vaddr: EH_FRAME,
        size: eh_frame().len() as u64,
    });
    info.symbols = Some(Box::new(DemoSymbols));
    Some(info)
}

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::TRACE.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    // saved rbp, return into main, return into main's caller, end of stack
    let words = [0xdead_beef, LIB_BASE + 0x1100, LIB_BASE + 0x1200, 0u64];
    let stack = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    let stack = MemoryBuffer::with_base(STACK_TOP, stack);
    let process: Arc<dyn Memory> = Arc::new(Process(vec![library(), stack]));

    let maps = Maps::parse(MAPS).unwrap();
    let mut regs = Regs::new(ArchKind::X86_64);
    regs.set_pc(LIB_BASE + 0x1402);
    regs.set_sp(STACK_TOP);

    let trace = Unwinder::new(&maps, process, &load, regs, UnwindConfig::from_env()).unwind();
    print!("{trace}");
    match trace.outcome {
        Outcome::Done => tracing::info!("unwound {} frames", trace.frames.len()),
        Outcome::Failed(err) => tracing::error!("unwinding failed: {err}"),
    }
}
