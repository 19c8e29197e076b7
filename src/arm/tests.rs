use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{prel31_addr, ExidxTable};
use crate::{
    memory::{Memory, MemoryBuffer},
    regs::{ArchKind, Regs, ARM_REG_LR, ARM_REG_PC, ARM_REG_SP},
    Error,
};

/// Sparse memory that can be rewritten while a table holds on to it.
#[derive(Default)]
pub(crate) struct FakeMemory(Mutex<BTreeMap<u64, u8>>);

impl FakeMemory {
    pub(crate) fn set32(&self, addr: u64, value: u32) {
        let mut bytes = self.0.lock().unwrap();
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            bytes.insert(addr + i as u64, byte);
        }
    }
}

impl Memory for FakeMemory {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let bytes = self.0.lock().unwrap();
        for (i, slot) in dst.iter_mut().enumerate() {
            match bytes.get(&(addr + i as u64)) {
                Some(byte) => *slot = *byte,
                None => return i,
            }
        }
        dst.len()
    }
}

pub(crate) fn prel31_encode(offset: u32, target: u32) -> u32 {
    target.wrapping_sub(offset) & 0x7fff_ffff
}

fn table(memory: &Arc<FakeMemory>, start_offset: u64, entries: usize) -> ExidxTable {
    ExidxTable::new(memory.clone(), start_offset, entries, 0)
}

#[test]
fn prel31_round_trip() {
    let mut rng = StdRng::seed_from_u64(0x31);
    for _ in 0..1000 {
        let offset: u32 = rng.gen_range(0x1000_0000..0x5000_0000);
        let delta: i32 = rng.gen_range(-0x3fff_ffff..0x3fff_ffff);
        let target = offset.wrapping_add(delta as u32);

        assert_eq!(prel31_addr(offset, prel31_encode(offset, target)), target);
    }

    // bit 31 is not part of the value
    assert_eq!(prel31_addr(0x8000, 0x8000_0010), 0x8010);
    assert_eq!(prel31_addr(0x8000, 0x7fff_ff00), 0x7f00);
}

#[test]
fn find_entry_start_zero() {
    let memory = Arc::new(FakeMemory::default());
    let table = table(&memory, 0, 10);

    assert_eq!(table.find_entry(0x1000), Err(Error::NoUnwindInfo { pc: 0x1000 }));
}

#[test]
fn find_entry_no_entries() {
    let memory = Arc::new(FakeMemory::default());
    let table = table(&memory, 0x100, 0);

    assert_eq!(table.find_entry(0x1000), Err(Error::NoUnwindInfo { pc: 0x1000 }));
}

#[test]
fn find_entry_no_valid_memory() {
    let memory = Arc::new(FakeMemory::default());
    let table = table(&memory, 0x100, 2);

    assert_eq!(
        table.find_entry(0x1000),
        Err(Error::MemoryReadFailure { addr: 0x100, len: 4 })
    );
}

#[test]
fn find_entry_ip_before_first() {
    let memory = Arc::new(FakeMemory::default());
    memory.set32(0x1000, 0x6000);
    let table = table(&memory, 0x1000, 1);

    assert!(table.find_entry(0x1000).is_err());
}

#[test]
fn find_entry_single_entry_negative_value() {
    let memory = Arc::new(FakeMemory::default());
    memory.set32(0x8000, 0x7fff_ff00);
    let table = table(&memory, 0x8000, 1);

    assert_eq!(table.find_entry(0x7ff0), Ok(0x8000));
}

#[test]
fn find_entry_last_check_single_entry() {
    let memory = Arc::new(FakeMemory::default());
    memory.set32(0x1000, 0x6000);
    let table = table(&memory, 0x1000, 1);

    assert_eq!(table.find_entry(0x7000), Ok(0x1000));

    // the bounds are cached now
    memory.set32(0x1000, 0x8000);
    assert_eq!(table.find_entry(0x7004), Ok(0x1000));
}

#[test]
fn find_entry_last_check_multiple_entries() {
    let memory = Arc::new(FakeMemory::default());
    memory.set32(0x1000, 0x6000);
    memory.set32(0x1008, 0x8000);
    let table = table(&memory, 0x1000, 2);

    assert_eq!(table.find_entry(0x9008), Ok(0x1008));

    memory.set32(0x1000, 0x16000);
    memory.set32(0x1008, 0x18000);
    assert_eq!(table.find_entry(0x9100), Ok(0x1008));
}

#[test]
fn find_entry_multiple_entries_even() {
    let memory = Arc::new(FakeMemory::default());
    memory.set32(0x1000, 0x6000);
    memory.set32(0x1008, 0x7000);
    memory.set32(0x1010, 0x8000);
    memory.set32(0x1018, 0x9000);
    let table = table(&memory, 0x1000, 4);

    assert_eq!(table.find_entry(0x9100), Ok(0x1010));

    memory.set32(0x1000, 0x16000);
    memory.set32(0x1008, 0x17000);
    memory.set32(0x1010, 0x18000);
    memory.set32(0x1018, 0x19000);
    assert_eq!(table.find_entry(0x9100), Ok(0x1010));
}

#[test]
fn find_entry_multiple_entries_odd() {
    let memory = Arc::new(FakeMemory::default());
    memory.set32(0x1000, 0x5000);
    memory.set32(0x1008, 0x6000);
    memory.set32(0x1010, 0x7000);
    memory.set32(0x1018, 0x8000);
    memory.set32(0x1020, 0x9000);
    let table = table(&memory, 0x1000, 5);

    assert_eq!(table.find_entry(0x8100), Ok(0x1010));

    memory.set32(0x1000, 0x15000);
    memory.set32(0x1008, 0x16000);
    memory.set32(0x1010, 0x17000);
    memory.set32(0x1018, 0x18000);
    memory.set32(0x1020, 0x19000);
    assert_eq!(table.find_entry(0x8100), Ok(0x1010));
}

#[test]
fn iterate_caches_entries() {
    let memory = Arc::new(FakeMemory::default());
    for (i, value) in [0x5000, 0x6000, 0x7000, 0x8000, 0x9000].into_iter().enumerate() {
        memory.set32(0x1000 + i as u64 * 8, value);
    }
    let table = table(&memory, 0x1000, 5);

    let expected = vec![0x6000, 0x7008, 0x8010, 0x9018, 0xa020];
    assert_eq!(table.iter().collect::<Result<Vec<_>, _>>(), Ok(expected.clone()));

    for i in 0..5 {
        memory.set32(0x1000 + i * 8, 0x11000);
    }
    assert_eq!(table.iter().collect::<Result<Vec<_>, _>>(), Ok(expected));
}

#[test]
fn two_entries() {
    let memory = Arc::new(FakeMemory::default());
    memory.set32(0x100, prel31_encode(0x100, 0x1000));
    memory.set32(0x108, prel31_encode(0x108, 0x2000));
    let table = table(&memory, 0x100, 2);

    assert_eq!(table.find_entry(0x1500), Ok(0x100));
    assert_eq!(table.find_entry(0x2500), Ok(0x108));
    assert_eq!(table.find_entry(0x500), Err(Error::NoUnwindInfo { pc: 0x500 }));
}

#[test]
fn load_bias_is_subtracted() {
    let memory = Arc::new(FakeMemory::default());
    memory.set32(0x100, prel31_encode(0x100, 0x1000));
    memory.set32(0x108, prel31_encode(0x108, 0x2000));
    let table = ExidxTable::from_program_header(memory, 0x10100, 16, 0x10000);

    assert_eq!(table.start_offset(), 0x100);
    assert_eq!(table.total_entries(), 2);
    assert_eq!(table.find_entry(0x11500), Ok(0x100));
    assert_eq!(table.find_entry(0x12000), Ok(0x108));
    assert!(table.find_entry(0x1500).is_err());
}

#[test]
fn find_entry_matches_linear_scan() {
    let mut rng = StdRng::seed_from_u64(0xe1d);
    for _ in 0..50 {
        let count = rng.gen_range(1..200);
        let mut starts: Vec<u32> = (0..count).map(|_| rng.gen_range(0x1000..0x10_0000)).collect();
        starts.sort_unstable();
        starts.dedup();

        let memory = Arc::new(FakeMemory::default());
        let start_offset = 0x20_0000u64;
        for (i, &start) in starts.iter().enumerate() {
            let offset = start_offset + i as u64 * 8;
            memory.set32(offset, prel31_encode(offset as u32, start));
        }
        let table = table(&memory, start_offset, starts.len());

        for _ in 0..200 {
            let pc = rng.gen_range(0..0x11_0000u64);
            let expected = starts
                .iter()
                .rposition(|&start| u64::from(start) <= pc)
                .map(|idx| start_offset + idx as u64 * 8);

            assert_eq!(table.find_entry(pc).ok(), expected, "pc {pc:#x} in {starts:x?}");
        }
    }
}

#[test]
fn step_with_inline_entry() {
    let elf = Arc::new(FakeMemory::default());
    elf.set32(0x100, prel31_encode(0x100, 0x1000));
    // vsp += 8, pop {r4, r14}
    elf.set32(0x104, 0x8001_a8b0);
    let table = table(&elf, 0x100, 1);

    let stack: Vec<u8> = [0u32, 0, 0x44, 0x2345]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect();
    let stack = MemoryBuffer::with_base(0x8000, stack);

    let mut regs = Regs::new(ArchKind::Arm);
    regs.set_pc(0x1010);
    regs.set_sp(0x8000);

    table.step(0x1010, &mut regs, &stack).unwrap();
    assert_eq!(regs.pc(), 0x2345);
    assert_eq!(regs.get(ARM_REG_PC), Some(0x2345));
    assert_eq!(regs.get(ARM_REG_LR), Some(0x2345));
    assert_eq!(regs.get(4), Some(0x44));
    assert_eq!(regs.sp(), 0x8010);
    assert_eq!(regs.get(ARM_REG_SP), Some(0x8010));
}

#[test]
fn step_cant_unwind() {
    let elf = Arc::new(FakeMemory::default());
    elf.set32(0x100, prel31_encode(0x100, 0x1000));
    elf.set32(0x104, 1);
    let table = table(&elf, 0x100, 1);

    let mut regs = Regs::new(ArchKind::Arm);
    assert_eq!(
        table.step(0x1010, &mut regs, &MemoryBuffer::default()),
        Err(Error::NoUnwindInfo { pc: 0x1010 })
    );
}
