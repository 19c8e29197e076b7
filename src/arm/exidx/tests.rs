use super::ArmExidx;
use crate::{
    arm::tests::{prel31_encode, FakeMemory},
    memory::MemoryBuffer,
    regs::{ArchKind, Regs, ARM_REG_LR, ARM_REG_PC, ARM_REG_SP},
    Error, Result,
};

const SP: u64 = 0x10000;

fn stack_at(base: u64, words: &[u32]) -> MemoryBuffer {
    MemoryBuffer::with_base(base, words.iter().flat_map(|w| w.to_le_bytes()).collect())
}

fn arm_regs() -> Regs {
    let mut regs = Regs::new(ArchKind::Arm);
    regs.set_pc(0x1000);
    regs.set_sp(SP);
    regs.set(ARM_REG_LR, 0x4444);
    regs
}

/// Runs `ops` and returns the final vsp and the caller's pc.
fn run(ops: &[u8], regs: &mut Regs, stack: &MemoryBuffer) -> Result<(u32, u64)> {
    let elf = MemoryBuffer::default();
    let mut exidx = ArmExidx::new(0x1000, regs, &elf, stack);
    exidx.data.extend(ops);
    exidx.eval()?;
    Ok((exidx.cfa(), exidx.caller_pc_sp().0))
}

fn cfa_after(ops: &[u8]) -> Result<u32> {
    let mut regs = arm_regs();
    run(ops, &mut regs, &MemoryBuffer::default()).map(|(cfa, _)| cfa)
}

fn is_malformed<T: std::fmt::Debug>(result: Result<T>) -> bool {
    matches!(result, Err(Error::MalformedTable(_)))
}

#[test]
fn vsp_increment() {
    assert_eq!(cfa_after(&[0x00]), Ok(0x10004));
    assert_eq!(cfa_after(&[0x3f]), Ok(0x10100));
    assert_eq!(cfa_after(&[0x01, 0x02]), Ok(0x10014));
}

#[test]
fn vsp_decrement() {
    assert_eq!(cfa_after(&[0x40]), Ok(0xfffc));
    assert_eq!(cfa_after(&[0x7f]), Ok(0xff00));
}

#[test]
fn refuse_to_unwind() {
    assert_eq!(cfa_after(&[0x80, 0x00]), Err(Error::NoUnwindInfo { pc: 0x1000 }));
}

#[test]
fn pop_under_mask() {
    // r4 and r15
    let stack = stack_at(SP, &[0x44, 0x1234]);
    let mut regs = arm_regs();
    let (cfa, pc) = run(&[0x88, 0x01], &mut regs, &stack).unwrap();

    assert_eq!(cfa, 0x10008);
    assert_eq!(pc, 0x1234);
    assert_eq!(regs.get(4), Some(0x44));
    assert_eq!(regs.get(ARM_REG_PC), Some(0x1234));
}

#[test]
fn pop_sp_under_mask_moves_vsp() {
    let stack = stack_at(SP, &[0x9000]);
    let mut regs = arm_regs();
    let (cfa, pc) = run(&[0x82, 0x00], &mut regs, &stack).unwrap();

    assert_eq!(cfa, 0x9000);
    assert_eq!(regs.get(ARM_REG_SP), Some(0x9000));
    // no pc popped, return through lr
    assert_eq!(pc, 0x4444);
}

#[test]
fn vsp_from_register() {
    let mut regs = arm_regs();
    regs.set(7, 0x2_0000);
    let (cfa, _) = run(&[0x97], &mut regs, &MemoryBuffer::default()).unwrap();
    assert_eq!(cfa, 0x2_0000);

    assert!(is_malformed(cfa_after(&[0x9d])));
    assert!(is_malformed(cfa_after(&[0x9f])));
}

#[test]
fn pop_register_range() {
    let stack = stack_at(SP, &[4, 5, 6, 0x5678]);

    let mut regs = arm_regs();
    let (cfa, pc) = run(&[0xa2], &mut regs, &stack).unwrap();
    assert_eq!(cfa, 0x1000c);
    assert_eq!((regs.get(4), regs.get(5), regs.get(6)), (Some(4), Some(5), Some(6)));
    assert_eq!(pc, 0x4444);

    let mut regs = arm_regs();
    let (cfa, pc) = run(&[0xaa], &mut regs, &stack).unwrap();
    assert_eq!(cfa, 0x10010);
    assert_eq!(pc, 0x5678);
}

#[test]
fn pop_low_registers() {
    let stack = stack_at(SP, &[0x10, 0x12]);
    let mut regs = arm_regs();
    let (cfa, _) = run(&[0xb1, 0x05], &mut regs, &stack).unwrap();

    assert_eq!(cfa, 0x10008);
    assert_eq!(regs.get(0), Some(0x10));
    assert_eq!(regs.get(1), Some(0));
    assert_eq!(regs.get(2), Some(0x12));

    assert!(is_malformed(cfa_after(&[0xb1, 0x00])));
    assert!(is_malformed(cfa_after(&[0xb1, 0x10])));
}

#[test]
fn finish_stops_evaluation() {
    let mut regs = arm_regs();
    let elf = MemoryBuffer::default();
    let stack = MemoryBuffer::default();
    let mut exidx = ArmExidx::new(0x1000, &mut regs, &elf, &stack);
    exidx.data.extend([0x01, 0xb0, 0x00]);
    exidx.eval().unwrap();

    assert_eq!(exidx.cfa(), 0x10008);
    assert_eq!(exidx.data().len(), 1);
}

#[test]
fn large_vsp_increment() {
    assert_eq!(cfa_after(&[0xb2, 0x00]), Ok(0x10204));
    assert_eq!(cfa_after(&[0xb2, 0x01]), Ok(0x10208));
    assert_eq!(cfa_after(&[0xb2, 0x81, 0x01]), Ok(0x10408));
    assert!(is_malformed(cfa_after(&[0xb2, 0x81])));
}

#[test]
fn vfp_pops_only_move_vsp() {
    assert_eq!(cfa_after(&[0xb3, 0x12]), Ok(0x10000 + 2 * 8 + 12));
    assert_eq!(cfa_after(&[0xb8]), Ok(0x10000 + 12));
    assert_eq!(cfa_after(&[0xbf]), Ok(0x10000 + 7 * 8 + 12));
    assert_eq!(cfa_after(&[0xc8, 0x01]), Ok(0x10000 + 16));
    assert_eq!(cfa_after(&[0xc9, 0x23]), Ok(0x10000 + 32));
    assert_eq!(cfa_after(&[0xd0]), Ok(0x10000 + 8));
    assert_eq!(cfa_after(&[0xd7]), Ok(0x10000 + 64));
}

#[test]
fn mmx_pops_only_move_vsp() {
    assert_eq!(cfa_after(&[0xc0]), Ok(0x10000 + 8));
    assert_eq!(cfa_after(&[0xc5]), Ok(0x10000 + 48));
    assert_eq!(cfa_after(&[0xc6, 0x02]), Ok(0x10000 + 24));
    assert_eq!(cfa_after(&[0xc7, 0x03]), Ok(0x10000 + 8));
    assert!(is_malformed(cfa_after(&[0xc7, 0x00])));
    assert!(is_malformed(cfa_after(&[0xc7, 0x20])));
}

#[test]
fn spare_opcodes() {
    for op in [0xb4, 0xb5, 0xb6, 0xb7, 0xca, 0xcf, 0xd8, 0xe0, 0xff] {
        assert!(is_malformed(cfa_after(&[op])), "{op:#04x}");
    }
}

#[test]
fn truncated_opcode() {
    assert!(is_malformed(cfa_after(&[0x80])));
    assert!(is_malformed(cfa_after(&[0xb3])));
}

fn extract(elf: &FakeMemory, entry_offset: u64) -> Result<Vec<u8>> {
    let mut regs = arm_regs();
    let stack = MemoryBuffer::default();
    let mut exidx = ArmExidx::new(0x1000, &mut regs, elf, &stack);
    exidx.extract_entry_data(entry_offset)?;
    Ok(exidx.data().iter().copied().collect())
}

#[test]
fn extract_misaligned_entry() {
    let elf = FakeMemory::default();
    assert!(is_malformed(extract(&elf, 0x1001)));
}

#[test]
fn extract_cant_unwind() {
    let elf = FakeMemory::default();
    elf.set32(0x1004, 1);
    assert_eq!(extract(&elf, 0x1000), Err(Error::NoUnwindInfo { pc: 0x1000 }));
}

#[test]
fn extract_inline() {
    let elf = FakeMemory::default();
    elf.set32(0x1004, 0x8001_0203);
    assert_eq!(extract(&elf, 0x1000), Ok(vec![0x01, 0x02, 0x03, 0xb0]));

    elf.set32(0x1004, 0x80a8_b0b0);
    assert_eq!(extract(&elf, 0x1000), Ok(vec![0xa8, 0xb0, 0xb0]));

    elf.set32(0x1004, 0x8100_0000);
    assert!(is_malformed(extract(&elf, 0x1000)));
}

#[test]
fn extract_unreadable_entry() {
    let elf = FakeMemory::default();
    assert_eq!(
        extract(&elf, 0x1000),
        Err(Error::MemoryReadFailure { addr: 0x1004, len: 4 })
    );
}

fn extab_entry(elf: &FakeMemory) {
    elf.set32(0x1004, prel31_encode(0x1004, 0x2000));
}

#[test]
fn extract_extab_compact() {
    let elf = FakeMemory::default();
    extab_entry(&elf);
    elf.set32(0x2000, 0x80a8_b0b0);
    assert_eq!(extract(&elf, 0x1000), Ok(vec![0xa8, 0xb0, 0xb0]));
}

#[test]
fn extract_extab_compact_with_words() {
    let elf = FakeMemory::default();
    extab_entry(&elf);
    elf.set32(0x2000, 0x8101_a841);
    elf.set32(0x2004, 0x0102_0304);
    assert_eq!(
        extract(&elf, 0x1000),
        Ok(vec![0xa8, 0x41, 0x01, 0x02, 0x03, 0x04, 0xb0])
    );

    elf.set32(0x2000, 0x8206_a841);
    assert!(is_malformed(extract(&elf, 0x1000)));

    elf.set32(0x2000, 0x8300_0000);
    assert!(is_malformed(extract(&elf, 0x1000)));
}

#[test]
fn extract_extab_generic() {
    let elf = FakeMemory::default();
    extab_entry(&elf);
    // personality routine, then one additional word
    elf.set32(0x2000, 0x1234);
    elf.set32(0x2004, 0x01a8_b000);
    elf.set32(0x2008, 0x1122_3344);
    assert_eq!(
        extract(&elf, 0x1000),
        Ok(vec![0xa8, 0xb0, 0x00, 0x11, 0x22, 0x33, 0x44, 0xb0])
    );
}
