use super::*;
use crate::memory::MemoryBuffer;

#[test]
fn layouts() {
    let cases = [
        (ArchKind::Arm, 16, 13, 15, true),
        (ArchKind::Arm64, 33, 31, 32, false),
        (ArchKind::X86, 9, 4, 8, true),
        (ArchKind::X86_64, 17, 7, 16, false),
    ];
    for (arch, total, sp, pc, is_32bit) in cases {
        let regs = Regs::new(arch);
        assert_eq!(regs.arch(), arch);
        assert_eq!(regs.total_regs(), total, "{arch}");
        assert_eq!(regs.sp_reg(), sp, "{arch}");
        assert_eq!(regs.pc_reg(), pc, "{arch}");
        assert_eq!(regs.is_32bit(), is_32bit, "{arch}");
        assert_eq!(regs.get(total as u16), None, "{arch}");
    }
}

#[test]
fn set_pc_and_sp_update_both_views() {
    let mut regs = Regs::new(ArchKind::Arm64);
    regs.set_pc(0x1234);
    regs.set_sp(0x7ff0);

    assert_eq!(regs.pc(), 0x1234);
    assert_eq!(regs.get(ARM64_REG_PC), Some(0x1234));
    assert_eq!(regs.sp(), 0x7ff0);
    assert_eq!(regs.get(ARM64_REG_SP), Some(0x7ff0));
}

#[test]
fn slot_writes_leave_logical_values() {
    let mut regs = Regs::new(ArchKind::X86_64);
    regs.set_pc(0x1000);

    assert!(regs.set(X86_64_REG_PC, 0x2000));
    assert_eq!(regs.pc(), 0x1000);
    assert!(!regs.set(17, 1));
}

#[test]
fn narrow_sets_truncate() {
    let mut regs = Regs::new(ArchKind::X86);
    regs.set(0, 0x1_2345_6789);
    regs.set_sp(0xffff_ffff_0000_0010);

    assert_eq!(regs.get(0), Some(0x2345_6789));
    assert_eq!(regs.sp(), 0x10);
}

#[test]
fn from_raw() {
    let values: Vec<u64> = (0..16).map(|i| i * 0x10).collect();
    let regs = Regs::from_raw(ArchKind::Arm, &values);

    assert_eq!(regs.pc(), 0xf0);
    assert_eq!(regs.sp(), 0xd0);
    assert_eq!(regs.get(ARM_REG_LR), Some(0xe0));
}

#[test]
fn read_word_uses_width() {
    let memory = MemoryBuffer::new(vec![1, 0, 0, 0, 2, 0, 0, 0]);

    assert_eq!(Regs::new(ArchKind::Arm).read_word(&memory, 0), Ok(1));
    assert_eq!(
        Regs::new(ArchKind::X86_64).read_word(&memory, 0),
        Ok(0x2_0000_0001)
    );
}

#[test]
fn pc_adjustment_x86_and_arm64() {
    let memory = MemoryBuffer::default();

    let x86 = Regs::new(ArchKind::X86);
    assert_eq!(x86.pc_adjustment(0, 0, &memory), 0);
    assert_eq!(x86.pc_adjustment(0x10, 0, &memory), 1);
    assert_eq!(Regs::new(ArchKind::X86_64).pc_adjustment(1, 0, &memory), 1);

    let arm64 = Regs::new(ArchKind::Arm64);
    assert_eq!(arm64.pc_adjustment(3, 0, &memory), 0);
    assert_eq!(arm64.pc_adjustment(4, 0, &memory), 4);
}

#[test]
fn pc_adjustment_arm() {
    let mut elf = vec![0; 0x20];
    // a 32-bit thumb bl ending right before 0x11
    elf[0xc..0x10].copy_from_slice(&0xf800_f000u32.to_le_bytes());
    let memory = MemoryBuffer::new(elf);
    let regs = Regs::new(ArchKind::Arm);

    assert_eq!(regs.pc_adjustment(4, 0, &memory), 0);
    assert_eq!(regs.pc_adjustment(0x100, 0x200, &memory), 0);
    assert_eq!(regs.pc_adjustment(0x10, 0, &memory), 4);
    assert_eq!(regs.pc_adjustment(0x11, 0, &memory), 4);
    assert_eq!(regs.pc_adjustment(0x13, 0, &memory), 2);
    // the instruction cannot be read
    assert_eq!(regs.pc_adjustment(0x101, 0, &memory), 2);
    assert_eq!(regs.pc_adjustment(0x1011, 0x1000, &memory), 4);
}
