use std::{
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{MapFlags, MapInfo, Maps};
use crate::{
    elf::ElfInfo,
    memory::{Memory, MemoryBuffer},
    regs::ArchKind,
    MapsError,
};

#[test]
fn parse_line() {
    let map = MapInfo::parse_line(
        "6f000000-6f01e000 rwxp 00000000 00:0c 16389419   /system/lib/libcomposer.so\n",
    )
    .unwrap();
    assert_eq!((map.start, map.end, map.offset), (0x6f00_0000, 0x6f01_e000, 0));
    assert_eq!(map.flags, MapFlags::READ | MapFlags::WRITE | MapFlags::EXEC);
    assert_eq!(map.name, "/system/lib/libcomposer.so");

    let map = MapInfo::parse_line("7fff5000-7fff6000 r--s 0001a000 fd:01 0").unwrap();
    assert_eq!(map.offset, 0x1a000);
    assert_eq!(map.flags, MapFlags::READ);
    assert_eq!(map.name, "");

    let map = MapInfo::parse_line("1000-2000 ---p 00000000 00:00 0 [vsyscall]").unwrap();
    assert_eq!(map.flags, MapFlags::empty());
    assert_eq!(map.name, "[vsyscall]");

    // names keep their inner spaces
    let map = MapInfo::parse_line("1000-2000 r-xp 00000000 00:00 0 /data/my app/lib.so").unwrap();
    assert_eq!(map.name, "/data/my app/lib.so");
}

#[test]
fn device_maps() {
    let map = MapInfo::parse_line("1000-2000 rw-s 00000000 00:05 42 /dev/kgsl-3d0").unwrap();
    assert!(map.flags.contains(MapFlags::DEVICE_MAP));

    let map =
        MapInfo::parse_line("1000-2000 rw-s 00000000 00:05 42 /dev/ashmem/dalvik-heap").unwrap();
    assert!(!map.flags.contains(MapFlags::DEVICE_MAP));
}

#[test]
fn malformed_lines() {
    for line in [
        "",
        "6f000000-6f01e000 rwxp 00000000 00:0c",
        "6f000000-6f01e000 rwxp 00000000",
        "6f000000 rwxp 00000000 00:0c 16389419",
        "6f000000-6f01e000 rwx 00000000 00:0c 16389419",
        "6f000000-6f01e000 rwxp 0000000g 00:0c 16389419",
        "6f000000-6f01e000 rwxp 00000000 000c 16389419",
        "6f000000-6f01e000 rwxp 00000000 00:0c inode",
        "6f000000-6f01e000 rwxp 00000000 00:0c 16389419/system/lib/libc.so",
        "zz-6f01e000 rwxp 00000000 00:0c 16389419",
    ] {
        assert!(MapInfo::parse_line(line).is_none(), "{line:?}");
    }
}

#[test]
fn parse_table() {
    let maps = Maps::parse(
        "2000-3000 r-xp 00000000 00:00 0 /lib/b.so\n\
         1000-2000 r-xp 00000000 00:00 0 /lib/a.so\n\
         4000-5000 rw-p 00001000 00:00 0 /lib/b.so\n",
    )
    .unwrap();

    assert_eq!(maps.len(), 3);
    let names: Vec<_> = maps.iter().map(|map| map.name.as_str()).collect();
    assert_eq!(names, ["/lib/a.so", "/lib/b.so", "/lib/b.so"]);
    assert_eq!(maps.get(2).map(|map| map.offset), Some(0x1000));
    assert!(maps.get(3).is_none());

    assert_eq!(maps.find(0x1fff).map(|map| map.start), Some(0x1000));
    assert_eq!(maps.find(0x2000).map(|map| map.start), Some(0x2000));
    assert!(maps.find(0x3800).is_none());
    assert!(maps.find(0x5000).is_none());
    assert!(maps.find(0).is_none());

    assert!(Maps::parse("").unwrap().is_empty());
}

#[test]
fn invalid_line_fails_the_table() {
    let err = Maps::parse(
        "1000-2000 r-xp 00000000 00:00 0 /lib/a.so\n\
         2000-3000 r-xp 00000000\n",
    )
    .unwrap_err();
    assert!(
        matches!(
            err,
            MapsError::InvalidLine { line_number: 2, ref line } if line == "2000-3000 r-xp 00000000"
        ),
        "{err}"
    );
}

#[test]
fn overlaps_and_empty_regions() {
    let err = Maps::parse(
        "1000-2000 r-xp 00000000 00:00 0\n\
         1800-2800 r-xp 00000000 00:00 0\n",
    )
    .unwrap_err();
    assert!(matches!(err, MapsError::Overlap { start: 0x1800, end: 0x2800 }), "{err}");

    let err = Maps::new(vec![MapInfo::new(0x2000, 0x2000, 0, MapFlags::READ, "")]).unwrap_err();
    assert!(matches!(err, MapsError::EmptyRegion { start: 0x2000, end: 0x2000 }), "{err}");
}

#[test]
fn from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "1000-2000 r-xp 00000000 00:00 0 /lib/a.so\n\
         3000-4000 r--p 00000000 00:00 0 [vdso]\n"
    )
    .unwrap();
    file.flush().unwrap();

    let maps = Maps::from_file(file.path()).unwrap();
    assert_eq!(maps.len(), 2);
    assert_eq!(maps.find(0x3abc).map(|map| map.name.as_str()), Some("[vdso]"));

    let missing = file.path().with_extension("missing");
    assert!(matches!(Maps::from_file(missing), Err(MapsError::Io(_))));
}

fn offline_record(start: u64, end: u64, offset: u64, flags: u16, name: &str) -> Vec<u8> {
    let mut record = Vec::new();
    record.extend_from_slice(&start.to_le_bytes());
    record.extend_from_slice(&end.to_le_bytes());
    record.extend_from_slice(&offset.to_le_bytes());
    record.extend_from_slice(&flags.to_le_bytes());
    record.extend_from_slice(&(name.len() as u16).to_le_bytes());
    record.extend_from_slice(name.as_bytes());
    record
}

#[test]
fn offline_format() {
    let bytes = [
        offline_record(0x5000, 0x6000, 0, 0x5, "/lib/b.so"),
        offline_record(0x1000, 0x2000, 0x2000, 0x8003, "/dev/gpu"),
        offline_record(0x7000, 0x8000, 0, 0x3, ""),
    ]
    .concat();

    let maps = Maps::parse_offline(&bytes).unwrap();
    assert_eq!(maps.len(), 3);

    let device = maps.find(0x1800).unwrap();
    assert_eq!(device.offset, 0x2000);
    assert_eq!(device.flags, MapFlags::READ | MapFlags::WRITE | MapFlags::DEVICE_MAP);
    assert_eq!(device.name, "/dev/gpu");

    let lib = maps.find(0x5000).unwrap();
    assert_eq!(lib.flags, MapFlags::READ | MapFlags::EXEC);
    assert_eq!(maps.find(0x7fff).unwrap().name, "");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();
    file.flush().unwrap();
    assert_eq!(Maps::from_offline_file(file.path()).unwrap().len(), 3);
}

#[test]
fn truncated_offline_records() {
    let record = offline_record(0x1000, 0x2000, 0, 0x5, "/lib/a.so");
    let bytes = [record.clone(), record[..record.len() - 1].to_vec()].concat();
    let err = Maps::parse_offline(&bytes).unwrap_err();
    assert!(matches!(err, MapsError::Truncated { offset } if offset == record.len()), "{err}");

    let err = Maps::parse_offline(&record[..10]).unwrap_err();
    assert!(matches!(err, MapsError::Truncated { offset: 0 }), "{err}");

    assert!(Maps::parse_offline(&[]).unwrap().is_empty());
}

#[test]
fn find_agrees_with_a_linear_scan() {
    let mut rng = StdRng::seed_from_u64(0x6d61_7073);

    for _ in 0..50 {
        let mut maps = Vec::new();
        let mut addr = rng.gen_range(0..0x1000u64);
        for _ in 0..rng.gen_range(0..40) {
            let start = addr + rng.gen_range(0..3u64) * 0x1000;
            let end = start + rng.gen_range(1..4u64) * 0x1000;
            maps.push((start, end));
            addr = end;
        }

        let table = Maps::new(
            maps.iter()
                .rev()
                .map(|&(start, end)| MapInfo::new(start, end, 0, MapFlags::READ, ""))
                .collect(),
        )
        .unwrap();

        for _ in 0..200 {
            let pc = rng.gen_range(0..addr + 0x2000);
            let expected = maps.iter().find(|&&(start, end)| (start..end).contains(&pc));
            let found = table.find(pc).map(|map| (map.start, map.end));
            assert_eq!(found.as_ref(), expected, "pc {pc:#x}");
        }
    }
}

#[test]
fn rel_pc() {
    let flags = MapFlags::READ | MapFlags::EXEC;
    let map = MapInfo::new(0x7000_0000, 0x7001_0000, 0x3000, flags, "/lib/a.so");
    assert_eq!(map.rel_pc(0x7000_0450, 0), 0x450);
    assert_eq!(map.rel_pc(0x7000_0450, 0x1000), 0x1450);
    assert!(map.contains(0x7000_ffff));
    assert!(!map.contains(0x7001_0000));
}

const MAGIC: u32 = 0x464c_457f;

fn loader(count: &AtomicUsize) -> impl Fn(&Arc<dyn Memory>) -> Option<ElfInfo> + '_ {
    move |memory: &Arc<dyn Memory>| {
        count.fetch_add(1, Ordering::Relaxed);
        let load_bias = memory.read_u64(8).unwrap_or(0);
        (memory.read_u32(0).ok()? == MAGIC).then(|| ElfInfo::new(ArchKind::Arm64, load_bias))
    }
}

#[test]
fn objects_from_process_memory() {
    let mut image = b"\x7fELF\0\0\0\0".to_vec();
    image.extend_from_slice(&0x1234u64.to_le_bytes());
    let process: Arc<dyn Memory> = Arc::new(MemoryBuffer::with_base(0x40_0000, image));
    let count = AtomicUsize::new(0);
    let loader = loader(&count);

    let map = MapInfo::new(0x40_0000, 0x40_1000, 0, MapFlags::READ | MapFlags::EXEC, "");
    assert!(map.cached_elf().is_none());
    assert_eq!(map.elf(&process, &loader).map(|elf| elf.load_bias()), Some(0x1234));
    assert!(map.elf(&process, &loader).is_some());
    assert!(map.cached_elf().is_some());
    assert_eq!(count.load(Ordering::Relaxed), 1);

    // a failed load is remembered too
    let anon = MapInfo::new(0x50_0000, 0x50_1000, 0, MapFlags::READ, "");
    assert!(anon.elf(&process, &loader).is_none());
    assert!(anon.elf(&process, &loader).is_none());
    assert!(anon.cached_elf().is_none());
    assert_eq!(count.load(Ordering::Relaxed), 2);
}

#[test]
fn objects_from_files() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut contents = vec![0; 0x1000];
    contents.extend_from_slice(b"\x7fELF\0\0\0\0");
    contents.extend_from_slice(&0x77u64.to_le_bytes());
    file.write_all(&contents).unwrap();
    file.flush().unwrap();

    // process memory says nothing, the file at the map's offset has the object
    let process: Arc<dyn Memory> = Arc::new(MemoryBuffer::default());
    let count = AtomicUsize::new(0);
    let loader = loader(&count);
    let name = file.path().to_str().unwrap();

    let map = MapInfo::new(0x40_0000, 0x40_1000, 0x1000, MapFlags::READ | MapFlags::EXEC, name);
    assert_eq!(map.elf(&process, &loader).map(|elf| elf.load_bias()), Some(0x77));

    // device maps never touch the file
    let flags = MapFlags::READ | MapFlags::DEVICE_MAP;
    let device = MapInfo::new(0x40_0000, 0x40_1000, 0x1000, flags, name);
    assert!(device.elf(&process, &loader).is_none());
}
