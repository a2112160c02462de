use fatar::archive::{Archive, ArchiveError, ArchiveOptions, CommitMode};
use fatar::table::{NameError, TableError, ENTRY_SIZE};
use fatar::{BLOCK_SIZE, STORE_OFFSET, TABLE_SLOTS};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(17).wrapping_add(seed)).collect()
}

/// Scratch layout: sources in `src/`, the archive at `ar.fat`, output in `out/`.
struct Scratch {
    dir: TempDir,
}

impl Scratch {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        Self { dir }
    }

    fn source(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.dir.path().join("src").join(name);
        File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    fn archive_path(&self) -> PathBuf {
        self.dir.path().join("ar.fat")
    }

    fn out(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    fn archive(&self, commit: CommitMode) -> Archive {
        let opts = ArchiveOptions { commit, output_dir: self.out(), ..Default::default() };
        Archive::new(self.archive_path(), opts)
    }
}

fn layout(ar: &Archive) -> Vec<(String, u32, u32, u32)> {
    ar.list()
        .unwrap()
        .occupied()
        .map(|(_, e)| (e.name.to_string(), e.starting_block, e.block_count, e.byte_size))
        .collect()
}

fn read(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap()
}

/// Overwrite one little-endian u32 field of a slot record on disk.
fn poke_slot(path: &Path, slot: usize, field_offset: usize, value: u32) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start((slot * ENTRY_SIZE + field_offset) as u64)).unwrap();
    file.write_all(&value.to_le_bytes()).unwrap();
}

#[test]
fn test_create_delete_pack_scenario() {
    let s = Scratch::new();
    let a = pattern(300_000, 1);
    let b = pattern(10_000, 2);
    let pa = s.source("A", &a);
    let pb = s.source("B", &b);
    let ar = s.archive(CommitMode::Staged);

    ar.create::<PathBuf>(&[]).unwrap();
    let report = ar.append(&[pa, pb]).unwrap();
    assert!(report.is_complete());
    assert_eq!(layout(&ar), vec![
        ("A".to_string(), 0, 2, 300_000),
        ("B".to_string(), 2, 1, 10_000),
    ]);

    ar.delete("A").unwrap();
    assert_eq!(layout(&ar), vec![("B".to_string(), 2, 1, 10_000)]);

    let packed = ar.pack().unwrap();
    assert_eq!(packed.relocated, 1);
    assert_eq!(layout(&ar), vec![("B".to_string(), 0, 1, 10_000)]);
    assert_eq!(fs::metadata(s.archive_path()).unwrap().len(), STORE_OFFSET + 10_000);

    let extracted = ar.extract().unwrap();
    assert!(extracted.is_complete());
    assert_eq!(read(&s.out().join("B")), b);
}

#[test]
fn test_roundtrip_block_boundaries() {
    let s = Scratch::new();
    let files: Vec<(&str, Vec<u8>)> = vec![
        ("empty", Vec::new()),
        ("one", pattern(1, 3)),
        ("exact", pattern(BLOCK_SIZE, 4)),
        ("over", pattern(BLOCK_SIZE + 1, 5)),
        ("three", pattern(2 * BLOCK_SIZE + 77, 6)),
    ];
    let paths: Vec<PathBuf> = files.iter().map(|(n, d)| s.source(n, d)).collect();
    let ar = s.archive(CommitMode::Staged);
    let report = ar.create(&paths).unwrap();
    assert_eq!(report.added.len(), files.len());

    let blocks: Vec<u32> = report.added.iter().map(|e| e.block_count).collect();
    assert_eq!(blocks, vec![0, 1, 1, 2, 3]);
    let starts: Vec<u32> = report.added.iter().map(|e| e.starting_block).collect();
    assert_eq!(starts, vec![0, 0, 1, 2, 4]);

    fs::remove_dir_all(s.dir.path().join("src")).unwrap();
    assert!(ar.extract().unwrap().is_complete());
    for (name, data) in &files {
        assert_eq!(&read(&s.out().join(name)), data, "{name}");
    }
}

#[test]
fn test_capacity_bound() {
    let s = Scratch::new();
    let paths: Vec<PathBuf> = (0..TABLE_SLOTS).map(|i| s.source(&format!("f{i:03}"), b"")).collect();
    let ar = s.archive(CommitMode::Staged);
    assert!(ar.create(&paths).unwrap().is_complete());
    let before = ar.list().unwrap();
    assert_eq!(before.occupied_count(), TABLE_SLOTS);

    let extra = [s.source("x1", b"x"), s.source("x2", b"y")];
    let report = ar.append(&extra).unwrap();
    assert!(report.added.is_empty());
    assert_eq!(report.failed.len(), 2);
    for (_, e) in &report.failed {
        assert!(matches!(e, ArchiveError::CapacityExceeded { capacity: 256 }));
    }
    assert_eq!(ar.list().unwrap(), before);
}

#[test]
fn test_append_skips_bad_files_and_continues() {
    let s = Scratch::new();
    let good = s.source("good", b"fine");
    let missing = s.dir.path().join("src").join("missing");
    let long = s.source("twelve_chars", b"too long");
    let ar = s.archive(CommitMode::Staged);
    ar.create(&[good.clone()]).unwrap();

    let report = ar.append(&[missing, long, good, s.source("next", b"n")]).unwrap();
    assert_eq!(report.failed.len(), 3);
    assert!(matches!(report.failed[0].1, ArchiveError::Io(_)));
    assert!(matches!(report.failed[1].1, ArchiveError::Name(NameError::TooLong { len: 12 })));
    assert!(matches!(report.failed[2].1, ArchiveError::DuplicateName(_)));
    assert_eq!(report.added.len(), 1);
    assert_eq!(report.added[0].starting_block, 1);
}

#[test]
fn test_delete_missing_leaves_container_unchanged() {
    for commit in [CommitMode::Staged, CommitMode::InPlace] {
        let s = Scratch::new();
        let ar = s.archive(commit);
        ar.create(&[s.source("a", b"alpha")]).unwrap();
        let before = read(&s.archive_path());

        let err = ar.delete("nope").unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(ref n) if n == "nope"));
        assert_eq!(read(&s.archive_path()), before);
    }
}

#[test]
fn test_delete_hides_only_that_entry() {
    let s = Scratch::new();
    let ar = s.archive(CommitMode::InPlace);
    ar.create(&[s.source("a", b"alpha"), s.source("b", b"beta"), s.source("c", b"gamma")])
        .unwrap();
    let deleted = ar.delete("b").unwrap();
    assert_eq!(deleted.byte_size, 4);

    let table = ar.list().unwrap();
    assert!(table.slots()[1].is_empty());
    assert_eq!(layout(&ar), vec![
        ("a".to_string(), 0, 1, 5),
        ("c".to_string(), 2, 1, 5),
    ]);
    assert!(matches!(ar.delete("b"), Err(ArchiveError::NotFound(_))));
}

#[test]
fn test_update_size_guard() {
    for commit in [CommitMode::Staged, CommitMode::InPlace] {
        let s = Scratch::new();
        let path = s.source("doc", &pattern(1000, 7));
        let ar = s.archive(commit);
        ar.create(&[path.clone()]).unwrap();
        let before = read(&s.archive_path());

        s.source("doc", &pattern(BLOCK_SIZE + 1, 8));
        let err = ar.update(&path).unwrap_err();
        assert!(matches!(err, ArchiveError::SizeMismatch { expected: 1, actual: 2, .. }));
        assert_eq!(read(&s.archive_path()), before);
    }
}

#[test]
fn test_update_in_place() {
    let s = Scratch::new();
    let first = s.source("first", &pattern(BLOCK_SIZE + 10, 1));
    let second = s.source("second", &pattern(500, 2));
    let ar = s.archive(CommitMode::Staged);
    ar.create(&[first.clone(), second]).unwrap();

    let replacement = pattern(BLOCK_SIZE + 3, 9);
    s.source("first", &replacement);
    let updated = ar.update(&first).unwrap();
    assert_eq!(updated.starting_block, 0);
    assert_eq!(updated.block_count, 2);
    assert_eq!(updated.byte_size, replacement.len() as u32);

    assert!(matches!(
        ar.update(s.source("ghost", b"g")),
        Err(ArchiveError::NotFound(_))
    ));

    assert!(ar.extract().unwrap().is_complete());
    assert_eq!(read(&s.out().join("first")), replacement);
    assert_eq!(read(&s.out().join("second")), pattern(500, 2));
}

#[test]
fn test_append_reuses_freed_tail() {
    let s = Scratch::new();
    let ar = s.archive(CommitMode::Staged);
    ar.create(&[s.source("a", b"a"), s.source("b", &pattern(BLOCK_SIZE * 2, 1))]).unwrap();
    ar.delete("b").unwrap();

    let report = ar.append(&[s.source("c", b"c")]).unwrap();
    assert_eq!(report.added[0].starting_block, 1);
    assert_eq!(ar.list().unwrap().find("c"), Some(1));
}

#[test]
fn test_pack_after_slot_reuse() {
    let s = Scratch::new();
    let a = pattern(300_000, 1);
    let b = pattern(10_000, 2);
    let c = pattern(BLOCK_SIZE + 4, 3);
    let ar = s.archive(CommitMode::Staged);
    ar.create(&[s.source("A", &a), s.source("B", &b)]).unwrap();
    ar.delete("A").unwrap();
    // "C" lands in slot 0 but after B's blocks.
    ar.append(&[s.source("C", &c)]).unwrap();
    assert_eq!(layout(&ar), vec![
        ("C".to_string(), 3, 2, c.len() as u32),
        ("B".to_string(), 2, 1, 10_000),
    ]);

    ar.pack().unwrap();
    assert_eq!(layout(&ar), vec![
        ("C".to_string(), 1, 2, c.len() as u32),
        ("B".to_string(), 0, 1, 10_000),
    ]);
    assert!(ar.list().unwrap().overlapping().is_empty());

    fs::remove_dir_all(s.dir.path().join("src")).unwrap();
    assert!(ar.extract().unwrap().is_complete());
    assert_eq!(read(&s.out().join("B")), b);
    assert_eq!(read(&s.out().join("C")), c);
}

#[test]
fn test_pack_is_idempotent() {
    let s = Scratch::new();
    let ar = s.archive(CommitMode::InPlace);
    ar.create(&[s.source("a", &pattern(700, 1)), s.source("b", &pattern(BLOCK_SIZE, 2)), s.source("c", b"c")])
        .unwrap();
    ar.delete("a").unwrap();
    ar.pack().unwrap();
    let table = ar.list().unwrap();
    let bytes = read(&s.archive_path());

    let again = ar.pack().unwrap();
    assert_eq!(again.relocated, 0);
    assert_eq!(again.reclaimed_bytes, 0);
    assert_eq!(ar.list().unwrap(), table);
    assert_eq!(read(&s.archive_path()), bytes);
}

#[test]
fn test_extract_reports_short_read_and_continues() {
    let s = Scratch::new();
    let ar = s.archive(CommitMode::Staged);
    let head = pattern(100, 1);
    ar.create(&[s.source("head", &head), s.source("tail", &pattern(5000, 2))]).unwrap();

    // Cut the container halfway through "tail".
    let file = OpenOptions::new().write(true).open(s.archive_path()).unwrap();
    file.set_len(STORE_OFFSET + BLOCK_SIZE as u64 + 2500).unwrap();
    drop(file);

    let report = ar.extract().unwrap();
    assert_eq!(report.extracted.len(), 1);
    assert_eq!(read(&s.out().join("head")), head);
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        report.failed[0].1,
        ArchiveError::ShortRead { expected: 5000, actual: 2500, .. }
    ));
    assert_eq!(read(&s.out().join("tail")).len(), 2500);

    let check = ar.check().unwrap();
    assert!(!check.is_clean());
    assert!(matches!(ar.pack(), Err(ArchiveError::ShortRead { .. })));
}

#[test]
fn test_extract_continues_past_unwritable_output() {
    let s = Scratch::new();
    let ar = s.archive(CommitMode::Staged);
    let a = pattern(BLOCK_SIZE + 1, 1);
    let c = pattern(42, 3);
    ar.create(&[s.source("a", &a), s.source("b", &pattern(10, 2)), s.source("c", &c)])
        .unwrap();

    fs::create_dir_all(s.out().join("b")).unwrap();
    let report = ar.extract().unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0.as_str(), "b");
    assert!(matches!(report.failed[0].1, ArchiveError::Io(_)));
    assert_eq!(report.extracted.len(), 2);
    assert_eq!(read(&s.out().join("a")), a);
    assert_eq!(read(&s.out().join("c")), c);
}

#[test]
fn test_pack_refuses_wrong_block_count() {
    for mode in [CommitMode::Staged, CommitMode::InPlace] {
        let s = Scratch::new();
        let ar = s.archive(mode);
        let a = pattern(300_000, 1);
        let b = pattern(10_000, 2);
        ar.create(&[s.source("a", &a), s.source("b", &b)]).unwrap();

        // num_blocks of "a" claims one block while its size needs two.
        poke_slot(&s.archive_path(), 0, 16, 1);
        assert!(!ar.check().unwrap().is_clean());
        let before = read(&s.archive_path());

        assert!(matches!(
            ar.pack(),
            Err(ArchiveError::Table(TableError::BadBlockCount { slot: 0, recorded: 1, expected: 2 }))
        ));
        assert_eq!(read(&s.archive_path()), before);
    }
}

#[test]
fn test_pack_refuses_overlapping_entries() {
    for mode in [CommitMode::Staged, CommitMode::InPlace] {
        let s = Scratch::new();
        let ar = s.archive(mode);
        ar.create(&[s.source("a", &pattern(300_000, 1)), s.source("b", &pattern(10_000, 2))])
            .unwrap();

        // starting_block of "b" moved into the second block of "a".
        poke_slot(&s.archive_path(), 1, 12, 1);
        assert_eq!(ar.check().unwrap().overlaps, vec![(0, 1)]);
        let before = read(&s.archive_path());

        assert!(matches!(
            ar.pack(),
            Err(ArchiveError::Table(TableError::Overlap { first: 0, second: 1 }))
        ));
        assert_eq!(read(&s.archive_path()), before);
    }
}

#[test]
fn test_check_clean_archive() {
    let s = Scratch::new();
    let ar = s.archive(CommitMode::Staged);
    ar.create(&[s.source("a", &pattern(900, 1)), s.source("b", b"b")]).unwrap();
    ar.delete("a").unwrap();
    let report = ar.check().unwrap();
    assert!(report.is_clean(), "{}", report.summary());
    assert_eq!(report.entries.len(), 1);
}

#[test]
fn test_missing_or_foreign_container() {
    let s = Scratch::new();
    let ar = s.archive(CommitMode::Staged);
    assert!(matches!(ar.list(), Err(ArchiveError::Io(_))));
    assert!(matches!(ar.delete("a"), Err(ArchiveError::Io(_))));

    fs::write(s.archive_path(), vec![0u8; STORE_OFFSET as usize]).unwrap();
    // An all-zero table reads as empty; the header is what gives it away.
    assert!(matches!(ar.list(), Err(ArchiveError::Header(_))));

    fs::write(s.archive_path(), b"short").unwrap();
    assert!(matches!(ar.list(), Err(ArchiveError::Table(_))));
}

#[test]
fn test_create_replaces_existing_container() {
    let s = Scratch::new();
    let ar = s.archive(CommitMode::InPlace);
    ar.create(&[s.source("old", &pattern(BLOCK_SIZE * 2, 1))]).unwrap();
    ar.create::<PathBuf>(&[]).unwrap();
    assert_eq!(ar.list().unwrap().occupied_count(), 0);
    assert_eq!(fs::metadata(s.archive_path()).unwrap().len(), STORE_OFFSET);
}

#[test]
fn test_cli_delete_matches_by_file_name() {
    let s = Scratch::new();
    let nested = s.dir.path().join("src").join("dir");
    fs::create_dir(&nested).unwrap();
    let x = nested.join("x");
    fs::write(&x, b"payload").unwrap();

    let archive = s.archive_path();
    let fatar = |op: &str, file: Option<&Path>| {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_fatar"));
        cmd.arg(op).arg("-f").arg(&archive);
        if let Some(file) = file {
            cmd.arg(file);
        }
        cmd.status().unwrap()
    };
    assert!(fatar("-c", None).success());
    assert!(fatar("-r", Some(x.as_path())).success());
    assert_eq!(layout(&s.archive(CommitMode::Staged)).len(), 1);
    assert!(fatar("-d", Some(x.as_path())).success());

    let ar = s.archive(CommitMode::Staged);
    assert!(layout(&ar).is_empty());
}
