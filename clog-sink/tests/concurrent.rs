//! Many writers, one log file, on the real filesystem.
//!
//! Each thread opens its own sink, so each has its own lock file descriptor
//! and the advisory lock excludes them from each other exactly as it would
//! separate processes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use clog_fs::backup_path;
use clog_sink::{ConcurrentRotatingSink, NullLogger, RealFilesystem, RotationStatus, SinkConfig};
use tempfile::tempdir;

const RECORD_LEN: usize = 64;

fn record(writer: usize, seq: usize) -> Vec<u8> {
    let text = format!("writer={writer} seq={seq:05}");
    format!("{text:<width$}\n", width = RECORD_LEN - 1).into_bytes()
}

fn open(config: SinkConfig) -> ConcurrentRotatingSink<RealFilesystem> {
    ConcurrentRotatingSink::open_with(RealFilesystem, config, Arc::new(NullLogger))
        .expect("open sink")
}

/// Existing generations, oldest first, then the primary file.
fn generations(path: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut generation = 1;
    while backup_path(path, generation).exists() {
        files.push(backup_path(path, generation));
        generation += 1;
    }
    files.reverse();
    files.push(path.to_path_buf());
    files
}

/// Every line across all generations, in write order.
fn all_lines(path: &Path) -> Vec<String> {
    generations(path)
        .iter()
        .flat_map(|file| {
            fs::read_to_string(file)
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn parse(line: &str) -> (usize, usize) {
    assert_eq!(line.len(), RECORD_LEN - 1, "torn record: {line:?}");
    let mut fields = line.split_whitespace();
    let writer = fields.next().unwrap().strip_prefix("writer=").unwrap();
    let seq = fields.next().unwrap().strip_prefix("seq=").unwrap();
    (writer.parse().unwrap(), seq.parse().unwrap())
}

fn leftovers(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".rot."))
        .collect()
}

#[test]
fn test_every_record_delivered_once_in_order() {
    const WRITERS: usize = 4;
    const RECORDS: usize = 200;

    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    let config = SinkConfig::new(&path)
        .with_max_bytes(2048)
        .with_backup_count(1000)
        .with_lock_timeout(Duration::from_secs(30));

    let barrier = Barrier::new(WRITERS);
    thread::scope(|scope| {
        for writer in 0..WRITERS {
            let config = config.clone();
            let barrier = &barrier;
            scope.spawn(move || {
                let sink = open(config);
                barrier.wait();
                for seq in 0..RECORDS {
                    sink.try_emit(&record(writer, seq)).expect("emit");
                }
            });
        }
    });

    let lines = all_lines(&path);
    assert_eq!(lines.len(), WRITERS * RECORDS);

    let mut next: HashMap<usize, usize> = HashMap::new();
    for line in &lines {
        let (writer, seq) = parse(line);
        let expected = next.entry(writer).or_insert(0);
        assert_eq!(seq, *expected, "writer {writer} out of order");
        *expected += 1;
    }
    assert!(next.values().all(|&n| n == RECORDS));
    assert!(backup_path(&path, 2).exists());
    assert!(leftovers(dir.path()).is_empty());
}

#[test]
fn test_retention_under_contention() {
    const WRITERS: usize = 3;
    const RECORDS: usize = 150;
    const BACKUPS: u32 = 3;
    const MAX_BYTES: u64 = 1024;

    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    let config = SinkConfig::new(&path)
        .with_max_bytes(MAX_BYTES)
        .with_backup_count(BACKUPS)
        .with_lock_timeout(Duration::from_secs(30));

    thread::scope(|scope| {
        for writer in 0..WRITERS {
            let config = config.clone();
            scope.spawn(move || {
                let sink = open(config);
                for seq in 0..RECORDS {
                    sink.emit(&record(writer, seq));
                }
            });
        }
    });

    for generation in 1..=BACKUPS {
        let backup = backup_path(&path, generation);
        let len = fs::metadata(&backup).unwrap().len();
        assert!(len >= MAX_BYTES, "{} is only {len} bytes", backup.display());
    }
    assert!(!backup_path(&path, BACKUPS + 1).exists());
    assert!(fs::metadata(&path).unwrap().len() < MAX_BYTES);
    assert!(leftovers(dir.path()).is_empty());

    // What survived is whole and, per writer, still in order.
    let mut last: HashMap<usize, usize> = HashMap::new();
    for line in all_lines(&path) {
        let (writer, seq) = parse(&line);
        if let Some(prev) = last.insert(writer, seq) {
            assert!(seq > prev);
        }
    }
}

#[test]
fn test_small_threshold_keeps_two_backups() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    let sink = open(SinkConfig::new(&path).with_max_bytes(100).with_backup_count(2));

    let line = |i: usize| format!("{:<39}\n", format!("line {i}")).into_bytes();
    for i in 1..=9 {
        sink.emit(&line(i));
    }

    let text = |p: PathBuf| fs::read(p).unwrap();
    assert_eq!(text(backup_path(&path, 2)), (4..=6).flat_map(line).collect::<Vec<_>>());
    assert_eq!(text(backup_path(&path, 1)), (7..=9).flat_map(line).collect::<Vec<_>>());
    assert_eq!(text(path.clone()), b"");
    assert!(!backup_path(&path, 3).exists());

    let mut names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["app.lock", "app.log", "app.log.1", "app.log.2"]);
}

#[test]
fn test_simultaneous_threshold_crossing_rotates_once() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.log");
    let config = SinkConfig::new(&path).with_max_bytes(100).with_backup_count(5);

    let a = open(config.clone());
    let b = open(config);
    a.emit(&[vec![b'x'; 79], vec![b'\n']].concat());

    let barrier = Barrier::new(2);
    let record = [vec![b'y'; 39], vec![b'\n']].concat();
    let statuses: Vec<RotationStatus> = thread::scope(|scope| {
        let handles: Vec<_> = [&a, &b]
            .into_iter()
            .map(|sink| {
                let barrier = &barrier;
                let record = &record;
                scope.spawn(move || {
                    barrier.wait();
                    sink.try_emit(record).unwrap().rotation
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let rotated = statuses
        .iter()
        .filter(|s| **s == RotationStatus::Rotated)
        .count();
    assert_eq!(rotated, 1, "{statuses:?}");
    assert_eq!(fs::metadata(backup_path(&path, 1)).unwrap().len(), 120);
    assert_eq!(fs::metadata(&path).unwrap().len(), 40);
    assert!(!backup_path(&path, 2).exists());
}

#[test]
fn test_open_creates_missing_directory() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("logs").join("app.log");
    let sink = open(SinkConfig::new(&path));

    assert!(sink.target().primary_path().is_absolute());
    assert!(path.exists());
    assert!(dir.path().join("logs").join("app.lock").exists());

    sink.emit(b"hello\n");
    sink.close();
    assert_eq!(fs::read(&path).unwrap(), b"hello\n");
}
