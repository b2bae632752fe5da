//! # Crash Recovery Tests
//!
//! Recovery behavior over the public API, with crashes simulated by direct
//! surgery on the files a dead process would leave behind:
//!
//! - a leftover lock file from a crashed process is detected and rebuilt
//! - a torn header write (death mid-swap) falls back to the previous commit
//! - a database with no usable header is rejected, not misread
//! - a file from an incompatible format version is rejected

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::tempdir;
use tidedb::{ColumnType, DbError, SharedGroup, Value};

fn test_spec() -> Vec<(&'static str, ColumnType)> {
    vec![
        ("first", ColumnType::Int),
        ("second", ColumnType::Int),
        ("third", ColumnType::Bool),
        ("fourth", ColumnType::String),
    ]
}

fn row(first: i64, second: i64, third: bool, fourth: &str) -> Vec<Value> {
    vec![
        Value::Int(first),
        Value::Int(second),
        Value::Bool(third),
        Value::String(fourth.into()),
    ]
}

fn lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

fn commit_one_row(db_path: &Path) {
    let mut shared = SharedGroup::open(db_path).unwrap();
    let group = shared.begin_write().unwrap();
    let table = group.get_or_create_table("test", &test_spec()).unwrap();
    table.add_row(&row(1, 2, false, "test")).unwrap();
    shared.commit().unwrap();
}

/// Flips bytes at `offset` in the file, simulating a torn or corrupt write.
fn corrupt_bytes(path: &Path, offset: u64, len: usize) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut bytes = vec![0u8; len];
    file.read_exact(&mut bytes).unwrap();
    for b in &mut bytes {
        *b ^= 0x5a;
    }
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&bytes).unwrap();
}

#[test]
fn leftover_lock_file_from_a_dead_process_is_rebuilt() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_shared.tdb");

    commit_one_row(&db_path);
    assert!(!lock_path(&db_path).exists());

    // A process that died during its open handshake leaves an empty or
    // partial lock file behind.
    std::fs::write(lock_path(&db_path), b"").unwrap();

    let mut shared = SharedGroup::open(&db_path).unwrap();
    assert!(shared.is_valid());
    let group = shared.begin_read().unwrap();
    assert_eq!(group.table("test").unwrap().row_count(), 1);
    shared.end_read().unwrap();
    drop(shared);

    assert!(
        !lock_path(&db_path).exists(),
        "rebuilt lock file is removed on last close like any other"
    );
}

#[test]
fn torn_header_write_falls_back_to_previous_commit() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_shared.tdb");

    commit_one_row(&db_path);

    // Creation wrote slot A (version 1, the empty group); the row commit
    // wrote slot B (version 2) at byte 128. Corrupting slot B simulates a
    // crash that tore the header write mid-commit.
    corrupt_bytes(&db_path, 128, 64);

    let mut shared = SharedGroup::open(&db_path).unwrap();
    let group = shared.begin_read().unwrap();
    assert!(
        !group.has_table("test"),
        "the torn commit never happened; version 1 is the current state"
    );
    shared.end_read().unwrap();
}

#[test]
fn database_with_no_valid_header_is_rejected() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_shared.tdb");

    commit_one_row(&db_path);
    corrupt_bytes(&db_path, 64, 128);

    let err = SharedGroup::open(&db_path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::CorruptHeader)
    ));

    assert!(
        !lock_path(&db_path).exists(),
        "a failed open leaves no lock file behind"
    );
}

#[test]
fn incompatible_format_version_is_rejected() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_shared.tdb");

    commit_one_row(&db_path);

    // The format version word sits at byte 16, after the magic.
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&db_path)
        .unwrap();
    file.seek(SeekFrom::Start(16)).unwrap();
    file.write_all(&99u32.to_le_bytes()).unwrap();
    drop(file);

    let err = SharedGroup::open(&db_path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::Unsupported {
            found: 99,
            expected: 1
        })
    ));
}

#[test]
fn unrelated_file_is_not_a_database() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("notes.tdb");
    std::fs::write(&db_path, b"this is not a database at all, honest").unwrap();

    let err = SharedGroup::open(&db_path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::OpenFailed(_))
    ));
}

#[test]
fn recovery_preserves_later_commits_after_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_shared.tdb");

    commit_one_row(&db_path);

    // Crash leftovers plus a healthy reopen-and-commit cycle.
    std::fs::write(lock_path(&db_path), b"").unwrap();
    {
        let mut shared = SharedGroup::open(&db_path).unwrap();
        let group = shared.begin_write().unwrap();
        let table = group.get_or_create_table("test", &test_spec()).unwrap();
        table.add_row(&row(2, 3, true, "more test")).unwrap();
        shared.commit().unwrap();
    }

    let mut shared = SharedGroup::open(&db_path).unwrap();
    let group = shared.begin_read().unwrap();
    let table = group.table("test").unwrap();
    assert_eq!(table.row_count(), 2);
    assert_eq!(table.row(0).unwrap(), row(1, 2, false, "test"));
    assert_eq!(table.row(1).unwrap(), row(2, 3, true, "more test"));
    shared.end_read().unwrap();
}
