use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::{tempdir, TempDir};

use obsfs::config::{FsConfig, TtlMode};
use obsfs::control::{ControlSignals, ReportSink};
use obsfs::fs::ObjectFs;
use obsfs::store::{Headers, MemStore, ObjectStore};
use obsfs::Error;

const MAX_PART: u64 = 10;

struct TestFs {
    fs: Arc<ObjectFs>,
    mem: Arc<MemStore>,
    _dir: TempDir,
}

fn test_fs(use_copy: bool, negative_cache: bool) -> TestFs {
    let dir = tempdir().expect("tempdir");
    let mem = Arc::new(MemStore::new());
    let config = FsConfig {
        cache_size: 1000,
        cache_ttl_secs: 900,
        ttl_mode: TtlMode::Absolute,
        negative_cache,
        max_part_size: MAX_PART,
        min_part_size: 5,
        max_parts: 10_000,
        max_copy_part: 100,
        use_copy_upload: use_copy,
        upload_parallelism: 3,
        buffer_dir: Some(dir.path().to_path_buf()),
    };
    let fs = ObjectFs::new(config, mem.clone()).expect("fs");
    TestFs { fs, mem, _dir: dir }
}

fn bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

fn create_flags() -> i32 {
    libc::O_CREAT | libc::O_RDWR
}

/// Part uploads run on worker threads; poll for their side effects.
fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn small_write_is_a_single_put() {
    let t = test_fs(true, false);
    let handle = t.fs.open("/a", create_flags()).expect("open");
    assert_eq!(t.fs.write(handle, 0, b"hello").expect("write"), 5);
    t.fs.release(handle).expect("release");

    assert_eq!(t.mem.initiate_calls(), 0, "no multipart session for 5 bytes");
    assert_eq!(t.mem.put_calls(), 1);
    assert_eq!(t.mem.object_bytes("/a").unwrap(), b"hello");
    assert_eq!(t.fs.lookup("/a").expect("lookup").size, 5);
}

#[test]
fn create_without_writes_materializes_empty_object() {
    let t = test_fs(true, false);
    let handle = t.fs.open("/empty", create_flags()).expect("open");
    t.fs.release(handle).expect("release");

    assert_eq!(t.mem.object_bytes("/empty").unwrap(), Vec::<u8>::new());
    assert_eq!(t.fs.lookup("/empty").expect("lookup").size, 0);
}

#[test]
fn streaming_write_flushes_on_slab_boundaries() {
    let t = test_fs(true, false);
    let data = bytes(30, 1);

    let handle = t.fs.open("/b", create_flags()).expect("open");
    // 25 bytes: the first two slabs stream out immediately, 5 bytes stay
    // untreated.
    t.fs.write(handle, 0, &data[..25]).expect("write");
    assert_eq!(t.mem.initiate_calls(), 1);
    wait_until("first two slabs streamed", || {
        t.mem.upload_part_calls(1) == 1 && t.mem.upload_part_calls(2) == 1
    });
    assert_eq!(t.mem.upload_part_calls(3), 0);

    // The tail write completes slab 3 and streams it too.
    t.fs.write(handle, 25, &data[25..]).expect("write");
    wait_until("third slab streamed", || t.mem.upload_part_calls(3) == 1);

    t.fs.release(handle).expect("release");
    assert_eq!(t.mem.complete_calls(), 1);
    assert_eq!(t.mem.put_calls(), 0);
    assert_eq!(t.mem.object_bytes("/b").unwrap(), data);
    assert_eq!(t.fs.lookup("/b").expect("lookup").size, 30);
}

#[test]
fn overwrite_of_streamed_slab_reuploads_part() {
    let t = test_fs(true, false);
    let mut expected = bytes(10, 7);

    let handle = t.fs.open("/c", create_flags()).expect("open");
    t.fs.write(handle, 0, &expected).expect("write");
    // The full slab streams out as part 1.
    wait_until("first slab streamed", || t.mem.upload_part_calls(1) == 1);

    // Overwriting inside the already-submitted slab supersedes part 1; the
    // close flush re-uploads it under the same number.
    t.fs.write(handle, 5, b"abc").expect("write");
    expected[5..8].copy_from_slice(b"abc");
    t.fs.release(handle).expect("release");

    assert_eq!(t.mem.upload_part_calls(1), 2);
    assert_eq!(t.mem.complete_calls(), 1);
    assert_eq!(t.mem.object_bytes("/c").unwrap(), expected);
}

#[test]
fn copy_reuse_for_clean_slabs() {
    let t = test_fs(true, false);
    let prior = bytes(30, 11);
    t.mem.seed("/d", &prior);

    let handle = t.fs.open("/d", libc::O_RDWR).expect("open");
    t.fs.write(handle, 10, b"WORLD").expect("write");
    t.fs.release(handle).expect("release");

    // Slabs 1 and 3 were server-side copied, slab 2 carried the dirty bytes
    // plus its downloaded gap.
    assert_eq!(t.mem.copy_part_calls(), 2);
    assert_eq!(t.mem.upload_part_calls(2), 1);
    assert_eq!(t.mem.complete_calls(), 1);

    let mut expected = prior;
    expected[10..15].copy_from_slice(b"WORLD");
    assert_eq!(t.mem.object_bytes("/d").unwrap(), expected);
}

#[test]
fn full_rewrite_without_copy_downloads_nothing() {
    let t = test_fs(false, false);
    t.mem.seed("/r", &bytes(30, 3));
    let data = bytes(30, 90);

    let handle = t.fs.open("/r", libc::O_RDWR).expect("open");
    t.fs.write(handle, 0, &data).expect("write");
    t.fs.release(handle).expect("release");

    assert_eq!(t.mem.copy_part_calls(), 0);
    assert_eq!(t.mem.object_bytes("/r").unwrap(), data);
}

#[test]
fn worker_failure_aborts_instead_of_completing() {
    let t = test_fs(true, false);
    t.mem.fail_part_once(1);

    let handle = t.fs.open("/e", create_flags()).expect("open");
    // Both slabs stream out; part 1 fails, part 2 may succeed or short
    // circuit, and the close flush must abort rather than complete.
    t.fs.write(handle, 0, &bytes(20, 5)).expect("write");
    let err = t.fs.release(handle).expect_err("release must surface the error");

    assert_eq!(obsfs::errno_of(&err), libc::EIO);
    assert_eq!(t.mem.complete_calls(), 0);
    assert_eq!(t.mem.aborted_upload_ids().len(), 1);
    assert!(t.mem.object_bytes("/e").is_none(), "prior version untouched");

    // The handle is gone regardless of the failed flush.
    assert!(t.fs.write(handle, 0, b"x").is_err());
}

#[test]
fn negative_cache_suppresses_repeated_heads() {
    let t = test_fs(true, true);

    let err = t.fs.lookup("/missing").expect_err("missing object");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))));
    assert_eq!(t.mem.head_calls(), 1);

    let err = t.fs.lookup("/missing").expect_err("still missing");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))));
    assert_eq!(t.mem.head_calls(), 1, "second lookup served from cache");
}

#[test]
fn read_pulls_missing_ranges_lazily() {
    let t = test_fs(true, false);
    let prior = bytes(30, 40);
    t.mem.seed("/read", &prior);

    let handle = t.fs.open("/read", libc::O_RDONLY).expect("open");
    assert_eq!(t.fs.read(handle, 5, 10).expect("read"), prior[5..15]);
    // Reads past EOF clamp.
    assert_eq!(t.fs.read(handle, 25, 100).expect("read"), prior[25..30]);
    assert_eq!(t.fs.read(handle, 40, 10).expect("read"), Vec::<u8>::new());
    t.fs.release(handle).expect("release");

    // Nothing was written, so nothing was uploaded.
    assert_eq!(t.mem.put_calls(), 0);
    assert_eq!(t.mem.initiate_calls(), 0);
}

#[test]
fn read_back_own_writes_before_flush() {
    let t = test_fs(true, false);
    t.mem.seed("/rw", &bytes(30, 2));

    let handle = t.fs.open("/rw", libc::O_RDWR).expect("open");
    t.fs.write(handle, 3, b"XYZ").expect("write");
    let read = t.fs.read(handle, 0, 10).expect("read");
    assert_eq!(&read[3..6], b"XYZ");
    t.fs.release(handle).expect("release");
}

#[test]
fn write_on_readonly_handle_is_misuse() {
    let t = test_fs(true, false);
    t.mem.seed("/ro", &bytes(5, 1));
    let handle = t.fs.open("/ro", libc::O_RDONLY).expect("open");
    let err = t.fs.write(handle, 0, b"nope").expect_err("read-only");
    assert_eq!(obsfs::errno_of(&err), libc::EBADF);
    t.fs.release(handle).expect("release");
}

#[test]
fn new_files_appear_in_no_truncate_listing() {
    let t = test_fs(true, false);
    let handle = t.fs.open("/dir/fresh", create_flags()).expect("open");
    assert_eq!(
        t.fs.stat_cache().get_no_truncate_list("/dir"),
        vec!["fresh"]
    );
    t.fs.release(handle).expect("release");
    // Once uploaded, the pin is gone.
    assert!(t.fs.stat_cache().get_no_truncate_list("/dir").is_empty());
}

#[test]
fn stale_sessions_are_aborted_on_reconciliation() {
    let t = test_fs(true, false);
    let store: Arc<dyn ObjectStore> = t.mem.clone();
    store
        .initiate_multipart("/zombie", &Headers::new())
        .expect("orphan session");

    assert_eq!(t.fs.abort_stale_uploads().expect("reconcile"), 1);
    assert_eq!(t.mem.open_session_count(), 0);
}

#[test]
fn cache_check_upcall_reports_open_files() {
    let t = test_fs(true, false);
    let report_path = t._dir.path().join("cache-report.jsonl");

    let handle = t.fs.open("/watched", create_flags()).expect("open");
    t.fs.write(handle, 0, b"abc").expect("write");

    let signals = ControlSignals::spawn(&t.fs, ReportSink::File(report_path.clone()));
    // The logging upcalls are no-ops without an initialized subscriber but
    // must never block or panic.
    signals.bump_log_level();
    signals.reopen_log();
    signals.check_cache();

    // The walk is asynchronous; poll briefly for the report.
    let deadline = Instant::now() + Duration::from_secs(2);
    let contents = loop {
        if let Ok(contents) = std::fs::read_to_string(&report_path) {
            if !contents.is_empty() {
                break contents;
            }
        }
        assert!(Instant::now() < deadline, "no cache report written");
        std::thread::sleep(Duration::from_millis(10));
    };
    drop(signals);

    let report: serde_json::Value =
        serde_json::from_str(contents.lines().next().unwrap()).expect("json report");
    assert_eq!(report["path"], "/watched");
    assert_eq!(report["size"], 3);
    assert_eq!(report["consistent"], true);

    t.fs.release(handle).expect("release");
}
