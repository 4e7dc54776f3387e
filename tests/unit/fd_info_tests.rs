use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use obsfs::fs::buffer::BufferManager;
use obsfs::fs::fd_info::PseudoFdInfo;
use obsfs::fs::planner::PartPlan;
use obsfs::store::worker::WorkerPool;
use obsfs::store::{Headers, MemStore, ObjectStore};

struct Harness {
    fd: PseudoFdInfo,
    mem: Arc<MemStore>,
    store: Arc<dyn ObjectStore>,
    pool: WorkerPool,
    _dir: tempfile::TempDir,
}

fn harness(buffer_contents: &[u8]) -> Harness {
    let dir = tempdir().expect("tempdir");
    let buffers = BufferManager::new(Some(dir.path().to_path_buf())).expect("buffer manager");
    let buffer = buffers.create(1, 0).expect("buffer");
    buffer.write_all_at(buffer_contents, 0).expect("seed buffer");

    let mem = Arc::new(MemStore::new());
    let store: Arc<dyn ObjectStore> = mem.clone();
    Harness {
        fd: PseudoFdInfo::new(1, libc::O_RDWR, buffer),
        mem,
        store,
        pool: WorkerPool::new(3),
        _dir: dir,
    }
}

/// A store wrapper that delays part uploads, to give the barrier something
/// to actually wait for.
struct SlowStore {
    inner: Arc<MemStore>,
    delay: Duration,
}

impl ObjectStore for SlowStore {
    fn head_object(&self, path: &str) -> obsfs::Result<Headers> {
        self.inner.head_object(path)
    }
    fn put_object(&self, path: &str, headers: &Headers, data: &[u8]) -> obsfs::Result<()> {
        self.inner.put_object(path, headers, data)
    }
    fn get_range(&self, path: &str, start: u64, size: u64) -> obsfs::Result<Vec<u8>> {
        self.inner.get_range(path, start, size)
    }
    fn initiate_multipart(&self, path: &str, headers: &Headers) -> obsfs::Result<String> {
        self.inner.initiate_multipart(path, headers)
    }
    fn upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_num: u32,
        data: &[u8],
    ) -> obsfs::Result<String> {
        std::thread::sleep(self.delay);
        self.inner.upload_part(path, upload_id, part_num, data)
    }
    fn copy_part(
        &self,
        path: &str,
        upload_id: &str,
        part_num: u32,
        source_path: &str,
        range: (u64, u64),
    ) -> obsfs::Result<String> {
        self.inner.copy_part(path, upload_id, part_num, source_path, range)
    }
    fn complete_multipart(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[obsfs::store::CompletedPart],
    ) -> obsfs::Result<()> {
        self.inner.complete_multipart(path, upload_id, parts)
    }
    fn abort_multipart(&self, path: &str, upload_id: &str) -> obsfs::Result<()> {
        self.inner.abort_multipart(path, upload_id)
    }
    fn list_multipart_uploads(&self) -> obsfs::Result<Vec<(String, String)>> {
        self.inner.list_multipart_uploads()
    }
}

#[test]
fn append_requires_contiguity() {
    let h = harness(&[0u8; 30]);
    h.fd
        .pre_multipart_upload("/obj", &Headers::new(), &h.store)
        .expect("initiate");

    assert_eq!(h.fd.append_upload_part(0, 10, false).unwrap(), 1);
    assert_eq!(h.fd.append_upload_part(10, 5, false).unwrap(), 2);
    // 20 leaves a 5-byte hole after part 2.
    assert!(h.fd.append_upload_part(20, 10, false).is_err());
}

#[test]
fn operations_without_session_are_misuse() {
    let h = harness(&[0u8; 10]);
    assert!(h.fd.append_upload_part(0, 10, false).is_err());
    assert!(h.fd.insert_upload_part(0, 10, 1, false).is_err());
    assert!(!h.fd.is_uploading());
}

#[test]
fn double_initiate_is_rejected() {
    let h = harness(&[0u8; 10]);
    h.fd
        .pre_multipart_upload("/obj", &Headers::new(), &h.store)
        .expect("initiate");
    assert!(h
        .fd
        .pre_multipart_upload("/obj", &Headers::new(), &h.store)
        .is_err());
}

#[test]
fn insert_resorts_by_part_number() {
    let h = harness(&[0u8; 30]);
    h.fd
        .pre_multipart_upload("/obj", &Headers::new(), &h.store)
        .expect("initiate");
    h.fd.insert_upload_part(20, 10, 3, false).unwrap();
    h.fd.insert_upload_part(0, 10, 1, false).unwrap();
    h.fd.insert_upload_part(10, 10, 2, false).unwrap();

    let views = h.fd.part_views();
    let numbers: Vec<u32> = views.iter().map(|v| v.part_num).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[test]
fn parallel_upload_and_commit_assembles_object() {
    let data: Vec<u8> = (0..20u8).collect();
    let h = harness(&data);
    h.fd
        .pre_multipart_upload("/obj", &Headers::new(), &h.store)
        .expect("initiate");

    let plan = [
        PartPlan { start: 0, size: 10, part_num: 1 },
        PartPlan { start: 10, size: 10, part_num: 2 },
    ];
    h.fd
        .parallel_multipart_upload("/obj", &plan, false, &h.store, &h.pool)
        .expect("dispatch");

    h.fd.commit("/obj", 20, &h.store).expect("commit");
    assert_eq!(h.mem.object_bytes("/obj").unwrap(), data);
    assert_eq!(h.mem.complete_calls(), 1);
    assert!(!h.fd.is_uploading());
}

#[test]
fn barrier_waits_for_slow_workers() {
    let data: Vec<u8> = (0..30u8).collect();
    let h = harness(&data);
    let slow: Arc<dyn ObjectStore> = Arc::new(SlowStore {
        inner: h.mem.clone(),
        delay: Duration::from_millis(60),
    });
    h.fd
        .pre_multipart_upload("/obj", &Headers::new(), &slow)
        .expect("initiate");

    let plan = [
        PartPlan { start: 0, size: 10, part_num: 1 },
        PartPlan { start: 10, size: 10, part_num: 2 },
        PartPlan { start: 20, size: 10, part_num: 3 },
    ];
    h.fd
        .parallel_multipart_upload("/obj", &plan, false, &slow, &h.pool)
        .expect("dispatch");

    assert_eq!(h.fd.wait_all_threads_exit(), 0);
    // After the barrier every part must be finished and committable.
    h.fd.commit("/obj", 30, &slow).expect("commit");
    assert_eq!(h.mem.object_bytes("/obj").unwrap(), data);
}

#[test]
fn first_error_wins_and_commit_aborts() {
    let data: Vec<u8> = (0..20u8).collect();
    let h = harness(&data);
    h.mem.fail_part_once(1);
    h.fd
        .pre_multipart_upload("/obj", &Headers::new(), &h.store)
        .expect("initiate");
    let upload_id = h.fd.upload_id().expect("upload id");

    let plan = [
        PartPlan { start: 0, size: 10, part_num: 1 },
        PartPlan { start: 10, size: 10, part_num: 2 },
    ];
    h.fd
        .parallel_multipart_upload("/obj", &plan, false, &h.store, &h.pool)
        .expect("dispatch");

    let rc = h.fd.wait_all_threads_exit();
    assert_eq!(rc, libc::EIO);

    assert!(h.fd.commit("/obj", 20, &h.store).is_err());
    assert_eq!(h.mem.complete_calls(), 0);
    assert_eq!(h.mem.aborted_upload_ids(), vec![upload_id]);
    assert!(h.mem.object_bytes("/obj").is_none());
    assert!(!h.fd.is_uploading());
}

#[test]
fn cancel_all_threads_is_idempotent_when_idle() {
    let h = harness(&[0u8; 10]);
    h.fd.cancel_all_threads();
    assert_eq!(h.fd.wait_all_threads_exit(), 0);
}

#[test]
fn canceled_parts_leave_active_views() {
    let h = harness(&[0u8; 30]);
    h.fd
        .pre_multipart_upload("/obj", &Headers::new(), &h.store)
        .expect("initiate");
    h.fd.insert_upload_part(0, 10, 1, false).unwrap();
    h.fd.insert_upload_part(10, 10, 2, false).unwrap();

    h.fd.cancel_parts(&[1]);
    let views = h.fd.part_views();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].part_num, 2);
}

#[test]
fn abort_without_session_is_clean() {
    let h = harness(&[0u8; 10]);
    h.fd.abort("/obj", &h.store).expect("abort is a no-op");
    assert!(h.mem.aborted_upload_ids().is_empty());
}
