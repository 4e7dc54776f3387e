//! The filesystem facade: opens handles, buffers mutations locally, and
//! drives the write path from dirty pages to committed uploads.
//!
//! All collaborators are explicit members of [`ObjectFs`] and threaded into
//! operations, so two instances never share state and teardown is dropping
//! the value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheHit, ObjectAttr, StatCache};
use crate::config::FsConfig;
use crate::store::worker::WorkerPool;
use crate::store::{Headers, ObjectStore};
use crate::{Error, Result};

pub mod buffer;
pub mod fd_info;
pub mod handle;
pub mod page_list;
pub mod planner;

use buffer::BufferManager;
use fd_info::PseudoFdInfo;
use handle::HandleRegistry;
use page_list::{ByteRange, Page, PageList};
use planner::PartPolicy;

struct OpenFile {
    path: String,
    fd: PseudoFdInfo,
    pages: Mutex<PageList>,
    /// Serializes write/flush/release against each other for one file.
    /// Workers never take it, so holding it across a barrier is safe.
    op_lock: Mutex<()>,
    /// Created locally and not yet materialized remotely; forces a PUT on
    /// flush even when nothing was written.
    force_put: AtomicBool,
}

/// Per-file page accounting emitted by the cache-check upcall.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: String,
    pub handle: u64,
    pub size: u64,
    pub pages: Vec<Page>,
    pub untreated: Vec<ByteRange>,
    pub consistent: bool,
}

pub struct ObjectFs {
    config: FsConfig,
    store: Arc<dyn ObjectStore>,
    stat_cache: StatCache,
    registry: HandleRegistry,
    handles: DashMap<u64, Arc<OpenFile>>,
    pool: WorkerPool,
    buffers: BufferManager,
}

impl ObjectFs {
    pub fn new(config: FsConfig, store: Arc<dyn ObjectStore>) -> Result<Arc<Self>> {
        config.validate()?;
        let stat_cache = StatCache::from_config(&config);
        let pool = WorkerPool::new(config.upload_parallelism);
        let buffers = BufferManager::new(config.buffer_dir.clone())?;
        Ok(Arc::new(Self {
            config,
            store,
            stat_cache,
            registry: HandleRegistry::new(),
            handles: DashMap::new(),
            pool,
            buffers,
        }))
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn stat_cache(&self) -> &StatCache {
        &self.stat_cache
    }

    fn part_policy(&self) -> PartPolicy {
        PartPolicy {
            max_part_size: self.config.max_part_size,
            min_part_size: self.config.min_part_size,
            max_copy_size: self.config.max_copy_part,
            use_copy: self.config.use_copy_upload,
        }
    }

    /// Cache-first attribute lookup. On a miss the store is HEADed and the
    /// result (positive or negative) is fed back into the cache.
    pub fn lookup(&self, path: &str) -> Result<ObjectAttr> {
        match self.stat_cache.get(path, true, None) {
            Some(CacheHit::Found(cached)) => return Ok(cached.attr),
            Some(CacheHit::Negative) => {
                return Err(Error::NotFound(path.to_string()).into());
            }
            None => {}
        }
        match self.store.head_object(path) {
            Ok(headers) => {
                self.stat_cache.add(path, &headers, false, false);
                Ok(ObjectAttr::from_headers(path, &headers))
            }
            Err(err) => {
                if matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))) {
                    self.stat_cache.add_negative(path);
                }
                Err(err)
            }
        }
    }

    /// Open a handle for `path`. `flags` follows open(2); O_CREAT allows the
    /// path to be absent and pins the new entry into readdir output until it
    /// is uploaded.
    pub fn open(&self, path: &str, flags: i32) -> Result<u64> {
        let create = flags & libc::O_CREAT != 0;
        let (size, created) = match self.lookup(path) {
            Ok(attr) => (attr.size, false),
            Err(err) => {
                let not_found = matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_)));
                if not_found && create {
                    (0, true)
                } else {
                    return Err(err);
                }
            }
        };

        let handle = self.registry.acquire();
        let buffer = match self.buffers.create(handle, size) {
            Ok(buffer) => buffer,
            Err(err) => {
                self.registry.release(handle);
                return Err(err);
            }
        };

        if created {
            let mut headers = Headers::new();
            headers.insert("Content-Length".into(), "0".into());
            self.stat_cache.add(path, &headers, false, true);
        }

        self.handles.insert(
            handle,
            Arc::new(OpenFile {
                path: path.to_string(),
                fd: PseudoFdInfo::new(handle, flags, buffer),
                pages: Mutex::new(PageList::new(size)),
                op_lock: Mutex::new(()),
                force_put: AtomicBool::new(created),
            }),
        );
        debug!(path, handle, size, created, "handle opened");
        Ok(handle)
    }

    fn file(&self, handle: u64) -> Result<Arc<OpenFile>> {
        self.handles
            .get(&handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Misuse(format!("no open handle {handle}")).into())
    }

    pub fn write(&self, handle: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let file = self.file(handle)?;
        if !file.fd.writable() {
            return Err(Error::Misuse(format!("handle {handle} is not writable")).into());
        }
        if data.is_empty() {
            return Ok(0);
        }
        let _op = file.op_lock.lock();

        file.fd.buffer().write_all_at(data, offset)?;
        {
            let mut pages = file.pages.lock();
            let old_size = pages.size();
            pages.mark_dirty(offset, data.len() as u64);
            // Bytes between the old end and the write offset are fresh zeros
            // in the sparse buffer, not remote content.
            if offset > old_size {
                pages.mark_loaded(old_size, offset - old_size);
            }
        }

        // Stream out whole slabs while writes continue; a no-op until the
        // freshest untreated run crosses a slab boundary.
        let headers = self.object_headers(&file.path);
        file.fd.upload_boundary_last_untreated(
            &file.path,
            &headers,
            &file.pages,
            &self.store,
            &self.pool,
            self.config.max_part_size,
        )?;

        Ok(data.len())
    }

    pub fn read(&self, handle: u64, offset: u64, size: u64) -> Result<Vec<u8>> {
        let file = self.file(handle)?;
        let _op = file.op_lock.lock();

        let file_size = file.pages.lock().size();
        if offset >= file_size {
            return Ok(Vec::new());
        }
        let size = size.min(file_size - offset);
        self.ensure_loaded(&file, offset, size)?;
        file.fd.buffer().read_exact_at(offset, size)
    }

    /// Download any never-loaded subranges of [start, start+size) into the
    /// local buffer.
    fn ensure_loaded(&self, file: &OpenFile, start: u64, size: u64) -> Result<()> {
        let missing = file.pages.lock().get_unloaded(start, size);
        for range in missing {
            let data = self.store.get_range(&file.path, range.start, range.size)?;
            file.fd.buffer().write_all_at(&data, range.start)?;
            file.pages.lock().mark_loaded(range.start, range.size);
        }
        Ok(())
    }

    pub fn flush(&self, handle: u64) -> Result<()> {
        let file = self.file(handle)?;
        let _op = file.op_lock.lock();
        self.flush_locked(&file)
    }

    fn flush_locked(&self, file: &OpenFile) -> Result<()> {
        let size = file.pages.lock().size();
        let untreated = file.pages.lock().get_untreated();
        let force_put = file.force_put.load(Ordering::SeqCst);
        if untreated.is_empty() && !file.fd.is_uploading() && !force_put {
            return Ok(());
        }

        if !file.fd.is_uploading() && size <= self.config.max_part_size {
            self.flush_small(file, size)?;
        } else {
            self.flush_multipart(file, size, &untreated)?;
        }

        file.force_put.store(false, Ordering::SeqCst);
        file.pages.lock().mark_uploaded(0, size);
        self.refresh_cache(&file.path);
        Ok(())
    }

    /// Whole-object PUT for files at or below one slab.
    fn flush_small(&self, file: &OpenFile, size: u64) -> Result<()> {
        self.ensure_loaded(file, 0, size)?;
        let data = if size == 0 {
            Vec::new()
        } else {
            file.fd.buffer().read_exact_at(0, size)?
        };
        let headers = self.object_headers(&file.path);
        self.store.put_object(&file.path, &headers, &data)?;
        debug!(path = %file.path, size, "small object uploaded");
        Ok(())
    }

    fn flush_multipart(&self, file: &OpenFile, size: u64, untreated: &[ByteRange]) -> Result<()> {
        let last_part = size.div_ceil(self.config.max_part_size);
        if last_part > u64::from(self.config.max_parts) {
            return Err(Error::Store(format!(
                "object of {size} bytes needs {last_part} parts, store allows {}",
                self.config.max_parts
            ))
            .into());
        }

        let views = file.fd.part_views();
        let plan = planner::plan_whole_file(&views, untreated, size, &self.part_policy())?;

        file.fd.cancel_parts(&plan.to_cancel);
        if plan.wait_upload_complete {
            let rc = file.fd.wait_all_threads_exit();
            if rc != 0 {
                let _ = file.fd.abort(&file.path, &self.store);
                return Err(crate::error_from_errno(rc).into());
            }
        }

        // Gaps the planner wants re-uploaded are fetched into the buffer
        // first; ranges already present locally are skipped.
        for range in &plan.to_download {
            self.ensure_loaded(file, range.start, range.size)?;
        }

        if !file.fd.is_uploading() {
            let headers = self.object_headers(&file.path);
            file.fd
                .pre_multipart_upload(&file.path, &headers, &self.store)?;
        }
        file.fd
            .parallel_multipart_upload(&file.path, &plan.to_upload, false, &self.store, &self.pool)?;
        file.fd
            .parallel_multipart_upload(&file.path, &plan.to_copy, true, &self.store, &self.pool)?;

        file.fd.commit(&file.path, size, &self.store)
    }

    /// Flush, then drop local resources no matter how the flush went; the
    /// flush error (if any) is what close reports.
    pub fn release(&self, handle: u64) -> Result<()> {
        let file = self.file(handle)?;
        let result = {
            let _op = file.op_lock.lock();
            let result = self.flush_locked(&file);
            if result.is_err() && file.fd.is_uploading() {
                if let Err(err) = file.fd.abort(&file.path, &self.store) {
                    warn!(path = %file.path, %err, "session abort on release failed");
                }
            }
            result
        };
        self.handles.remove(&handle);
        self.registry.release(handle);
        debug!(path = %file.path, handle, ok = result.is_ok(), "handle released");
        result
    }

    /// Abort store-side multipart sessions that no open handle owns; called
    /// once at startup since in-flight sessions do not survive a restart.
    pub fn abort_stale_uploads(&self) -> Result<usize> {
        let live: Vec<String> = self
            .handles
            .iter()
            .filter_map(|entry| entry.value().fd.upload_id())
            .collect();
        let mut aborted = 0;
        for (path, upload_id) in self.store.list_multipart_uploads()? {
            if live.contains(&upload_id) {
                continue;
            }
            match self.store.abort_multipart(&path, &upload_id) {
                Ok(()) => {
                    info!(path, upload_id = %upload_id, "aborted stale multipart upload");
                    aborted += 1;
                }
                Err(err) => warn!(path, upload_id = %upload_id, %err, "stale abort failed"),
            }
        }
        Ok(aborted)
    }

    /// Page accounting for every open handle, for the cache-check upcall.
    pub fn cache_report(&self) -> Vec<FileReport> {
        self.handles
            .iter()
            .map(|entry| {
                let file = entry.value();
                let pages = file.pages.lock();
                FileReport {
                    path: file.path.clone(),
                    handle: *entry.key(),
                    size: pages.size(),
                    pages: pages.snapshot(),
                    untreated: pages.get_untreated(),
                    consistent: pages.check_integrity().is_ok(),
                }
            })
            .collect()
    }

    pub fn worker_pool_snapshot(&self) -> crate::store::worker::WorkerPoolSnapshot {
        self.pool.snapshot()
    }

    fn object_headers(&self, path: &str) -> Headers {
        match self.stat_cache.get(path, false, None) {
            Some(CacheHit::Found(cached)) => cached.headers,
            _ => {
                let mut headers = Headers::new();
                headers.insert("Content-Type".into(), "application/octet-stream".into());
                headers
            }
        }
    }

    /// Re-HEAD after a successful upload so lookups see the new attributes.
    fn refresh_cache(&self, path: &str) {
        self.stat_cache.del(path);
        match self.store.head_object(path) {
            Ok(headers) => self.stat_cache.add(path, &headers, false, false),
            Err(err) => debug!(path, %err, "post-upload HEAD failed; cache left cold"),
        }
    }
}
