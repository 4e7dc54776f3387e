//! Per-handle multipart upload coordination.
//!
//! A handle owns at most one multipart session. Parts are dispatched to the
//! worker pool; each worker records its etag into a session-owned arena slot
//! and signals a condvar after decrementing the outstanding-instruction
//! count, so `wait_all_threads_exit` is a plain counter barrier. The first
//! non-zero errno any worker records is the session's result; later
//! successes never overwrite it, and workers consult it at entry as the
//! cancellation checkpoint.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::fs::buffer::FileBuffer;
use crate::fs::page_list::PageList;
use crate::fs::planner::{self, PartPlan, PartView};
use crate::store::{CompletedPart, Headers, ObjectStore};
use crate::store::worker::WorkerPool;
use crate::{errno_of, error_from_errno, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Pending,
    InFlight,
    Uploaded,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct UploadPart {
    pub part_num: u32,
    pub start: u64,
    pub size: u64,
    pub is_copy: bool,
    pub state: PartState,
    /// Index into the session's etag arena; stable for the session lifetime.
    etag_slot: usize,
}

impl UploadPart {
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

#[derive(Default)]
struct SessionState {
    upload_id: Option<String>,
    parts: Vec<UploadPart>,
    canceled: Vec<UploadPart>,
    etag_arena: Vec<Option<String>>,
    instruct_count: usize,
    last_result: i32,
}

impl SessionState {
    fn reset(&mut self) {
        self.upload_id = None;
        self.parts.clear();
        self.canceled.clear();
        self.etag_arena.clear();
        self.instruct_count = 0;
        self.last_result = 0;
    }

    fn push_part(&mut self, part_num: u32, start: u64, size: u64, is_copy: bool) -> usize {
        let etag_slot = self.etag_arena.len();
        self.etag_arena.push(None);
        self.parts.push(UploadPart {
            part_num,
            start,
            size,
            is_copy,
            state: PartState::Pending,
            etag_slot,
        });
        etag_slot
    }
}

struct SessionShared {
    state: Mutex<SessionState>,
    cond: Condvar,
}

pub struct PseudoFdInfo {
    handle_id: u64,
    flags: i32,
    buffer: Arc<FileBuffer>,
    session: Arc<SessionShared>,
}

impl PseudoFdInfo {
    pub fn new(handle_id: u64, flags: i32, buffer: Arc<FileBuffer>) -> Self {
        Self {
            handle_id,
            flags,
            buffer,
            session: Arc::new(SessionShared {
                state: Mutex::new(SessionState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    pub fn buffer(&self) -> &Arc<FileBuffer> {
        &self.buffer
    }

    pub fn writable(&self) -> bool {
        self.flags & (libc::O_WRONLY | libc::O_RDWR) != 0
    }

    pub fn is_uploading(&self) -> bool {
        self.session.state.lock().upload_id.is_some()
    }

    pub fn upload_id(&self) -> Option<String> {
        self.session.state.lock().upload_id.clone()
    }

    /// Planner view of the active (non-canceled) parts, ordered by offset.
    pub fn part_views(&self) -> Vec<PartView> {
        let state = self.session.state.lock();
        let mut views: Vec<PartView> = state
            .parts
            .iter()
            .map(|p| PartView {
                part_num: p.part_num,
                start: p.start,
                size: p.size,
                uploaded: p.state == PartState::Uploaded,
            })
            .collect();
        views.sort_by_key(|v| v.start);
        views
    }

    /// Issue the store's initiate request and install the returned upload id.
    /// A session may be initiated only once; commit or abort it first.
    pub fn pre_multipart_upload(
        &self,
        path: &str,
        headers: &Headers,
        store: &Arc<dyn ObjectStore>,
    ) -> Result<()> {
        if self.is_uploading() {
            return Err(Error::Misuse(format!(
                "multipart upload already started for {path}"
            ))
            .into());
        }
        let upload_id = store.initiate_multipart(path, headers)?;
        debug!(path, upload_id = %upload_id, handle = self.handle_id, "multipart upload initiated");
        let mut state = self.session.state.lock();
        state.reset();
        state.upload_id = Some(upload_id);
        Ok(())
    }

    /// Append a part exactly continuous with the preceding one.
    pub fn append_upload_part(&self, start: u64, size: u64, is_copy: bool) -> Result<u32> {
        let mut state = self.session.state.lock();
        if state.upload_id.is_none() {
            return Err(Error::Misuse("multipart upload has not started".into()).into());
        }
        let next_start = state.parts.last().map(|p| p.end()).unwrap_or(0);
        if start != next_start {
            return Err(Error::Invariant(format!(
                "part start {start} is discontiguous; expected {next_start}"
            ))
            .into());
        }
        let part_num = state.parts.len() as u32 + 1;
        state.push_part(part_num, start, size, is_copy);
        Ok(part_num)
    }

    /// Unordered insert used by the planner; the list is re-sorted by part
    /// number after each insert.
    pub fn insert_upload_part(
        &self,
        start: u64,
        size: u64,
        part_num: u32,
        is_copy: bool,
    ) -> Result<usize> {
        let mut state = self.session.state.lock();
        if state.upload_id.is_none() {
            return Err(Error::Misuse("multipart upload has not started".into()).into());
        }
        if size == 0 || part_num == 0 {
            return Err(Error::Invariant(format!(
                "invalid part: number {part_num}, size {size}"
            ))
            .into());
        }
        let slot = state.push_part(part_num, start, size, is_copy);
        state.parts.sort_by_key(|p| p.part_num);
        Ok(slot)
    }

    /// Move superseded parts out of the active list.
    pub fn cancel_parts(&self, part_nums: &[u32]) {
        if part_nums.is_empty() {
            return;
        }
        let mut state = self.session.state.lock();
        let mut idx = 0;
        while idx < state.parts.len() {
            if part_nums.contains(&state.parts[idx].part_num) {
                let mut part = state.parts.remove(idx);
                debug!(
                    part_num = part.part_num,
                    start = part.start,
                    size = part.size,
                    "canceling superseded upload part"
                );
                part.state = PartState::Canceled;
                state.canceled.push(part);
            } else {
                idx += 1;
            }
        }
    }

    /// Insert every plan entry and dispatch a worker per part. Workers fill
    /// the etag slot on success, record the first failure errno, and signal
    /// the session condvar.
    pub fn parallel_multipart_upload(
        &self,
        path: &str,
        entries: &[PartPlan],
        is_copy: bool,
        store: &Arc<dyn ObjectStore>,
        pool: &WorkerPool,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let upload_id = self
            .session
            .state
            .lock()
            .upload_id
            .clone()
            .ok_or_else(|| Error::Misuse("multipart upload has not started".into()))?;

        for entry in entries {
            let slot = self.insert_upload_part(entry.start, entry.size, entry.part_num, is_copy)?;
            {
                let mut state = self.session.state.lock();
                if let Some(part) = state.parts.iter_mut().find(|p| p.etag_slot == slot) {
                    part.state = PartState::InFlight;
                }
                state.instruct_count += 1;
            }

            let shared = self.session.clone();
            let buffer = self.buffer.clone();
            let store = store.clone();
            let path = path.to_string();
            let upload_id = upload_id.clone();
            let entry = *entry;
            pool.submit(move || {
                // Cancellation checkpoint: a sibling already failed, skip the
                // request and just drain.
                let short_circuit = shared.state.lock().last_result != 0;
                let outcome: Result<String> = if short_circuit {
                    Err(Error::Canceled.into())
                } else if is_copy {
                    store.copy_part(
                        &path,
                        &upload_id,
                        entry.part_num,
                        &path,
                        (entry.start, entry.size),
                    )
                } else {
                    buffer
                        .read_exact_at(entry.start, entry.size)
                        .and_then(|data| {
                            store.upload_part(&path, &upload_id, entry.part_num, &data)
                        })
                };

                let mut state = shared.state.lock();
                match outcome {
                    Ok(etag) => {
                        state.etag_arena[slot] = Some(etag);
                        if let Some(part) =
                            state.parts.iter_mut().find(|p| p.etag_slot == slot)
                        {
                            part.state = PartState::Uploaded;
                        } else if let Some(part) =
                            state.canceled.iter_mut().find(|p| p.etag_slot == slot)
                        {
                            part.state = PartState::Uploaded;
                        }
                    }
                    Err(err) => {
                        if !short_circuit {
                            warn!(
                                path = %path,
                                part_num = entry.part_num,
                                %err,
                                "part upload failed"
                            );
                            if state.last_result == 0 {
                                state.last_result = errno_of(&err);
                            }
                        }
                    }
                }
                state.instruct_count -= 1;
                drop(state);
                shared.cond.notify_all();
            });
        }
        Ok(())
    }

    /// Barrier: block until every dispatched worker has signalled, then
    /// return the first recorded errno (zero when all succeeded).
    pub fn wait_all_threads_exit(&self) -> i32 {
        let mut state = self.session.state.lock();
        while state.instruct_count > 0 {
            self.session.cond.wait(&mut state);
        }
        state.last_result
    }

    /// Ask running workers to stop at their next checkpoint and drain them.
    /// In-flight requests run to completion; this only returns once the
    /// instruction count is zero.
    pub fn cancel_all_threads(&self) {
        {
            let mut state = self.session.state.lock();
            if state.instruct_count == 0 {
                return;
            }
            debug!(handle = self.handle_id, "canceling outstanding upload workers");
            if state.last_result == 0 {
                state.last_result = libc::ECANCELED;
            }
        }
        self.wait_all_threads_exit();
    }

    /// Streaming flush: upload the slab-aligned body of the most recently
    /// dirtied untreated run, leaving the unaligned fragments untreated.
    /// A no-op until the run spans at least one whole slab.
    pub fn upload_boundary_last_untreated(
        &self,
        path: &str,
        headers: &Headers,
        pages: &Mutex<PageList>,
        store: &Arc<dyn ObjectStore>,
        pool: &WorkerPool,
        max_part_size: u64,
    ) -> Result<()> {
        let run = match pages.lock().get_last_update_untreated() {
            Some(run) => run,
            None => return Ok(()),
        };
        let aligned = match planner::align_untreated_run(run, max_part_size) {
            Some(aligned) => aligned,
            None => return Ok(()),
        };

        let plan = planner::plan_boundary_slab(
            &self.part_views(),
            aligned.start,
            aligned.size,
            max_part_size,
        )?;
        if plan.to_upload.is_empty() {
            return Ok(());
        }

        self.cancel_parts(&plan.to_cancel);
        if plan.wait_upload_complete {
            let rc = self.wait_all_threads_exit();
            if rc != 0 {
                return Err(error_from_errno(rc).into());
            }
        }
        if !self.is_uploading() {
            self.pre_multipart_upload(path, headers, store)?;
        }
        self.parallel_multipart_upload(path, &plan.to_upload, false, store, pool)?;

        let behind_start = plan.assigned.end();
        let behind_size = run.end().saturating_sub(behind_start);
        pages.lock().replace_last_update_untreated(
            run.start,
            plan.assigned.start - run.start,
            behind_start,
            behind_size,
        )?;
        Ok(())
    }

    /// Join workers and finalize the upload. Any recorded worker error turns
    /// the commit into an abort and is returned to the caller; the prior
    /// object version stays untouched.
    pub fn commit(
        &self,
        path: &str,
        expected_size: u64,
        store: &Arc<dyn ObjectStore>,
    ) -> Result<()> {
        let rc = self.wait_all_threads_exit();
        if rc != 0 {
            if let Err(err) = self.abort(path, store) {
                warn!(path, %err, "abort after failed upload also failed");
            }
            return Err(error_from_errno(rc).into());
        }

        let (upload_id, completed) = {
            let state = self.session.state.lock();
            let upload_id = state
                .upload_id
                .clone()
                .ok_or_else(|| Error::Misuse("commit without an active upload".into()))?;
            match Self::collect_completed(&state, expected_size) {
                Ok(completed) => (upload_id, completed),
                Err(err) => {
                    drop(state);
                    if let Err(abort_err) = self.abort(path, store) {
                        warn!(path, %abort_err, "abort after invalid part list failed");
                    }
                    return Err(err);
                }
            }
        };

        store.complete_multipart(path, &upload_id, &completed)?;
        debug!(path, upload_id = %upload_id, parts = completed.len(), "multipart upload committed");
        self.session.state.lock().reset();
        Ok(())
    }

    /// Ordered etag list for completion; fails fast when the part layout
    /// does not cover the file exactly once.
    fn collect_completed(state: &SessionState, expected_size: u64) -> Result<Vec<CompletedPart>> {
        let mut completed = Vec::with_capacity(state.parts.len());
        let mut expected_start = 0u64;
        for part in &state.parts {
            if part.start != expected_start {
                return Err(Error::Invariant(format!(
                    "part {} starts at {}, expected {expected_start}",
                    part.part_num, part.start
                ))
                .into());
            }
            if part.state != PartState::Uploaded {
                return Err(Error::Invariant(format!(
                    "part {} was never uploaded",
                    part.part_num
                ))
                .into());
            }
            let etag = state.etag_arena[part.etag_slot].clone().ok_or_else(|| {
                Error::Invariant(format!("part {} has no etag", part.part_num))
            })?;
            completed.push(CompletedPart {
                part_num: part.part_num,
                etag,
            });
            expected_start = part.end();
        }
        if expected_start != expected_size {
            return Err(Error::Invariant(format!(
                "parts cover {expected_start} bytes of a {expected_size} byte object"
            ))
            .into());
        }
        Ok(completed)
    }

    /// Drain workers and drop the session, telling the store to discard the
    /// upload. Local state is cleared even when the store call fails.
    pub fn abort(&self, path: &str, store: &Arc<dyn ObjectStore>) -> Result<()> {
        self.cancel_all_threads();
        let upload_id = {
            let mut state = self.session.state.lock();
            let upload_id = state.upload_id.take();
            state.reset();
            upload_id
        };
        if let Some(upload_id) = upload_id {
            store.abort_multipart(path, &upload_id)?;
            debug!(path, upload_id = %upload_id, "multipart upload aborted");
        }
        Ok(())
    }
}
