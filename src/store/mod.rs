//! The HTTP-layer contract and an in-memory implementation.
//!
//! The engine never builds requests itself; everything store-shaped goes
//! through [`ObjectStore`]. Retry and backoff for transient failures belong
//! to the implementation behind this trait, so the engine only ever sees
//! final outcomes. `MemStore` backs the test suite and local smoke runs.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::{Error, Result};

pub mod worker;

/// Opaque header map carried verbatim between the store and the caller.
pub type Headers = BTreeMap<String, String>;

/// One entry of the ordered list sent at multipart completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_num: u32,
    pub etag: String,
}

pub trait ObjectStore: Send + Sync {
    /// HEAD: attributes for one path. Missing paths are `Error::NotFound`.
    fn head_object(&self, path: &str) -> Result<Headers>;

    /// Whole-object PUT.
    fn put_object(&self, path: &str, headers: &Headers, data: &[u8]) -> Result<()>;

    /// Ranged GET of the current object version.
    fn get_range(&self, path: &str, start: u64, size: u64) -> Result<Vec<u8>>;

    /// Initiate a multipart upload; returns the store's upload id.
    fn initiate_multipart(&self, path: &str, headers: &Headers) -> Result<String>;

    /// Upload one numbered part; returns its etag.
    fn upload_part(&self, path: &str, upload_id: &str, part_num: u32, data: &[u8])
        -> Result<String>;

    /// Populate one numbered part by server-side ranged copy from an
    /// existing object; returns its etag.
    fn copy_part(
        &self,
        path: &str,
        upload_id: &str,
        part_num: u32,
        source_path: &str,
        range: (u64, u64),
    ) -> Result<String>;

    /// Commit a multipart upload with the ordered etag list.
    fn complete_multipart(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    fn abort_multipart(&self, path: &str, upload_id: &str) -> Result<()>;

    /// Open multipart sessions, as (path, upload_id); used to reconcile
    /// sessions orphaned by a previous process.
    fn list_multipart_uploads(&self) -> Result<Vec<(String, String)>>;
}

#[derive(Debug, Default)]
struct MemSession {
    path: String,
    // part_num -> uploaded bytes (copy parts are resolved at upload time).
    parts: HashMap<u32, Vec<u8>>,
    etag_seq: u64,
}

#[derive(Debug, Default)]
struct MemState {
    objects: HashMap<String, (Headers, Vec<u8>)>,
    sessions: HashMap<String, MemSession>,
    next_upload_id: u64,
    head_calls: u64,
    put_calls: u64,
    initiate_calls: u64,
    upload_part_calls: HashMap<u32, u64>,
    copy_part_calls: u64,
    complete_calls: u64,
    aborted: Vec<String>,
    fail_parts_once: Vec<u32>,
}

/// In-memory object store for tests and local experiments. Counters expose
/// how often each call type fired so tests can assert on traffic shape.
#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn object_headers(data_len: usize, etag: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert("Content-Length".into(), data_len.to_string());
        headers.insert("ETag".into(), format!("\"{etag}\""));
        headers
    }

    /// Seed an object directly, bypassing the upload paths.
    pub fn seed(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        let headers = Self::object_headers(data.len(), "seed");
        state.objects.insert(path.to_string(), (headers, data.to_vec()));
    }

    /// Make the next upload of the given part number fail with an I/O error.
    pub fn fail_part_once(&self, part_num: u32) {
        self.state.lock().fail_parts_once.push(part_num);
    }

    pub fn object_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().objects.get(path).map(|(_, d)| d.clone())
    }

    pub fn head_calls(&self) -> u64 {
        self.state.lock().head_calls
    }

    pub fn put_calls(&self) -> u64 {
        self.state.lock().put_calls
    }

    pub fn initiate_calls(&self) -> u64 {
        self.state.lock().initiate_calls
    }

    pub fn upload_part_calls(&self, part_num: u32) -> u64 {
        self.state
            .lock()
            .upload_part_calls
            .get(&part_num)
            .copied()
            .unwrap_or(0)
    }

    pub fn copy_part_calls(&self) -> u64 {
        self.state.lock().copy_part_calls
    }

    pub fn complete_calls(&self) -> u64 {
        self.state.lock().complete_calls
    }

    pub fn aborted_upload_ids(&self) -> Vec<String> {
        self.state.lock().aborted.clone()
    }

    pub fn open_session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

impl ObjectStore for MemStore {
    fn head_object(&self, path: &str) -> Result<Headers> {
        let mut state = self.state.lock();
        state.head_calls += 1;
        match state.objects.get(path) {
            Some((headers, _)) => Ok(headers.clone()),
            None => Err(Error::NotFound(path.to_string()).into()),
        }
    }

    fn put_object(&self, path: &str, headers: &Headers, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.put_calls += 1;
        let mut stored = Self::object_headers(data.len(), &format!("put-{}", state.put_calls));
        for (key, value) in headers {
            stored.entry(key.clone()).or_insert_with(|| value.clone());
        }
        state.objects.insert(path.to_string(), (stored, data.to_vec()));
        Ok(())
    }

    fn get_range(&self, path: &str, start: u64, size: u64) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let (_, data) = state
            .objects
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        let start = start as usize;
        let end = start + size as usize;
        if end > data.len() {
            return Err(Error::Store(format!(
                "range {start}..{end} exceeds object of {} bytes",
                data.len()
            ))
            .into());
        }
        Ok(data[start..end].to_vec())
    }

    fn initiate_multipart(&self, path: &str, _headers: &Headers) -> Result<String> {
        let mut state = self.state.lock();
        state.initiate_calls += 1;
        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);
        state.sessions.insert(
            upload_id.clone(),
            MemSession {
                path: path.to_string(),
                ..MemSession::default()
            },
        );
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_num: u32,
        data: &[u8],
    ) -> Result<String> {
        let mut state = self.state.lock();
        *state.upload_part_calls.entry(part_num).or_insert(0) += 1;
        if let Some(pos) = state.fail_parts_once.iter().position(|p| *p == part_num) {
            state.fail_parts_once.remove(pos);
            return Err(Error::Store(format!("injected failure for part {part_num}")).into());
        }
        let session = state
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| Error::Store(format!("unknown upload id {upload_id}")))?;
        if session.path != path {
            return Err(Error::Store(format!(
                "upload id {upload_id} belongs to {}, not {path}",
                session.path
            ))
            .into());
        }
        session.parts.insert(part_num, data.to_vec());
        session.etag_seq += 1;
        Ok(format!("etag-{part_num}-{}", session.etag_seq))
    }

    fn copy_part(
        &self,
        path: &str,
        upload_id: &str,
        part_num: u32,
        source_path: &str,
        range: (u64, u64),
    ) -> Result<String> {
        let data = self.get_range(source_path, range.0, range.1)?;
        let mut state = self.state.lock();
        state.copy_part_calls += 1;
        let session = state
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| Error::Store(format!("unknown upload id {upload_id}")))?;
        if session.path != path {
            return Err(Error::Store(format!(
                "upload id {upload_id} belongs to {}, not {path}",
                session.path
            ))
            .into());
        }
        session.parts.insert(part_num, data);
        session.etag_seq += 1;
        Ok(format!("etag-{part_num}-{}", session.etag_seq))
    }

    fn complete_multipart(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.complete_calls += 1;
        let session = state
            .sessions
            .remove(upload_id)
            .ok_or_else(|| Error::Store(format!("unknown upload id {upload_id}")))?;
        let mut assembled = Vec::new();
        let mut prev_num = 0;
        for completed in parts {
            if completed.part_num <= prev_num {
                return Err(Error::Store(format!(
                    "part numbers out of order at {}",
                    completed.part_num
                ))
                .into());
            }
            prev_num = completed.part_num;
            let data = session.parts.get(&completed.part_num).ok_or_else(|| {
                Error::Store(format!("completing unknown part {}", completed.part_num))
            })?;
            assembled.extend_from_slice(data);
        }
        let headers = Self::object_headers(assembled.len(), upload_id);
        state.objects.insert(path.to_string(), (headers, assembled));
        Ok(())
    }

    fn abort_multipart(&self, _path: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.sessions.remove(upload_id);
        state.aborted.push(upload_id.to_string());
        Ok(())
    }

    fn list_multipart_uploads(&self) -> Result<Vec<(String, String)>> {
        let state = self.state.lock();
        Ok(state
            .sessions
            .iter()
            .map(|(id, session)| (session.path.clone(), id.clone()))
            .collect())
    }
}
