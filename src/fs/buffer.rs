//! Local buffer files backing open objects.
//!
//! Each open path gets one buffer file on local disk. The buffer is shared
//! by the operation thread (which appends) and upload workers (which read
//! with positioned I/O), so all access goes through offset-based calls and
//! readers must tolerate the file growing underneath them.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::{Error, Result};

static BUFFER_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct FileBuffer {
    file: File,
    path: PathBuf,
}

impl FileBuffer {
    /// Read exactly `size` bytes at `start`, retrying short reads so a
    /// concurrent append cannot tear the result.
    pub fn read_exact_at(&self, start: u64, size: u64) -> Result<Vec<u8>> {
        let mut data = vec![0u8; size as usize];
        let mut done = 0usize;
        while done < data.len() {
            let n = self.file.read_at(&mut data[done..], start + done as u64)?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("buffer ends inside range {start}+{size}"),
                ))
                .into());
            }
            done += n;
        }
        Ok(data)
    }

    pub fn write_all_at(&self, data: &[u8], start: u64) -> Result<()> {
        self.file.write_all_at(data, start)?;
        Ok(())
    }

    pub fn set_len(&self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl Drop for FileBuffer {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to remove buffer file");
        }
    }
}

pub struct BufferManager {
    dir: PathBuf,
}

impl BufferManager {
    pub fn new(dir: Option<PathBuf>) -> Result<Self> {
        let dir = dir.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("obsfs-{}", std::process::id()))
        });
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Create an empty buffer pre-sized to `size` (sparse where the
    /// filesystem supports it).
    pub fn create(&self, handle_id: u64, size: u64) -> Result<Arc<FileBuffer>> {
        let seq = BUFFER_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("buf-{handle_id}-{seq}"));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.set_len(size)?;
        debug!(path = %path.display(), size, "buffer file created");
        Ok(Arc::new(FileBuffer { file, path }))
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        // Best effort; the directory is only removable once all buffers drop.
        let _ = std::fs::remove_dir(&self.dir);
    }
}
