//! Per-open-file byte-range bookkeeping.
//!
//! A file is covered by non-overlapping pages carrying {loaded, modified,
//! uploaded} flags. Neighboring pages with identical flags are merged after
//! every mutation, so the list stays proportional to the number of distinct
//! regions rather than the number of writes. "Untreated" means modified and
//! not yet assigned to an upload part.

use serde::Serialize;

use crate::{Error, Result};

/// A contiguous byte range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ByteRange {
    pub start: u64,
    pub size: u64,
}

impl ByteRange {
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Page {
    pub start: u64,
    pub size: u64,
    pub loaded: bool,
    pub modified: bool,
    pub uploaded: bool,
    /// Monotonic stamp of the write that last dirtied this page; zero for
    /// pages that are not untreated.
    #[serde(skip)]
    tag: u64,
}

impl Page {
    fn end(&self) -> u64 {
        self.start + self.size
    }

    fn untreated(&self) -> bool {
        self.modified && !self.uploaded
    }

    fn same_flags(&self, other: &Page) -> bool {
        self.loaded == other.loaded
            && self.modified == other.modified
            && self.uploaded == other.uploaded
    }
}

#[derive(Debug, Default)]
pub struct PageList {
    pages: Vec<Page>,
    size: u64,
    next_tag: u64,
}

impl PageList {
    pub fn new(size: u64) -> Self {
        let mut list = Self {
            pages: Vec::new(),
            size: 0,
            next_tag: 1,
        };
        list.set_size(size);
        list
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Grow or shrink the tracked file. Growth appends an unloaded clean
    /// page; shrink drops and splits pages past the new end.
    pub fn set_size(&mut self, size: u64) {
        if size > self.size {
            self.pages.push(Page {
                start: self.size,
                size: size - self.size,
                loaded: false,
                modified: false,
                uploaded: false,
                tag: 0,
            });
        } else if size < self.size {
            self.pages.retain(|p| p.start < size);
            if let Some(last) = self.pages.last_mut() {
                if last.end() > size {
                    last.size = size - last.start;
                }
            }
        }
        self.size = size;
        self.compress();
    }

    pub fn mark_dirty(&mut self, start: u64, size: u64) {
        if size == 0 {
            return;
        }
        if start + size > self.size {
            self.set_size(start + size);
        }
        let tag = self.next_tag;
        self.next_tag += 1;
        self.apply(start, size, |page| {
            page.loaded = true;
            page.modified = true;
            page.uploaded = false;
            page.tag = tag;
        });
    }

    pub fn mark_loaded(&mut self, start: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.apply(start, size, |page| {
            page.loaded = true;
        });
    }

    pub fn mark_uploaded(&mut self, start: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.apply(start, size, |page| {
            page.uploaded = true;
            page.modified = false;
            page.tag = 0;
        });
    }

    /// All untreated ranges, coalesced, ordered by offset.
    pub fn get_untreated(&self) -> Vec<ByteRange> {
        self.collect_ranges(|p| p.untreated())
    }

    /// Ranges in [start, start+size) that have never been loaded locally.
    pub fn get_unloaded(&self, start: u64, size: u64) -> Vec<ByteRange> {
        let end = (start + size).min(self.size);
        let mut out: Vec<ByteRange> = Vec::new();
        for page in &self.pages {
            if page.end() <= start || page.start >= end {
                continue;
            }
            if page.loaded {
                continue;
            }
            let s = page.start.max(start);
            let e = page.end().min(end);
            match out.last_mut() {
                Some(last) if last.end() == s => last.size += e - s,
                _ => out.push(ByteRange::new(s, e - s)),
            }
        }
        out
    }

    /// The contiguous untreated run containing the most recently dirtied
    /// page; this is the run the streaming flush path targets.
    pub fn get_last_update_untreated(&self) -> Option<ByteRange> {
        let newest = self
            .pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.untreated())
            .max_by_key(|(_, p)| p.tag)?
            .0;

        let mut first = newest;
        while first > 0 && self.pages[first - 1].untreated() {
            first -= 1;
        }
        let mut last = newest;
        while last + 1 < self.pages.len() && self.pages[last + 1].untreated() {
            last += 1;
        }
        let start = self.pages[first].start;
        Some(ByteRange::new(start, self.pages[last].end() - start))
    }

    /// After the streaming flush extracted a slab-aligned interval out of the
    /// last untreated run, mark the interval between the fragments as
    /// assigned and return the leading/trailing fragments to untreated state.
    /// The trailing fragment becomes the most recent run so appends keep
    /// extending it.
    pub fn replace_last_update_untreated(
        &mut self,
        front_start: u64,
        front_size: u64,
        behind_start: u64,
        behind_size: u64,
    ) -> Result<()> {
        let assigned_start = front_start + front_size;
        if behind_start < assigned_start {
            return Err(Error::Invariant(format!(
                "untreated replacement ranges out of order: front ends at {assigned_start}, behind starts at {behind_start}"
            ))
            .into());
        }
        self.mark_uploaded(assigned_start, behind_start - assigned_start);
        self.mark_dirty(front_start, front_size);
        self.mark_dirty(behind_start, behind_size);
        Ok(())
    }

    /// Full page snapshot for the cache report.
    pub fn snapshot(&self) -> Vec<Page> {
        self.pages.clone()
    }

    /// Verify the structural invariants: disjoint pages, contiguous cover of
    /// [0, size), no identical-flag neighbors.
    pub fn check_integrity(&self) -> Result<()> {
        if self.size == 0 {
            if !self.pages.is_empty() {
                return Err(Error::Invariant("pages present for empty file".into()).into());
            }
            return Ok(());
        }
        let mut expected = 0u64;
        let mut prev: Option<&Page> = None;
        for page in &self.pages {
            if page.start != expected {
                return Err(Error::Invariant(format!(
                    "page gap or overlap at offset {expected}, page starts at {}",
                    page.start
                ))
                .into());
            }
            if page.size == 0 {
                return Err(Error::Invariant(format!("empty page at {}", page.start)).into());
            }
            if let Some(prev) = prev {
                if prev.same_flags(page) {
                    return Err(Error::Invariant(format!(
                        "uncoalesced identical-flag pages at {}",
                        page.start
                    ))
                    .into());
                }
            }
            expected = page.end();
            prev = Some(page);
        }
        if expected != self.size {
            return Err(Error::Invariant(format!(
                "pages cover {expected} bytes of a {} byte file",
                self.size
            ))
            .into());
        }
        Ok(())
    }

    fn collect_ranges(&self, matches: impl Fn(&Page) -> bool) -> Vec<ByteRange> {
        let mut out: Vec<ByteRange> = Vec::new();
        for page in &self.pages {
            if !matches(page) {
                continue;
            }
            match out.last_mut() {
                Some(last) if last.end() == page.start => last.size += page.size,
                _ => out.push(ByteRange::new(page.start, page.size)),
            }
        }
        out
    }

    /// Apply a flag mutation over [start, start+size), splitting pages at the
    /// boundaries, then re-coalesce.
    fn apply(&mut self, start: u64, size: u64, mutate: impl Fn(&mut Page)) {
        let end = (start + size).min(self.size);
        if start >= end {
            return;
        }
        self.split_at(start);
        self.split_at(end);
        for page in &mut self.pages {
            if page.start >= start && page.end() <= end {
                mutate(page);
            }
        }
        self.compress();
    }

    fn split_at(&mut self, offset: u64) {
        if offset == 0 || offset >= self.size {
            return;
        }
        let idx = self
            .pages
            .iter()
            .position(|p| p.start < offset && offset < p.end());
        if let Some(idx) = idx {
            let mut tail = self.pages[idx];
            let head_size = offset - tail.start;
            self.pages[idx].size = head_size;
            tail.start = offset;
            tail.size -= head_size;
            self.pages.insert(idx + 1, tail);
        }
    }

    fn compress(&mut self) {
        let mut merged: Vec<Page> = Vec::with_capacity(self.pages.len());
        for page in self.pages.drain(..) {
            match merged.last_mut() {
                Some(last) if last.same_flags(&page) && last.end() == page.start => {
                    last.size += page.size;
                    last.tag = last.tag.max(page.tag);
                }
                _ => merged.push(page),
            }
        }
        self.pages = merged;
    }
}
