//! In-memory stat/attribute cache for object metadata.
//!
//! One lock guards three containers: the stat cache proper, the symbolic
//! link cache and the no-truncate directory lists. The symlink cache shares
//! the stat cache's size budget and TTL so users configure a single cache.
//! The cache never talks to the store; callers HEAD on a miss and feed the
//! response back through `add`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::{FsConfig, TtlMode};
use crate::store::Headers;
use crate::util::peel_quotes;

/// Attributes parsed out of object headers and carried verbatim back.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObjectAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub atime_secs: i64,
    pub ctime_secs: i64,
    pub is_dir: bool,
}

impl ObjectAttr {
    pub fn from_headers(path: &str, headers: &Headers) -> Self {
        let meta_u64 = |key: &str| -> u64 {
            headers
                .get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        let meta_time = |key: &str| -> (i64, u32) {
            let raw = match headers.get(key) {
                Some(v) => v,
                None => return (0, 0),
            };
            match raw.split_once('.') {
                Some((secs, frac)) => {
                    let secs = secs.parse::<i64>().unwrap_or(0);
                    let nanos = format!("{frac:0<9}")[..9].parse::<u32>().unwrap_or(0);
                    (secs, nanos)
                }
                None => (raw.parse::<i64>().unwrap_or(0), 0),
            }
        };

        let is_dir = path.ends_with('/')
            || headers
                .get("Content-Type")
                .is_some_and(|v| v.starts_with("application/x-directory"));
        let (mtime_secs, mtime_nanos) = meta_time("x-amz-meta-mtime");

        Self {
            mode: meta_u64("x-amz-meta-mode") as u32,
            uid: meta_u64("x-amz-meta-uid") as u32,
            gid: meta_u64("x-amz-meta-gid") as u32,
            size: meta_u64("Content-Length"),
            mtime_secs,
            mtime_nanos,
            atime_secs: meta_time("x-amz-meta-atime").0,
            ctime_secs: meta_time("x-amz-meta-ctime").0,
            is_dir,
        }
    }
}

#[derive(Debug, Clone)]
struct StatEntry {
    attr: ObjectAttr,
    headers: Headers,
    etag: String,
    cache_date: Instant,
    hit_count: u64,
    force_dir: bool,
    negative: bool,
    no_truncate: u64,
}

#[derive(Debug, Clone)]
struct SymlinkEntry {
    target: String,
    cache_date: Instant,
    hit_count: u64,
}

/// A positive lookup result.
#[derive(Debug, Clone)]
pub struct CachedStat {
    pub attr: ObjectAttr,
    pub headers: Headers,
    pub force_dir: bool,
}

/// Outcome of a cache probe that found an entry.
#[derive(Debug, Clone)]
pub enum CacheHit {
    Found(CachedStat),
    /// The path is cached as known-missing.
    Negative,
}

#[derive(Default)]
struct Inner {
    stats: HashMap<String, StatEntry>,
    symlinks: HashMap<String, SymlinkEntry>,
    no_truncate_dirs: HashMap<String, Vec<String>>,
    cache_size: usize,
    ttl: Option<Duration>,
    interval_mode: bool,
    negative_cache: bool,
}

pub struct StatCache {
    inner: Mutex<Inner>,
}

fn split_parent(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(pos) => (trimmed[..pos].to_string(), trimmed[pos + 1..].to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

impl Inner {
    fn expired(&self, cache_date: Instant, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(cache_date) > ttl,
            None => false,
        }
    }

    /// Make room for one incoming entry: drop oldest entries until the cache
    /// plus the newcomer fits the budget, skipping pinned and force-dir
    /// entries. Replacing an existing key does not grow the map, so it never
    /// evicts.
    fn truncate_stats(&mut self, incoming: &str) {
        if self.stats.contains_key(incoming) {
            return;
        }
        let excess = (self.stats.len() + 1).saturating_sub(self.cache_size);
        if excess == 0 {
            return;
        }
        let mut candidates: Vec<(Instant, String)> = self
            .stats
            .iter()
            .filter(|(_, e)| e.no_truncate == 0 && !e.force_dir)
            .map(|(k, e)| (e.cache_date, k.clone()))
            .collect();
        candidates.sort();
        for (_, key) in candidates.into_iter().take(excess) {
            debug!(path = %key, "stat cache eviction");
            self.stats.remove(&key);
        }
    }

    fn truncate_symlinks(&mut self, incoming: &str) {
        if self.symlinks.contains_key(incoming) {
            return;
        }
        let excess = (self.symlinks.len() + 1).saturating_sub(self.cache_size);
        if excess == 0 {
            return;
        }
        let mut candidates: Vec<(Instant, String)> = self
            .symlinks
            .iter()
            .map(|(k, e)| (e.cache_date, k.clone()))
            .collect();
        candidates.sort();
        for (_, key) in candidates.into_iter().take(excess) {
            self.symlinks.remove(&key);
        }
    }

    fn add_no_truncate_name(&mut self, path: &str) {
        let (parent, name) = split_parent(path);
        let names = self.no_truncate_dirs.entry(parent).or_default();
        if !names.contains(&name) {
            names.push(name);
        }
    }

    fn del_no_truncate_name(&mut self, path: &str) {
        let (parent, name) = split_parent(path);
        if let Some(names) = self.no_truncate_dirs.get_mut(&parent) {
            names.retain(|n| n != &name);
            if names.is_empty() {
                self.no_truncate_dirs.remove(&parent);
            }
        }
    }

    fn remove_stat(&mut self, path: &str) -> bool {
        match self.stats.remove(path) {
            Some(entry) => {
                if entry.no_truncate > 0 {
                    self.del_no_truncate_name(path);
                }
                true
            }
            None => false,
        }
    }
}

impl StatCache {
    pub fn new(
        cache_size: usize,
        ttl: Option<Duration>,
        ttl_mode: TtlMode,
        negative_cache: bool,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cache_size,
                ttl,
                interval_mode: ttl_mode == TtlMode::IntervalFromAccess,
                negative_cache,
                ..Inner::default()
            }),
        }
    }

    pub fn from_config(config: &FsConfig) -> Self {
        Self::new(
            config.cache_size,
            config.cache_ttl(),
            config.ttl_mode,
            config.negative_cache,
        )
    }

    /// Probe the cache. With `overcheck`, a miss retries the lookup with the
    /// trailing slash toggled, since the store represents directories both
    /// ways. A supplied `expected_etag` that does not match forces a miss.
    pub fn get(&self, path: &str, overcheck: bool, expected_etag: Option<&str>) -> Option<CacheHit> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let mut candidates = vec![path.to_string()];
        if overcheck && path != "/" {
            if let Some(stripped) = path.strip_suffix('/') {
                candidates.push(stripped.to_string());
            } else {
                candidates.push(format!("{path}/"));
            }
        }

        for key in candidates {
            let Some(entry) = inner.stats.get(&key) else {
                continue;
            };
            if inner.expired(entry.cache_date, now) {
                inner.remove_stat(&key);
                continue;
            }
            if entry.negative {
                if !inner.negative_cache {
                    continue;
                }
            } else if let Some(expected) = expected_etag {
                if entry.etag != peel_quotes(expected) {
                    return None;
                }
            }

            let interval = inner.interval_mode;
            let entry = inner.stats.get_mut(&key).expect("entry checked above");
            entry.hit_count += 1;
            if interval {
                entry.cache_date = now;
            }
            return Some(if entry.negative {
                CacheHit::Negative
            } else {
                CacheHit::Found(CachedStat {
                    attr: entry.attr.clone(),
                    headers: entry.headers.clone(),
                    force_dir: entry.force_dir,
                })
            });
        }
        None
    }

    pub fn has(&self, path: &str, expected_etag: Option<&str>) -> bool {
        matches!(self.get(path, true, expected_etag), Some(CacheHit::Found(_)))
    }

    /// Insert or replace an entry from store headers.
    pub fn add(&self, path: &str, headers: &Headers, force_dir: bool, no_truncate: bool) {
        let attr = ObjectAttr::from_headers(path, headers);
        let etag = headers
            .get("ETag")
            .map(|v| peel_quotes(v).to_string())
            .unwrap_or_default();

        let mut inner = self.inner.lock();
        inner.truncate_stats(path);
        let prev_pin = inner
            .stats
            .get(path)
            .map(|e| e.no_truncate)
            .unwrap_or(0);
        let no_truncate_count = if no_truncate {
            prev_pin.max(1)
        } else {
            prev_pin
        };
        if no_truncate && prev_pin == 0 {
            inner.add_no_truncate_name(path);
        }
        inner.stats.insert(
            path.to_string(),
            StatEntry {
                attr,
                headers: headers.clone(),
                etag,
                cache_date: Instant::now(),
                hit_count: 0,
                force_dir,
                negative: false,
                no_truncate: no_truncate_count,
            },
        );
    }

    /// Cache a 404 so the next lookup skips the store. No-op unless negative
    /// caching is enabled.
    pub fn add_negative(&self, path: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.negative_cache {
            return false;
        }
        inner.truncate_stats(path);
        inner.stats.insert(
            path.to_string(),
            StatEntry {
                attr: ObjectAttr::default(),
                headers: Headers::new(),
                etag: String::new(),
                cache_date: Instant::now(),
                hit_count: 0,
                force_dir: false,
                negative: true,
                no_truncate: 0,
            },
        );
        true
    }

    /// Replace headers and attributes in place without bumping cache_date.
    pub fn update_meta(&self, path: &str, headers: &Headers) -> bool {
        let attr = ObjectAttr::from_headers(path, headers);
        let etag = headers
            .get("ETag")
            .map(|v| peel_quotes(v).to_string())
            .unwrap_or_default();
        let mut inner = self.inner.lock();
        match inner.stats.get_mut(path) {
            Some(entry) if !entry.negative => {
                entry.attr = attr;
                entry.headers = headers.clone();
                entry.etag = etag;
                true
            }
            _ => false,
        }
    }

    /// Remove a stat entry and its no-truncate bookkeeping. The symlink
    /// cache is managed separately through `del_symlink`.
    pub fn del(&self, path: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.remove_stat(path)
    }

    pub fn get_symlink(&self, path: &str) -> Option<String> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.symlinks.get(path) {
            if inner.expired(entry.cache_date, now) {
                inner.symlinks.remove(path);
                return None;
            }
        }
        let interval = inner.interval_mode;
        let entry = inner.symlinks.get_mut(path)?;
        entry.hit_count += 1;
        if interval {
            entry.cache_date = now;
        }
        Some(entry.target.clone())
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        let mut inner = self.inner.lock();
        inner.truncate_symlinks(path);
        inner.symlinks.insert(
            path.to_string(),
            SymlinkEntry {
                target: target.to_string(),
                cache_date: Instant::now(),
                hit_count: 0,
            },
        );
    }

    pub fn del_symlink(&self, path: &str) -> bool {
        self.inner.lock().symlinks.remove(path).is_some()
    }

    /// Pin or unpin an entry against eviction. The first pin registers the
    /// name in its parent's no-truncate list; dropping the last pin removes it.
    pub fn change_no_truncate_flag(&self, path: &str, pin: bool) {
        enum Transition {
            FirstPin,
            LastUnpin,
            None,
        }

        let mut inner = self.inner.lock();
        let transition = match inner.stats.get_mut(path) {
            Some(entry) if pin => {
                entry.no_truncate += 1;
                if entry.no_truncate == 1 {
                    Transition::FirstPin
                } else {
                    Transition::None
                }
            }
            Some(entry) if entry.no_truncate > 0 => {
                entry.no_truncate -= 1;
                if entry.no_truncate == 0 {
                    Transition::LastUnpin
                } else {
                    Transition::None
                }
            }
            _ => Transition::None,
        };
        match transition {
            Transition::FirstPin => inner.add_no_truncate_name(path),
            Transition::LastUnpin => inner.del_no_truncate_name(path),
            Transition::None => {}
        }
    }

    /// Names of pinned (not-yet-uploaded) children of a directory, so they
    /// show up in listings even before the store knows them.
    pub fn get_no_truncate_list(&self, parent_dir: &str) -> Vec<String> {
        let key = if parent_dir != "/" {
            parent_dir.trim_end_matches('/')
        } else {
            parent_dir
        };
        self.inner
            .lock()
            .no_truncate_dirs
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.stats.clear();
        inner.symlinks.clear();
        inner.no_truncate_dirs.clear();
    }

    pub fn set_cache_size(&self, size: usize) {
        self.inner.lock().cache_size = size;
    }

    pub fn set_ttl(&self, ttl: Option<Duration>, ttl_mode: TtlMode) {
        let mut inner = self.inner.lock();
        inner.ttl = ttl;
        inner.interval_mode = ttl_mode == TtlMode::IntervalFromAccess;
    }

    pub fn set_negative_cache(&self, enabled: bool) {
        self.inner.lock().negative_cache = enabled;
    }

    pub fn stats_len(&self) -> usize {
        self.inner.lock().stats.len()
    }

    pub fn symlinks_len(&self) -> usize {
        self.inner.lock().symlinks.len()
    }
}
