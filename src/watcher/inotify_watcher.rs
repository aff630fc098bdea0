//! inotify-based file system watcher

use super::RawEvent;
use crate::filter::PathFilter;
use chrono::Utc;
use inotify::{EventMask, EventOwned, Inotify, WatchDescriptor, WatchMask};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Events requested for every watched directory
fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::CLOSE_WRITE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
}

/// Recursive inotify watcher
pub struct InotifyWatcher {
    /// Async wrapper for non-blocking reads (declared first so it
    /// deregisters before the inotify fd closes)
    async_fd: AsyncFd<RawFd>,
    /// inotify instance
    inotify: Inotify,
    /// Map of watch descriptors to directories
    watches: HashMap<WatchDescriptor, PathBuf>,
    /// Reverse map of directories to watch descriptors
    path_to_wd: HashMap<PathBuf, WatchDescriptor>,
    /// Tool-owned directories are never watched
    filter: PathFilter,
    /// Translated events not yet handed out
    pending: VecDeque<RawEvent>,
    /// Event buffer
    buffer: [u8; 4096],
}

impl InotifyWatcher {
    /// Create a new inotify watcher
    pub fn new(filter: PathFilter) -> anyhow::Result<Self> {
        // Inotify::init opens the descriptor non-blocking
        let inotify = Inotify::init()?;
        let async_fd = AsyncFd::new(inotify.as_raw_fd())?;

        Ok(Self {
            async_fd,
            inotify,
            watches: HashMap::new(),
            path_to_wd: HashMap::new(),
            filter,
            pending: VecDeque::new(),
            buffer: [0u8; 4096],
        })
    }

    /// Watch `dir` and every directory below it
    pub fn add(&mut self, dir: &Path) -> anyhow::Result<()> {
        let filter = self.filter.clone();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.file_type().is_dir() && !filter.is_internal(e.path()));

        for entry in walker {
            match entry {
                Ok(entry) => self.add_one(entry.path())?,
                // Directory vanished or is unreadable mid-walk
                Err(e) => debug!("Skipping during watch setup: {}", e),
            }
        }
        Ok(())
    }

    fn add_one(&mut self, dir: &Path) -> anyhow::Result<()> {
        match self.inotify.watches().add(dir, watch_mask()) {
            Ok(wd) => {
                self.watches.insert(wd.clone(), dir.to_path_buf());
                self.path_to_wd.insert(dir.to_path_buf(), wd);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Directory disappeared before it could be watched: {:?}", dir);
                Ok(())
            }
            // ENOSPC here means the system watch limit is exhausted
            Err(e) => Err(anyhow::anyhow!("cannot watch {:?}: {}", dir, e)),
        }
    }

    /// Stop watching `dir` and everything below it
    fn forget(&mut self, dir: &Path) {
        let stale: Vec<PathBuf> = self
            .path_to_wd
            .keys()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect();
        for path in stale {
            if let Some(wd) = self.path_to_wd.remove(&path) {
                let _ = self.inotify.watches().remove(wd.clone());
                self.watches.remove(&wd);
            }
        }
    }

    /// Rewrite watched directory paths after a directory moved within the tree
    fn rename(&mut self, from: &Path, to: &Path) {
        for path in self.watches.values_mut() {
            if let Ok(rest) = path.strip_prefix(from) {
                *path = to.join(rest);
            }
        }
        self.path_to_wd = self
            .watches
            .iter()
            .map(|(wd, path)| (path.clone(), wd.clone()))
            .collect();
    }

    /// Number of watched directories
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Get next event (async)
    pub async fn next_event(&mut self) -> anyhow::Result<RawEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            self.fill().await?;
        }
    }

    /// Read one batch from the kernel and translate it
    async fn fill(&mut self) -> anyhow::Result<()> {
        let batch: Vec<EventOwned> = loop {
            let mut guard = self.async_fd.readable().await?;

            match self.inotify.read_events(&mut self.buffer) {
                Ok(events) => break events.map(|e| e.to_owned()).collect(),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Clear readiness and wait again
                    guard.clear_ready();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.translate(batch)
    }

    /// Map a batch of inotify events to raw events.
    ///
    /// `MOVED_FROM` is held until the next event; a `MOVED_TO` with the same
    /// cookie makes it a move, anything else makes it a deletion (moved out of
    /// the tree). A pair split across two reads is reported as delete+create.
    fn translate(&mut self, batch: Vec<EventOwned>) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut moved_from: Option<(u32, PathBuf, bool)> = None;

        for event in batch {
            if event.mask.contains(EventMask::Q_OVERFLOW) {
                warn!("inotify queue overflow, events were lost");
                continue;
            }
            if event.mask.contains(EventMask::IGNORED) {
                if let Some(path) = self.watches.remove(&event.wd) {
                    self.path_to_wd.remove(&path);
                }
                continue;
            }

            let dir = match self.watches.get(&event.wd) {
                Some(p) => p.clone(),
                None => continue,
            };
            let path = match event.name {
                Some(ref name) => dir.join(name),
                None => dir,
            };
            let is_dir = event.mask.contains(EventMask::ISDIR);

            if event.mask.contains(EventMask::MOVED_TO) {
                match moved_from.take() {
                    Some((cookie, from, _)) if cookie == event.cookie => {
                        if is_dir {
                            self.rename(&from, &path);
                        }
                        self.pending.push_back(RawEvent::moved(from, path).at(now));
                    }
                    unpaired => {
                        if let Some((_, from, from_dir)) = unpaired {
                            self.moved_out(from, from_dir, now);
                        }
                        if is_dir {
                            self.add(&path)?;
                        }
                        self.pending.push_back(RawEvent::created(path).at(now));
                    }
                }
                continue;
            }

            if let Some((_, from, from_dir)) = moved_from.take() {
                self.moved_out(from, from_dir, now);
            }

            if event.mask.contains(EventMask::MOVED_FROM) {
                moved_from = Some((event.cookie, path, is_dir));
            } else if event.mask.contains(EventMask::CREATE) {
                // New directories get watched too
                if is_dir {
                    self.add(&path)?;
                }
                self.pending.push_back(RawEvent::created(path).at(now));
            } else if event.mask.contains(EventMask::DELETE) {
                self.pending.push_back(RawEvent::deleted(path).at(now));
            } else if event.mask.contains(EventMask::CLOSE_WRITE) && !is_dir {
                self.pending.push_back(RawEvent::modified(path).at(now));
            }
        }

        if let Some((_, from, from_dir)) = moved_from {
            self.moved_out(from, from_dir, now);
        }
        Ok(())
    }

    fn moved_out(&mut self, from: PathBuf, is_dir: bool, now: chrono::DateTime<Utc>) {
        if is_dir {
            self.forget(&from);
        }
        self.pending.push_back(RawEvent::deleted(from).at(now));
    }
}
