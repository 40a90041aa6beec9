//! Bounded worker pool copying archive contents to a target tree. An `ops`
//! table of fixed length `MAX_PARALLEL_COPY_INSTANCES` holds in-flight
//! `CopyItem` slots; a free-index stack protects against slot collisions,
//! guarded by a `Mutex`/`Condvar` pair, the same shape used to track a
//! bounded pool of senders against a fixed slot table elsewhere in this
//! codebase, applied here to file copies instead of network senders.

pub mod vectored;

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use vectored::{fd_of, VectoredBuffer};

pub const MAX_PARALLEL_COPY_INSTANCES: usize = 64;
const VECTORED_THRESHOLD_BYTES: u64 = 64 * 1024;
const BLOCK_SIZE: usize = 64 * 1024;
const QUEUE_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("target directory does not exist: {0}")]
    TargetMissing(PathBuf),
    #[error("io error copying {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("io_uring backend requested but not compiled in this build")]
    IoUring,
}

pub type Result<T> = std::result::Result<T, CopyError>;

#[derive(Debug, Clone)]
struct CopyItem {
    src: PathBuf,
    dst: PathBuf,
}

struct Shared {
    free_slots: Mutex<Vec<usize>>,
    /// `None` while a slot is free, `Some` while a worker owns it — used
    /// only for the "no two workers hold the same slot" test invariant.
    in_use: Mutex<Vec<bool>>,
    queue: Mutex<VecDeque<CopyItem>>,
    finalize: Mutex<bool>,
    exit: Mutex<bool>,
    notify_cv: Condvar,
    errors: Mutex<Vec<CopyError>>,
    active_count: Mutex<usize>,
}

/// Copies a whole backup directory to a restore target with bounded
/// parallelism via a `start()`/`wait()`/`stop()` contract.
pub struct CopyManager {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    walker: Option<JoinHandle<()>>,
}

impl CopyManager {
    /// Builds a manager with `workers` worker threads (default 1, capped at
    /// `MAX_PARALLEL_COPY_INSTANCES`), but does not yet start copying.
    pub fn new(workers: usize) -> Self {
        let workers = workers.clamp(1, MAX_PARALLEL_COPY_INSTANCES);
        let shared = Arc::new(Shared {
            free_slots: Mutex::new((0..workers).collect()),
            in_use: Mutex::new(vec![false; workers]),
            queue: Mutex::new(VecDeque::new()),
            finalize: Mutex::new(false),
            exit: Mutex::new(false),
            notify_cv: Condvar::new(),
            errors: Mutex::new(Vec::new()),
            active_count: Mutex::new(0),
        });
        CopyManager { shared, workers: Vec::new(), walker: None }
    }

    /// Walks `source` depth-first, enqueuing each regular file for copy
    /// into the mirrored location under `target`, and starts the worker
    /// pool. `target` must already exist.
    pub fn start(&mut self, source: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<()> {
        let source = source.as_ref().to_path_buf();
        let target = target.as_ref().to_path_buf();
        if !target.is_dir() {
            return Err(CopyError::TargetMissing(target));
        }

        let num_workers = self.shared.free_slots.lock().len();
        for _ in 0..num_workers {
            let shared = Arc::clone(&self.shared);
            self.workers.push(thread::spawn(move || worker_loop(shared)));
        }

        let shared = Arc::clone(&self.shared);
        self.walker = Some(thread::spawn(move || {
            walk_and_enqueue(&shared, &source, &target);
            *shared.finalize.lock() = true;
            shared.notify_cv.notify_all();
        }));
        Ok(())
    }

    /// Blocks until every enqueued file has been copied (or the walker has
    /// signalled completion and all slots are free), then returns any
    /// per-file errors collected along the way.
    pub fn wait(mut self) -> Vec<CopyError> {
        if let Some(walker) = self.walker.take() {
            let _ = walker.join();
        }
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
        Arc::try_unwrap(self.shared)
            .map(|s| s.errors.into_inner())
            .unwrap_or_default()
    }

    /// Sets the exit flag; workers observe it between files and abandon
    /// remaining work, leaving partial destination files on disk.
    pub fn stop(&self) {
        *self.shared.exit.lock() = true;
        self.shared.notify_cv.notify_all();
    }
}

fn walk_and_enqueue(shared: &Arc<Shared>, source: &Path, target: &Path) {
    let mut stack = vec![source.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if *shared.exit.lock() {
            return;
        }
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) => {
                shared.errors.lock().push(CopyError::Io { path: dir.clone(), source: e });
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let rel = path.strip_prefix(source).unwrap_or(&path);
            let dst = target.join(rel);
            if path.is_dir() {
                if let Err(e) = fs::create_dir_all(&dst) {
                    shared.errors.lock().push(CopyError::Io { path: dst, source: e });
                    continue;
                }
                stack.push(path);
            } else {
                shared.queue.lock().push_back(CopyItem { src: path, dst });
                shared.notify_cv.notify_one();
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let item = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(item) = queue.pop_front() {
                    break Some(item);
                }
                if *shared.finalize.lock() || *shared.exit.lock() {
                    break None;
                }
                shared.notify_cv.wait(&mut queue);
            }
        };
        let Some(item) = item else { break };
        if *shared.exit.lock() {
            debug!(?item.src, "copy manager stopping, abandoning remaining work");
            break;
        }

        let slot = {
            let mut free = shared.free_slots.lock();
            free.pop()
        };
        let Some(slot) = slot else {
            // No free slot right now (shouldn't happen with workers == slots,
            // but the table is sized independently in principle); requeue.
            shared.queue.lock().push_front(item);
            continue;
        };
        {
            let mut in_use = shared.in_use.lock();
            debug_assert!(!in_use[slot], "two workers must never hold the same ops slot");
            in_use[slot] = true;
        }
        *shared.active_count.lock() += 1;

        if let Err(e) = copy_one_file(&item.src, &item.dst) {
            warn!(src = ?item.src, error = %e, "copy manager worker failed on file");
            shared.errors.lock().push(e);
        }

        {
            let mut in_use = shared.in_use.lock();
            in_use[slot] = false;
        }
        *shared.active_count.lock() -= 1;
        shared.free_slots.lock().push(slot);
        shared.notify_cv.notify_all();
    }
}

fn copy_one_file(src: &Path, dst: &Path) -> Result<()> {
    let size = fs::metadata(src).map_err(|e| CopyError::Io { path: src.to_path_buf(), source: e })?.len();
    if size >= VECTORED_THRESHOLD_BYTES {
        copy_vectored(src, dst, size)
    } else {
        fs::copy(src, dst).map_err(|e| CopyError::Io { path: dst.to_path_buf(), source: e })?;
        fsync_path(dst)
    }
}

fn copy_vectored(src: &Path, dst: &Path, size: u64) -> Result<()> {
    let src_file = fs::File::open(src).map_err(|e| CopyError::Io { path: src.to_path_buf(), source: e })?;
    let dst_file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dst)
        .map_err(|e| CopyError::Io { path: dst.to_path_buf(), source: e })?;
    dst_file.set_len(size).map_err(|e| CopyError::Io { path: dst.to_path_buf(), source: e })?;

    let mut buf = VectoredBuffer::new(QUEUE_DEPTH, BLOCK_SIZE);
    loop {
        let n = buf
            .readv_from(fd_of(&src_file))
            .map_err(|e| CopyError::Io { path: src.to_path_buf(), source: std::io::Error::new(std::io::ErrorKind::Other, e) })?;
        if n == 0 {
            break;
        }
        buf.set_offset(buf.offset() - n as u64);
        buf.writev_to(fd_of(&dst_file))
            .map_err(|e| CopyError::Io { path: dst.to_path_buf(), source: std::io::Error::new(std::io::ErrorKind::Other, e) })?;
    }
    dst_file.sync_all().map_err(|e| CopyError::Io { path: dst.to_path_buf(), source: e })?;
    Ok(())
}

fn fsync_path(path: &Path) -> Result<()> {
    let f = fs::File::open(path).map_err(|e| CopyError::Io { path: path.to_path_buf(), source: e })?;
    f.sync_all().map_err(|e| CopyError::Io { path: path.to_path_buf(), source: e })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use std::fs;

    #[test]
    fn copies_a_nested_tree_byte_identically() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        fs::create_dir_all(src_dir.path().join("sub")).unwrap();
        fs::write(src_dir.path().join("a.txt"), b"hello").unwrap();
        fs::write(src_dir.path().join("sub/b.txt"), vec![7u8; 128 * 1024]).unwrap();

        let mut mgr = CopyManager::new(2);
        mgr.start(src_dir.path(), dst_dir.path()).unwrap();
        let errors = mgr.wait();
        assert!(errors.is_empty(), "{errors:?}");

        assert_eq!(fs::read(dst_dir.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dst_dir.path().join("sub/b.txt")).unwrap(), vec![7u8; 128 * 1024]);
    }

    #[test]
    fn fails_when_target_directory_is_missing() {
        let src_dir = tempdir().unwrap();
        let mut mgr = CopyManager::new(1);
        let err = mgr.start(src_dir.path(), src_dir.path().join("does-not-exist")).unwrap_err();
        assert!(matches!(err, CopyError::TargetMissing(_)));
    }
}
