//! A named cross-process table of active workers, backed by
//! POSIX shared memory and a `PTHREAD_PROCESS_SHARED` mutex. Every access
//! goes through the mutex; the mutex must never be held across a blocking
//! I/O call, so callers copy slot contents out before releasing it.

use std::mem::MaybeUninit;
use std::ptr;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use thiserror::Error;

pub const MAX_WORKER_CHILDS: usize = 4;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory segment {0:?} could not be attached: {1}")]
    Attach(String, #[source] nix::Error),
    #[error("shared memory segment sized incorrectly: expected {expected}, got {found}")]
    WrongSize { expected: usize, found: usize },
    #[error("no free worker slot available")]
    NoFreeSlot,
    #[error("slot index {0} out of range")]
    SlotOutOfRange(usize),
    #[error("child slot index {0} out of range")]
    ChildSlotOutOfRange(usize),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, ShmError>;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ChildSlot {
    pub child_pid: i32,
    pub attached_backup_id: i64,
    pub bytes_copied: u64,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct WorkerInfo {
    pub pid: i32,
    pub command_type: u32,
    pub archive_id: i64,
    pub started: i64,
    pub children: [ChildSlot; MAX_WORKER_CHILDS],
}

impl Default for WorkerInfo {
    fn default() -> Self {
        WorkerInfo {
            pid: 0,
            command_type: 0,
            archive_id: 0,
            started: 0,
            children: [ChildSlot::default(); MAX_WORKER_CHILDS],
        }
    }
}

#[repr(C)]
struct SharedLayout {
    mutex: libc::pthread_mutex_t,
    launcher_pid: i32,
    num_workers: u32,
    // followed by `num_workers` `WorkerInfo` slots, laid out by `Registry`.
}

/// A cross-process handle to the worker registry's shared-memory segment.
pub struct Registry {
    ptr: *mut u8,
    total_size: usize,
    num_workers: usize,
    name: String,
    owns_segment: bool,
}

unsafe impl Send for Registry {}

impl Registry {
    fn layout_size(num_workers: usize) -> usize {
        std::mem::size_of::<SharedLayout>() + num_workers * std::mem::size_of::<WorkerInfo>()
    }

    /// Creates a brand-new shared-memory segment sized for `num_workers`
    /// slots, called once by the launcher.
    pub fn create(name: &str, num_workers: usize) -> Result<Self> {
        let size = Self::layout_size(num_workers);
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ShmError::Attach(name.to_string(), e))?;
        ftruncate(&fd, size as i64)?;
        let ptr = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(size).expect("non-zero registry size"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| ShmError::Attach(name.to_string(), e))?
        .as_ptr() as *mut u8;
        drop(fd);

        let registry = Registry {
            ptr,
            total_size: size,
            num_workers,
            name: name.to_string(),
            owns_segment: true,
        };
        registry.init_mutex();
        unsafe {
            let layout = registry.ptr as *mut SharedLayout;
            (*layout).launcher_pid = nix::unistd::getpid().as_raw();
            (*layout).num_workers = num_workers as u32;
        }
        for i in 0..num_workers {
            registry.write_uninit_slot(i);
        }
        Ok(registry)
    }

    /// Attaches to an existing segment created by `create`.
    pub fn open(name: &str, num_workers: usize) -> Result<Self> {
        let size = Self::layout_size(num_workers);
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| ShmError::Attach(name.to_string(), e))?;
        let stat = nix::sys::stat::fstat(&fd)?;
        if stat.st_size as usize != size {
            return Err(ShmError::WrongSize { expected: size, found: stat.st_size as usize });
        }
        let ptr = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(size).expect("non-zero registry size"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| ShmError::Attach(name.to_string(), e))?
        .as_ptr() as *mut u8;
        drop(fd);
        Ok(Registry { ptr, total_size: size, num_workers, name: name.to_string(), owns_segment: false })
    }

    fn init_mutex(&self) {
        unsafe {
            let mutex_ptr = ptr::addr_of_mut!((*(self.ptr as *mut SharedLayout)).mutex);
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            libc::pthread_mutexattr_init(attr.as_mut_ptr());
            libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutex_init(mutex_ptr, attr.as_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        }
    }

    fn lock(&self) -> MutexGuard<'_> {
        unsafe {
            let mutex_ptr = ptr::addr_of_mut!((*(self.ptr as *mut SharedLayout)).mutex);
            libc::pthread_mutex_lock(mutex_ptr);
        }
        MutexGuard { registry: self }
    }

    fn unlock(&self) {
        unsafe {
            let mutex_ptr = ptr::addr_of_mut!((*(self.ptr as *mut SharedLayout)).mutex);
            libc::pthread_mutex_unlock(mutex_ptr);
        }
    }

    fn slot_ptr(&self, index: usize) -> *mut WorkerInfo {
        let base = unsafe { self.ptr.add(std::mem::size_of::<SharedLayout>()) };
        (base as *mut WorkerInfo).wrapping_add(index)
    }

    fn write_uninit_slot(&self, index: usize) {
        unsafe { ptr::write(self.slot_ptr(index), WorkerInfo::default()) };
    }

    /// Finds a free slot (`pid == 0`) and writes `info` into it, returning
    /// its index. Holds the mutex only for the duration of the scan and
    /// write, never across blocking I/O.
    pub fn allocate(&self, info: WorkerInfo) -> Result<usize> {
        let _guard = self.lock();
        for i in 0..self.num_workers {
            let slot = unsafe { &*self.slot_ptr(i) };
            if slot.pid == 0 {
                unsafe { ptr::write(self.slot_ptr(i), info) };
                return Ok(i);
            }
        }
        Err(ShmError::NoFreeSlot)
    }

    pub fn free(&self, index: usize) -> Result<()> {
        self.check_index(index)?;
        let _guard = self.lock();
        unsafe { ptr::write(self.slot_ptr(index), WorkerInfo::default()) };
        Ok(())
    }

    pub fn read(&self, index: usize) -> Result<WorkerInfo> {
        self.check_index(index)?;
        let _guard = self.lock();
        Ok(unsafe { ptr::read(self.slot_ptr(index)) })
    }

    pub fn write(&self, index: usize, info: WorkerInfo) -> Result<()> {
        self.check_index(index)?;
        let _guard = self.lock();
        unsafe { ptr::write(self.slot_ptr(index), info) };
        Ok(())
    }

    pub fn read_child(&self, index: usize, child_index: usize) -> Result<ChildSlot> {
        self.check_index(index)?;
        if child_index >= MAX_WORKER_CHILDS {
            return Err(ShmError::ChildSlotOutOfRange(child_index));
        }
        let _guard = self.lock();
        let info = unsafe { &*self.slot_ptr(index) };
        Ok(info.children[child_index])
    }

    pub fn write_child(&self, index: usize, child_index: usize, child: ChildSlot) -> Result<()> {
        self.check_index(index)?;
        if child_index >= MAX_WORKER_CHILDS {
            return Err(ShmError::ChildSlotOutOfRange(child_index));
        }
        let _guard = self.lock();
        let info = unsafe { &mut *self.slot_ptr(index) };
        info.children[child_index] = child;
        Ok(())
    }

    pub fn is_empty(&self) -> Result<bool> {
        let _guard = self.lock();
        for i in 0..self.num_workers {
            let slot = unsafe { &*self.slot_ptr(i) };
            if slot.pid != 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn get_free_index(&self) -> Result<usize> {
        let _guard = self.lock();
        for i in 0..self.num_workers {
            let slot = unsafe { &*self.slot_ptr(i) };
            if slot.pid == 0 {
                return Ok(i);
            }
        }
        Err(ShmError::NoFreeSlot)
    }

    /// Rewrites `pid = 0` into any slot whose pid no longer corresponds to
    /// a live process. The write is a single word store and tolerates
    /// concurrent readers.
    pub fn reap_dead_workers(&self) -> Result<usize> {
        let mut reaped = 0;
        for i in 0..self.num_workers {
            let pid = {
                let _guard = self.lock();
                unsafe { (*self.slot_ptr(i)).pid }
            };
            if pid != 0 && !process_is_alive(pid) {
                let _guard = self.lock();
                unsafe { (*self.slot_ptr(i)).pid = 0 };
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Number of worker slots this segment was sized for, used by callers
    /// (the Retention Engine's `SHMBackupLockInfo`, notably) that need to
    /// scan every slot without hardcoding the table's size.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.num_workers {
            return Err(ShmError::SlotOutOfRange(index));
        }
        Ok(())
    }
}

fn process_is_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

impl Drop for Registry {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(
                ptr::NonNull::new(self.ptr as *mut std::ffi::c_void).expect("registry pointer is non-null"),
                self.total_size,
            );
        }
        if self.owns_segment {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

struct MutexGuard<'a> {
    registry: &'a Registry,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.registry.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(suffix: &str) -> String {
        format!("/pgarc-test-{}-{}", std::process::id(), suffix)
    }

    #[test]
    fn allocate_then_read_round_trips_worker_info() {
        let name = unique_name("alloc");
        let registry = Registry::create(&name, 4).unwrap();
        let info = WorkerInfo { pid: 4242, command_type: 1, archive_id: 7, started: 1000, ..Default::default() };
        let idx = registry.allocate(info).unwrap();
        let read_back = registry.read(idx).unwrap();
        assert_eq!(read_back.pid, 4242);
        assert_eq!(read_back.archive_id, 7);
    }

    #[test]
    fn free_slot_resets_pid_to_zero() {
        let name = unique_name("free");
        let registry = Registry::create(&name, 2).unwrap();
        let idx = registry.allocate(WorkerInfo { pid: 99, ..Default::default() }).unwrap();
        registry.free(idx).unwrap();
        assert_eq!(registry.read(idx).unwrap().pid, 0);
        assert!(registry.is_empty().unwrap());
    }

    #[test]
    fn no_free_slot_when_table_is_full() {
        let name = unique_name("full");
        let registry = Registry::create(&name, 1).unwrap();
        registry.allocate(WorkerInfo { pid: 1, ..Default::default() }).unwrap();
        let err = registry.allocate(WorkerInfo { pid: 2, ..Default::default() }).unwrap_err();
        assert!(matches!(err, ShmError::NoFreeSlot));
    }

    #[test]
    fn child_slot_round_trips() {
        let name = unique_name("child");
        let registry = Registry::create(&name, 1).unwrap();
        let idx = registry.allocate(WorkerInfo { pid: 55, ..Default::default() }).unwrap();
        registry
            .write_child(idx, 0, ChildSlot { child_pid: 56, attached_backup_id: 9, bytes_copied: 1024 })
            .unwrap();
        let child = registry.read_child(idx, 0).unwrap();
        assert_eq!(child.child_pid, 56);
        assert_eq!(child.attached_backup_id, 9);
    }

    #[test]
    fn reaper_zeroes_slots_for_dead_pids() {
        let name = unique_name("reap");
        let registry = Registry::create(&name, 2).unwrap();
        // A pid that is exceedingly unlikely to be alive.
        let idx = registry.allocate(WorkerInfo { pid: i32::MAX, ..Default::default() }).unwrap();
        let reaped = registry.reap_dead_workers().unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(registry.read(idx).unwrap().pid, 0);
    }
}
