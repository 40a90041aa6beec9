//! A queue-depth array of fixed-size blocks plus a parallel
//! `IoSlice`/`IoSliceMut` array, used to
//! drive `preadv`/`pwritev` against the two file descriptors of one copy
//! operation. Falls back to sequential `read`/`write` when vectoring has no
//! benefit (the single-chunk case).

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, BorrowedFd};

use nix::sys::uio::{pread, pwrite, preadv, pwritev};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectoredError {
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, VectoredError>;

/// Owns `queue_depth` fixed `block_size` buffers and reads/writes them as
/// one vector per `preadv`/`pwritev` call, advancing `offset` by however
/// many bytes the kernel actually moved (a short read/write just resumes
/// from the advanced position on the next call).
pub struct VectoredBuffer {
    block_size: usize,
    blocks: Vec<Vec<u8>>,
    effective_sizes: Vec<usize>,
    offset: u64,
}

impl VectoredBuffer {
    pub fn new(queue_depth: usize, block_size: usize) -> Self {
        VectoredBuffer {
            block_size,
            blocks: (0..queue_depth).map(|_| vec![0u8; block_size]).collect(),
            effective_sizes: vec![block_size; queue_depth],
            offset: 0,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn get_effective_size(&self, index: usize) -> usize {
        self.effective_sizes[index]
    }

    /// Records a short completion for block `index` (e.g. a read that hit
    /// EOF partway through a block).
    pub fn set_effective_size(&mut self, index: usize, size: usize) {
        self.effective_sizes[index] = size;
    }

    pub fn block_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.blocks[index][..self.effective_sizes[index]]
    }

    pub fn block(&self, index: usize) -> &[u8] {
        &self.blocks[index][..self.effective_sizes[index]]
    }

    /// Reads up to `queue_depth * block_size` bytes from `fd` starting at
    /// the buffer's current offset, one `preadv` submission. Returns the
    /// total bytes read (0 at EOF) and advances `offset`.
    pub fn readv_from(&mut self, fd: BorrowedFd<'_>) -> Result<usize> {
        let offset = self.offset as i64;
        let mut slices: Vec<IoSliceMut<'_>> = self.blocks.iter_mut().map(|b| IoSliceMut::new(b)).collect();
        let total = preadv(fd, &mut slices, offset)? as usize;
        self.distribute_effective_sizes(total);
        self.offset += total as u64;
        Ok(total)
    }

    /// Writes the buffer's current effective contents to `fd` at the
    /// buffer's offset, one `pwritev` submission.
    pub fn writev_to(&mut self, fd: BorrowedFd<'_>) -> Result<usize> {
        let offset = self.offset as i64;
        let slices: Vec<IoSlice<'_>> = (0..self.blocks.len())
            .map(|i| IoSlice::new(self.block(i)))
            .collect();
        let total = pwritev(fd, &slices, offset)? as usize;
        self.offset += total as u64;
        Ok(total)
    }

    /// Sequential fallback for a single-chunk copy where vectoring buys
    /// nothing: reads one block directly via `pread`.
    pub fn read_single(&mut self, fd: BorrowedFd<'_>) -> Result<usize> {
        let offset = self.offset as i64;
        let n = pread(fd, &mut self.blocks[0], offset)?;
        self.effective_sizes[0] = n;
        self.offset += n as u64;
        Ok(n)
    }

    /// Sequential fallback counterpart to `read_single`.
    pub fn write_single(&mut self, fd: BorrowedFd<'_>) -> Result<usize> {
        let offset = self.offset as i64;
        let n = pwrite(fd, self.block(0), offset)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn distribute_effective_sizes(&mut self, mut total: usize) {
        for size in self.effective_sizes.iter_mut() {
            let take = total.min(self.block_size);
            *size = take;
            total -= take;
        }
    }
}

pub fn fd_of(f: &std::fs::File) -> BorrowedFd<'_> {
    f.as_fd()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn vectored_round_trip_matches_source_bytes() {
        let src_path = camino_tempfile::Utf8TempDir::new().unwrap().path().join("src.bin");
        let dst_path = src_path.with_file_name("dst.bin");
        let payload: Vec<u8> = (0..3 * 4096u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&src_path, &payload).unwrap();

        let src = std::fs::File::open(&src_path).unwrap();
        let dst = std::fs::OpenOptions::new().create(true).write(true).open(&dst_path).unwrap();

        let mut buf = VectoredBuffer::new(3, 4096);
        let n = buf.readv_from(fd_of(&src)).unwrap();
        assert_eq!(n, payload.len());

        buf.set_offset(0);
        let mut dst = dst;
        dst.flush().unwrap();
        buf.writev_to(fd_of(&dst)).unwrap();

        let written = std::fs::read(&dst_path).unwrap();
        assert_eq!(written, payload);
    }

    #[test]
    fn effective_size_tracks_short_reads() {
        let mut buf = VectoredBuffer::new(2, 4096);
        buf.distribute_effective_sizes(4096 + 10);
        assert_eq!(buf.get_effective_size(0), 4096);
        assert_eq!(buf.get_effective_size(1), 10);
    }
}
