//! The on-disk archive layout and per-file handle abstraction. `Root`/`Base`/`Log` model the three directory kinds; `ArchiveFile`
//! is a single handle type wrapping one of several backends (plain,
//! temporary, gzip-compressed, piped-through-a-child-process) behind one
//! `Read`/`Write` surface, per the Design Note "treat `boost::iostreams`
//! gzip layering as a pluggable filter in the file-handle abstraction, not
//! as a parallel class hierarchy."

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::process::{Child, Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive directory layout invariant violated: {0}")]
    LayoutInvariant(String),
    #[error("directory missing: {0}")]
    DirectoryMissing(Utf8PathBuf),
    #[error("target already exists: {0}")]
    AlreadyExists(Utf8PathBuf),
    #[error("rename from {from} to {to} failed: {source}")]
    Rename { from: Utf8PathBuf, to: Utf8PathBuf, #[source] source: io::Error },
    #[error("operation unsupported on this handle kind: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// `<archive>/`, the root of one cluster's backups.
#[derive(Debug, Clone)]
pub struct Root {
    path: Utf8PathBuf,
}

/// `<archive>/base/`, holding one directory per base backup.
#[derive(Debug, Clone)]
pub struct Base {
    path: Utf8PathBuf,
}

/// `<archive>/log/`, holding WAL segment files and timeline history files.
#[derive(Debug, Clone)]
pub struct Log {
    path: Utf8PathBuf,
}

impl Root {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Root { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Creates `base/` and `log/` if they do not already exist: `base/` and
    /// `log/` must exist before any write.
    pub fn ensure_layout(&self) -> Result<(Base, Log)> {
        fs::create_dir_all(self.path.join("base"))?;
        fs::create_dir_all(self.path.join("log"))?;
        Ok((self.base(), self.log()))
    }

    pub fn base(&self) -> Base {
        Base { path: self.path.join("base") }
    }

    pub fn log(&self) -> Log {
        Log { path: self.path.join("log") }
    }

    fn require_exists(&self) -> Result<()> {
        if !self.path.is_dir() {
            return Err(ArchiveError::DirectoryMissing(self.path.clone()));
        }
        Ok(())
    }
}

impl Base {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Creates the `streambackup-<timestamp>` directory for one base
    /// backup. Fails if the target already exists.
    pub fn new_streaming_dir(&self, label: &str) -> Result<Utf8PathBuf> {
        if !self.path.is_dir() {
            return Err(ArchiveError::DirectoryMissing(self.path.clone()));
        }
        let dir = self.path.join(format!("streambackup-{label}"));
        if dir.exists() {
            return Err(ArchiveError::AlreadyExists(dir));
        }
        fs::create_dir(&dir)?;
        fsync_dir(&self.path)?;
        Ok(dir)
    }
}

impl Log {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn segment_path(&self, segment_filename: &str) -> Utf8PathBuf {
        self.path.join(segment_filename)
    }

    pub fn partial_segment_path(&self, segment_filename: &str) -> Utf8PathBuf {
        self.path.join(format!("{segment_filename}.partial"))
    }

    pub fn history_path(&self, tli: u32) -> Utf8PathBuf {
        self.path.join(format!("{tli:08X}.history"))
    }
}

/// fsyncs `path` as a directory: closing out a logically atomic write
/// fsyncs the file, then fsyncs the enclosing directory.
pub fn fsync_dir(path: &Utf8Path) -> Result<()> {
    let dir = File::open(path.as_std_path())?;
    dir.sync_all()?;
    Ok(())
}

/// Atomically renames `from` to `to` and fsyncs both the renamed file and
/// its new parent directory.
pub fn atomic_rename(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    fs::rename(from.as_std_path(), to.as_std_path()).map_err(|source| ArchiveError::Rename {
        from: from.to_owned(),
        to: to.to_owned(),
        source,
    })?;
    let f = File::open(to.as_std_path())?;
    f.sync_all()?;
    if let Some(parent) = to.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    /// Open an existing file for append, used to resume a `.partial` WAL
    /// segment across a restart.
    Append,
}

/// Which backend transport moves bytes for this handle.
enum Backend {
    Plain(File),
    GzWrite(GzEncoder<File>),
    GzRead(GzDecoder<File>),
    PipedWrite(Child),
    PipedRead(Child),
}

/// Extra behavior attached to a handle: whether it unlinks on close
/// (`temporary`) and whether it wraps a gzip filter (`compressed`) or a
/// child process (`piped`). Exactly one of `compressed`/`piped` backend
/// flags is meaningful at a time; both default to plain passthrough.
pub struct ArchiveFile {
    path: Utf8PathBuf,
    backend: Backend,
    temporary: bool,
    piped: bool,
}

impl ArchiveFile {
    /// Opens a plain file handle.
    pub fn open(path: impl Into<Utf8PathBuf>, mode: OpenMode) -> Result<Self> {
        let path = path.into();
        let file = open_with_mode(&path, mode)?;
        Ok(ArchiveFile { path, backend: Backend::Plain(file), temporary: false, piped: false })
    }

    /// Opens a handle that unlinks its path when dropped.
    pub fn open_temporary(path: impl Into<Utf8PathBuf>, mode: OpenMode) -> Result<Self> {
        let mut f = Self::open(path, mode)?;
        f.temporary = true;
        Ok(f)
    }

    /// Opens a handle that transparently gzip-encodes writes or
    /// gzip-decodes reads.
    pub fn open_compressed(path: impl Into<Utf8PathBuf>, mode: OpenMode) -> Result<Self> {
        let path = path.into();
        let file = open_with_mode(&path, mode)?;
        let backend = match mode {
            OpenMode::Read => Backend::GzRead(GzDecoder::new(file)),
            OpenMode::Write | OpenMode::Append => Backend::GzWrite(GzEncoder::new(file, Compression::default())),
        };
        Ok(ArchiveFile { path, backend, temporary: false, piped: false })
    }

    /// Spawns `command` and bridges its stdin (`OpenMode::Write`) or
    /// stdout (`OpenMode::Read`) to this handle's read/write methods, per
    /// Rename and seek are unsupported on the resulting handle.
    pub fn open_piped(path: impl Into<Utf8PathBuf>, mode: OpenMode, mut command: Command) -> Result<Self> {
        let path = path.into();
        let backend = match mode {
            OpenMode::Write => {
                let out = open_with_mode(&path, OpenMode::Write)?;
                let child = command.stdin(Stdio::piped()).stdout(out).spawn()?;
                Backend::PipedWrite(child)
            }
            OpenMode::Read => {
                let input = open_with_mode(&path, OpenMode::Read)?;
                let child = command.stdin(input).stdout(Stdio::piped()).spawn()?;
                Backend::PipedRead(child)
            }
            OpenMode::Append => return Err(ArchiveError::Unsupported("append on a piped handle")),
        };
        Ok(ArchiveFile { path, backend, temporary: false, piped: true })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns the file size in bytes. Unsupported on piped handles.
    pub fn get_size(&self) -> Result<u64> {
        match &self.backend {
            Backend::Plain(f) => Ok(f.metadata()?.len()),
            Backend::GzRead(_) | Backend::GzWrite(_) => Ok(fs::metadata(self.path.as_std_path())?.len()),
            Backend::PipedRead(_) | Backend::PipedWrite(_) => Err(ArchiveError::Unsupported("getSize on a piped handle")),
        }
    }

    /// Flushes and fsyncs the underlying plain file descriptor. A no-op's
    /// worth of effort for compressed/piped handles beyond flushing the
    /// filter, since the final bytes only land once the gzip trailer or
    /// child process has finished.
    pub fn fsync(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Plain(f) => {
                f.sync_all()?;
            }
            Backend::GzWrite(enc) => {
                enc.flush()?;
                enc.get_ref().sync_all()?;
            }
            Backend::GzRead(_) => {}
            Backend::PipedWrite(_) | Backend::PipedRead(_) => {
                return Err(ArchiveError::Unsupported("fsync on a piped handle"));
            }
        }
        Ok(())
    }

    pub fn lseek(&mut self, pos: SeekFrom) -> Result<u64> {
        match &mut self.backend {
            Backend::Plain(f) => Ok(f.seek(pos)?),
            Backend::GzWrite(_) | Backend::GzRead(_) => Err(ArchiveError::Unsupported("lseek on a compressed handle")),
            Backend::PipedWrite(_) | Backend::PipedRead(_) => Err(ArchiveError::Unsupported("lseek on a piped handle")),
        }
    }

    pub fn current_position(&mut self) -> Result<u64> {
        self.lseek(SeekFrom::Current(0))
    }

    /// Removes the file at this handle's path. Does not close the handle.
    pub fn remove(&self) -> Result<()> {
        fs::remove_file(self.path.as_std_path())?;
        Ok(())
    }

    /// Closes the handle, finishing any gzip trailer or waiting on any
    /// child process, then unlinking the path if this handle is temporary.
    pub fn close(mut self) -> Result<()> {
        self.finish_backend()?;
        if self.temporary {
            if let Err(e) = fs::remove_file(self.path.as_std_path()) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn finish_backend(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Plain(_) => {}
            Backend::GzWrite(enc) => {
                enc.try_finish()?;
            }
            Backend::GzRead(_) => {}
            Backend::PipedWrite(child) | Backend::PipedRead(child) => {
                let status = child.wait()?;
                if !status.success() {
                    warn!(?status, "piped archive helper exited non-zero");
                }
            }
        }
        Ok(())
    }
}

impl Drop for ArchiveFile {
    fn drop(&mut self) {
        let _ = self.finish_backend();
        if self.temporary {
            if let Err(e) = fs::remove_file(self.path.as_std_path()) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(error = %e, path = %self.path, "failed to unlink temporary archive file on drop");
                }
            }
        }
    }
}

impl Read for ArchiveFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.backend {
            Backend::Plain(f) => f.read(buf),
            Backend::GzRead(r) => r.read(buf),
            Backend::GzWrite(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "handle opened for write")),
            Backend::PipedRead(child) => child
                .stdout
                .as_mut()
                .expect("piped read handle always has stdout")
                .read(buf),
            Backend::PipedWrite(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "handle opened for write")),
        }
    }
}

impl Write for ArchiveFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.backend {
            Backend::Plain(f) => f.write(buf),
            Backend::GzWrite(w) => w.write(buf),
            Backend::GzRead(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "handle opened for read")),
            Backend::PipedWrite(child) => child
                .stdin
                .as_mut()
                .expect("piped write handle always has stdin")
                .write(buf),
            Backend::PipedRead(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "handle opened for read")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.backend {
            Backend::Plain(f) => f.flush(),
            Backend::GzWrite(w) => w.flush(),
            Backend::GzRead(_) => Ok(()),
            Backend::PipedWrite(child) => child.stdin.as_mut().expect("stdin").flush(),
            Backend::PipedRead(_) => Ok(()),
        }
    }
}

fn open_with_mode(path: &Utf8Path, mode: OpenMode) -> io::Result<File> {
    match mode {
        OpenMode::Read => OpenOptions::new().read(true).open(path.as_std_path()),
        OpenMode::Write => OpenOptions::new().write(true).create(true).truncate(true).open(path.as_std_path()),
        OpenMode::Append => OpenOptions::new().write(true).create(true).append(true).open(path.as_std_path()),
    }
}
