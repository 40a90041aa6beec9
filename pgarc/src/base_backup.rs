//! Receives and demultiplexes the `BASE_BACKUP` copy stream into one file
//! per tablespace plus the manifest.
//!
//! Archive shape follows the `tar` crate's streaming writer; the wire layer
//! is `pgarc_protocol::message::BaseBackupFrame`, which already decodes the
//! PostgreSQL 15 framed `n`/`m`/`d`/`p` subprotocol. Demuxing itself is kept
//! synchronous and independent of `tokio_postgres` so it can be fed frames
//! directly in a unit test.

use std::collections::VecDeque;
use std::io::Write as _;

use bytes::Bytes;
use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use pgarc_protocol::message::{BaseBackupFrame, ProtocolError};

use crate::archive_fs::{ArchiveError, ArchiveFile, OpenMode};
use crate::config::CompressionKind;
use crate::signal::StopToken;

#[derive(Debug, Error)]
pub enum BackupPipelineError {
    #[error("streaming failure: out-of-order step (previous tablespace not drained)")]
    OutOfOrder,
    #[error("streaming failure: no open target for a data frame")]
    NoOpenTarget,
    #[error("streaming failure: tablespace queue exhausted but server opened another archive")]
    QueueExhausted,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

pub type Result<T> = std::result::Result<T, BackupPipelineError>;

/// One entry of the tablespace summary result set the server sends ahead
/// of the copy stream, in the TABLESPACE_META state.
#[derive(Debug, Clone)]
pub struct TablespaceDescriptor {
    pub oid: Option<u32>,
    pub location: String,
    pub expected_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Started,
    StartPosition,
    TablespaceMeta,
    TablespaceReady,
    StepTablespace,
    StepTablespaceBase,
    Manifest,
    StepTablespaceInterrupted,
    ManifestInterrupted,
    Eob,
}

/// Two 512-byte zero blocks, the POSIX tar end-of-archive marker appended
/// after each tablespace's copy stream drains.
const TAR_TRAILER: [u8; 1024] = [0u8; 1024];

enum OpenTarget {
    Tablespace(ArchiveFile),
    Manifest(ArchiveFile),
}

/// Drives one base backup's receive side: dequeues tablespaces, opens the
/// corresponding output file, and demultiplexes `d`/`p` frames into it
/// until the next `n`/`m` frame or graceful end-of-backup.
pub struct Pipeline {
    dir: Utf8PathBuf,
    state: PipelineState,
    queue: VecDeque<TablespaceDescriptor>,
    current: Option<OpenTarget>,
    compression: CompressionKind,
    bytes_written: u64,
    last_progress: i64,
}

impl Pipeline {
    pub fn new(dir: impl Into<Utf8PathBuf>, compression: CompressionKind) -> Self {
        Pipeline {
            dir: dir.into(),
            state: PipelineState::Init,
            queue: VecDeque::new(),
            current: None,
            compression,
            bytes_written: 0,
            last_progress: 0,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Materializes the tablespace queue from the summary result set, per
    /// the INIT → STARTED → START_POSITION → TABLESPACE_META →
    /// TABLESPACE_READY transition.
    pub fn load_tablespace_meta(&mut self, descriptors: Vec<TablespaceDescriptor>) {
        self.state = PipelineState::Started;
        self.state = PipelineState::StartPosition;
        self.state = PipelineState::TablespaceMeta;
        self.queue = descriptors.into();
        self.state = PipelineState::TablespaceReady;
    }

    /// Feeds one decoded frame from the PG15 framed copy stream. Opening
    /// and closing per-tablespace files happens automatically as `n`/`m`
    /// frames arrive.
    pub fn feed_frame(&mut self, frame: BaseBackupFrame) -> Result<()> {
        match frame {
            BaseBackupFrame::NewArchive { archive_name, tablespace_location } => {
                self.finish_current()?;
                let desc = self.queue.pop_front();
                if desc.is_none() {
                    warn!(archive_name, "tablespace queue empty; trusting server-supplied archive name");
                }
                let _ = tablespace_location;
                let path = self.target_path(&archive_name);
                let file = self.open_target_file(&path)?;
                self.current = Some(OpenTarget::Tablespace(file));
                self.state = if archive_name == "base.tar" {
                    PipelineState::StepTablespaceBase
                } else {
                    PipelineState::StepTablespace
                };
            }
            BaseBackupFrame::ManifestStart => {
                self.finish_current()?;
                let path = self.dir.join("backup_manifest");
                let file = ArchiveFile::open(path, OpenMode::Write)?;
                self.current = Some(OpenTarget::Manifest(file));
                self.state = PipelineState::Manifest;
            }
            BaseBackupFrame::Data(bytes) => self.write_data(&bytes)?,
            BaseBackupFrame::Progress(n) => self.last_progress = n,
        }
        Ok(())
    }

    fn write_data(&mut self, bytes: &Bytes) -> Result<()> {
        match &mut self.current {
            Some(OpenTarget::Tablespace(f)) => {
                f.write_all(bytes).map_err(ArchiveError::from)?;
                self.bytes_written += bytes.len() as u64;
                Ok(())
            }
            Some(OpenTarget::Manifest(f)) => {
                f.write_all(bytes).map_err(ArchiveError::from)?;
                self.bytes_written += bytes.len() as u64;
                Ok(())
            }
            None => Err(BackupPipelineError::NoOpenTarget),
        }
    }

    fn finish_current(&mut self) -> Result<()> {
        match self.current.take() {
            Some(OpenTarget::Tablespace(mut f)) => {
                f.write_all(&TAR_TRAILER).map_err(ArchiveError::from)?;
                self.bytes_written += TAR_TRAILER.len() as u64;
                f.fsync()?;
                f.close()?;
            }
            Some(OpenTarget::Manifest(mut f)) => {
                f.fsync()?;
                f.close()?;
            }
            None => {}
        }
        Ok(())
    }

    /// Signals graceful end-of-backup: finishes whatever is open (the
    /// manifest, ordinarily) and transitions to EOB.
    pub fn finish(&mut self) -> Result<()> {
        self.finish_current()?;
        self.state = PipelineState::Eob;
        info!(bytes_written = self.bytes_written, "base backup pipeline reached end of backup");
        Ok(())
    }

    /// Interrupts the pipeline on a stop token, leaving whatever is open
    /// on disk without appending a trailer, entering the
    /// STEP_TABLESPACE_INTERRUPTED / MANIFEST_INTERRUPTED state.
    pub fn interrupt(&mut self) {
        self.state = match &self.current {
            Some(OpenTarget::Manifest(_)) => PipelineState::ManifestInterrupted,
            _ => PipelineState::StepTablespaceInterrupted,
        };
        let state = self.state;
        debug!(?state, "base backup pipeline interrupted");
    }

    /// Explicit dequeue step for the classic (unframed, one `CopyOut`
    /// stream per tablespace) subprotocol: the caller must have drained
    /// and finished the previous tablespace first.
    pub fn step_tablespace_classic(&mut self, archive_name: &str) -> Result<()> {
        if self.current.is_some() {
            return Err(BackupPipelineError::OutOfOrder);
        }
        let desc = self.queue.pop_front().ok_or(BackupPipelineError::QueueExhausted)?;
        let _ = desc;
        let path = self.target_path(archive_name);
        let file = self.open_target_file(&path)?;
        self.current = Some(OpenTarget::Tablespace(file));
        self.state = if archive_name == "base.tar" {
            PipelineState::StepTablespaceBase
        } else {
            PipelineState::StepTablespace
        };
        Ok(())
    }

    /// Classic-subprotocol counterpart to `feed_frame(Data(..))`: writes
    /// raw, unframed bytes to the currently open tablespace stream.
    pub fn feed_classic(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.current {
            Some(OpenTarget::Tablespace(f)) => {
                f.write_all(bytes).map_err(ArchiveError::from)?;
                self.bytes_written += bytes.len() as u64;
                Ok(())
            }
            _ => Err(BackupPipelineError::NoOpenTarget),
        }
    }

    pub fn finish_current_tablespace_classic(&mut self) -> Result<()> {
        self.finish_current()
    }

    fn target_path(&self, archive_name: &str) -> Utf8PathBuf {
        match self.compression {
            CompressionKind::None => self.dir.join(archive_name),
            CompressionKind::Gzip => self.dir.join(format!("{archive_name}.gz")),
        }
    }

    fn open_target_file(&self, path: &Utf8PathBuf) -> Result<ArchiveFile> {
        let file = match self.compression {
            CompressionKind::None => ArchiveFile::open(path.clone(), OpenMode::Write)?,
            CompressionKind::Gzip => ArchiveFile::open_compressed(path.clone(), OpenMode::Write)?,
        };
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use std::fs;

    fn cstr_frame(kind: u8, parts: &[&str]) -> BaseBackupFrame {
        let mut payload = bytes::BytesMut::new();
        payload.extend_from_slice(&[kind]);
        for p in parts {
            payload.extend_from_slice(p.as_bytes());
            payload.extend_from_slice(b"\0");
        }
        BaseBackupFrame::decode(payload.freeze()).unwrap()
    }

    #[test]
    fn scenario_s3_demuxes_one_tablespace_and_a_manifest() {
        let dir = tempdir().unwrap();
        let mut pipeline = Pipeline::new(dir.path().to_owned(), CompressionKind::None);
        pipeline.load_tablespace_meta(vec![TablespaceDescriptor { oid: None, location: String::new(), expected_size: None }]);

        pipeline.feed_frame(cstr_frame(b'n', &["base.tar", ""])).unwrap();
        assert_eq!(pipeline.state(), PipelineState::StepTablespaceBase);

        pipeline.feed_frame(BaseBackupFrame::Data(Bytes::from(vec![1u8; 4096]))).unwrap();
        pipeline.feed_frame(BaseBackupFrame::Progress(0x1000)).unwrap();
        pipeline.feed_frame(BaseBackupFrame::Data(Bytes::from(vec![2u8; 4096]))).unwrap();
        pipeline.feed_frame(BaseBackupFrame::ManifestStart).unwrap();
        pipeline.feed_frame(BaseBackupFrame::Data(Bytes::from(vec![3u8; 256]))).unwrap();
        pipeline.finish().unwrap();

        assert_eq!(pipeline.state(), PipelineState::Eob);

        let tar_len = fs::metadata(dir.path().join("base.tar")).unwrap().len();
        assert_eq!(tar_len, 4096 + 4096 + 1024);

        let manifest_len = fs::metadata(dir.path().join("backup_manifest")).unwrap().len();
        assert_eq!(manifest_len, 256);
    }

    #[test]
    fn data_frame_with_no_open_target_is_rejected() {
        let dir = tempdir().unwrap();
        let mut pipeline = Pipeline::new(dir.path().to_owned(), CompressionKind::None);
        let err = pipeline.feed_frame(BaseBackupFrame::Data(Bytes::from(vec![1u8]))).unwrap_err();
        assert!(matches!(err, BackupPipelineError::NoOpenTarget));
    }

    #[test]
    fn classic_step_rejects_out_of_order_reentry() {
        let dir = tempdir().unwrap();
        let mut pipeline = Pipeline::new(dir.path().to_owned(), CompressionKind::None);
        pipeline.load_tablespace_meta(vec![
            TablespaceDescriptor { oid: None, location: String::new(), expected_size: None },
            TablespaceDescriptor { oid: Some(16400), location: "/data/ts1".into(), expected_size: None },
        ]);
        pipeline.step_tablespace_classic("base.tar").unwrap();
        let err = pipeline.step_tablespace_classic("16400.tar").unwrap_err();
        assert!(matches!(err, BackupPipelineError::OutOfOrder));

        pipeline.finish_current_tablespace_classic().unwrap();
        pipeline.step_tablespace_classic("16400.tar").unwrap();
        assert_eq!(pipeline.state(), PipelineState::StepTablespace);
    }

    #[test]
    fn compressed_target_gets_gz_suffix() {
        let dir = tempdir().unwrap();
        let mut pipeline = Pipeline::new(dir.path().to_owned(), CompressionKind::Gzip);
        pipeline.load_tablespace_meta(vec![TablespaceDescriptor { oid: None, location: String::new(), expected_size: None }]);
        pipeline.feed_frame(cstr_frame(b'n', &["base.tar", ""])).unwrap();
        pipeline.feed_frame(BaseBackupFrame::Data(Bytes::from(vec![9u8; 64]))).unwrap();
        pipeline.finish().unwrap();
        assert!(dir.path().join("base.tar.gz").exists());
    }
}
