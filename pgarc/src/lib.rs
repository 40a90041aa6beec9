//! `pgarc` — a PostgreSQL physical backup and archiving engine.
//!
//! Streams base backups and WAL segments from a running primary over the
//! streaming replication protocol, stores them in a content-addressed
//! on-disk archive, tracks their lifecycle in an embedded catalog, and
//! serves those archives back to recovery clients via a small
//! wire-compatible replication protocol surface.
//!
//! The crate does not parse CLI arguments, read the environment, or install
//! a `tracing` subscriber; those are the calling binary's job.

pub mod archive_fs;
pub mod base_backup;
pub mod catalog;
pub mod config;
pub mod copy_manager;
pub mod jobs;
pub mod repl;
pub mod retention;
pub mod signal;
pub mod wal_streamer;
pub mod worker_registry;

pub use config::{ArchiveConnectionConfig, BackupProfileConfig, Config};
