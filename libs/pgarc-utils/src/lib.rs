//! Shared identifiers used throughout the `pgarc` workspace: WAL positions,
//! timeline ids, and the process role enum. Kept dependency-free of I/O so
//! every other crate in the workspace can sit on top of it as a leaf crate.

mod lsn;
mod role;

pub use lsn::{segment_filename, Lsn, LsnParseError, TimelineId};
pub use role::RoleContext;
