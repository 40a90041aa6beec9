//! Wire-protocol plumbing shared across `pgarc`: the length-prefixed memory
//! buffer (`buffer::ProtocolBuffer`) and the v3 message / framed
//! `CopyData`-subprotocol types (`message`). Sits below the service crate
//! that drives connections.

pub mod buffer;
pub mod message;

pub use buffer::{BufferError, ProtocolBuffer};
pub use message::{BaseBackupFrame, BeMessage, FeMessage, FieldDescription, ProtocolError};
