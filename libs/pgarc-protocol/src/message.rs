use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("unknown copy-data kind byte {0:#x} in the framed base-backup subprotocol")]
    UnknownCopyKind(u8),
    #[error("unexpected end of input while decoding a message")]
    UnexpectedEof,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A column descriptor for `RowDescription`.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub attnum: i16,
    pub type_oid: u32,
    pub type_len: i16,
    pub type_modifier: i32,
    /// 0 = text, 1 = binary.
    pub format: i16,
}

/// Messages the server speaks, using the wire format `Type(1)
/// Length(4-BE including length) Payload`.
#[derive(Debug, Clone)]
pub enum BeMessage {
    AuthenticationOk,
    ParameterStatus { name: String, value: String },
    BackendKeyData { pid: i32, secret_key: i32 },
    ReadyForQuery,
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    ErrorResponse { severity: String, code: String, message: String },
    CopyInResponse { binary: bool, column_formats: Vec<i16> },
    CopyOutResponse { binary: bool, column_formats: Vec<i16> },
    CopyBothResponse { binary: bool, column_formats: Vec<i16> },
    CopyData(Bytes),
    CopyDone,
}

impl BeMessage {
    /// Serializes this message as `Type(1) Length(4) Payload`, per the v3
    /// wire format. The length field includes itself but not the type byte.
    pub fn encode(&self, out: &mut BytesMut) {
        let mut payload = BytesMut::new();
        let tag = self.encode_payload(&mut payload);
        out.put_u8(tag);
        out.put_i32(payload.len() as i32 + 4);
        out.extend_from_slice(&payload);
    }

    fn encode_payload(&self, payload: &mut BytesMut) -> u8 {
        match self {
            BeMessage::AuthenticationOk => {
                payload.put_i32(0);
                b'R'
            }
            BeMessage::ParameterStatus { name, value } => {
                put_cstr(payload, name);
                put_cstr(payload, value);
                b'S'
            }
            BeMessage::BackendKeyData { pid, secret_key } => {
                payload.put_i32(*pid);
                payload.put_i32(*secret_key);
                b'K'
            }
            BeMessage::ReadyForQuery => {
                payload.put_u8(b'I');
                b'Z'
            }
            BeMessage::RowDescription(fields) => {
                payload.put_i16(fields.len() as i16);
                for f in fields {
                    put_cstr(payload, &f.name);
                    payload.put_i32(f.table_oid as i32);
                    payload.put_i16(f.attnum);
                    payload.put_i32(f.type_oid as i32);
                    payload.put_i16(f.type_len);
                    payload.put_i32(f.type_modifier);
                    payload.put_i16(f.format);
                }
                b'T'
            }
            BeMessage::DataRow(columns) => {
                payload.put_i16(columns.len() as i16);
                for col in columns {
                    match col {
                        Some(bytes) => {
                            payload.put_i32(bytes.len() as i32);
                            payload.extend_from_slice(bytes);
                        }
                        None => payload.put_i32(-1),
                    }
                }
                b'D'
            }
            BeMessage::CommandComplete(tag) => {
                put_cstr(payload, tag);
                b'C'
            }
            BeMessage::ErrorResponse { severity, code, message } => {
                payload.put_u8(b'S');
                put_cstr(payload, severity);
                payload.put_u8(b'C');
                put_cstr(payload, code);
                payload.put_u8(b'M');
                put_cstr(payload, message);
                payload.put_u8(0);
                b'E'
            }
            BeMessage::CopyInResponse { binary, column_formats } => {
                encode_copy_response(payload, *binary, column_formats);
                b'G'
            }
            BeMessage::CopyOutResponse { binary, column_formats } => {
                encode_copy_response(payload, *binary, column_formats);
                b'H'
            }
            BeMessage::CopyBothResponse { binary, column_formats } => {
                encode_copy_response(payload, *binary, column_formats);
                b'W'
            }
            BeMessage::CopyData(data) => {
                payload.extend_from_slice(data);
                b'd'
            }
            BeMessage::CopyDone => b'c',
        }
    }
}

fn encode_copy_response(payload: &mut BytesMut, binary: bool, column_formats: &[i16]) {
    payload.put_u8(if binary { 1 } else { 0 });
    payload.put_i16(column_formats.len() as i16);
    for f in column_formats {
        payload.put_i16(*f);
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Messages the client may send once in a copy subprotocol: the
/// `G, H, W, d, c, f` family.
#[derive(Debug, Clone)]
pub enum FeMessage {
    CopyData(Bytes),
    CopyDone,
    CopyFail(String),
    /// A plain query string, used to carry the small command grammar.
    Query(String),
}

impl FeMessage {
    /// Decodes one length-prefixed frame, given the already-consumed type
    /// tag and a buffer containing exactly `length - 4` payload bytes.
    pub fn decode(tag: u8, mut payload: Bytes) -> Result<Self> {
        match tag {
            b'd' => Ok(FeMessage::CopyData(payload)),
            b'c' => Ok(FeMessage::CopyDone),
            b'f' => {
                let s = read_cstr(&mut payload)?;
                Ok(FeMessage::CopyFail(s))
            }
            b'Q' => {
                let s = read_cstr(&mut payload)?;
                Ok(FeMessage::Query(s))
            }
            _ => Err(ProtocolError::Malformed("unrecognized frontend message tag")),
        }
    }
}

fn read_cstr(buf: &mut Bytes) -> Result<String> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::UnexpectedEof)?;
    let s = String::from_utf8_lossy(&buf[..nul]).into_owned();
    buf.advance(nul + 1);
    Ok(s)
}

/// The PostgreSQL 15 framed `CopyData` subprotocol used by `BASE_BACKUP`.
#[derive(Debug, Clone)]
pub enum BaseBackupFrame {
    /// `n`: a new per-tablespace archive begins. Payload is
    /// `archive-name \0 tablespace-location \0`.
    NewArchive { archive_name: String, tablespace_location: String },
    /// `m`: the backup manifest begins. No payload.
    ManifestStart,
    /// `d`: raw bytes for whichever archive or manifest is currently open.
    Data(Bytes),
    /// `p`: progress, an 8-byte big-endian signed byte count.
    Progress(i64),
}

impl BaseBackupFrame {
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Err(ProtocolError::UnexpectedEof);
        }
        let kind = payload.get_u8();
        match kind {
            b'n' => {
                let archive_name = read_cstr(&mut payload)?;
                let tablespace_location = read_cstr(&mut payload)?;
                Ok(BaseBackupFrame::NewArchive { archive_name, tablespace_location })
            }
            b'm' => Ok(BaseBackupFrame::ManifestStart),
            b'd' => Ok(BaseBackupFrame::Data(payload)),
            b'p' => {
                if payload.len() < 8 {
                    return Err(ProtocolError::UnexpectedEof);
                }
                Ok(BaseBackupFrame::Progress(payload.get_i64()))
            }
            other => Err(ProtocolError::UnknownCopyKind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn be_message_authentication_ok_encodes_tag_and_length() {
        let mut out = BytesMut::new();
        BeMessage::AuthenticationOk.encode(&mut out);
        assert_eq!(out[0], b'R');
        let len = (&out[1..5]).get_i32();
        assert_eq!(len as usize, out.len() - 1);
    }

    #[test]
    fn base_backup_frame_decodes_new_archive() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'n');
        payload.extend_from_slice(b"base.tar\0");
        payload.extend_from_slice(b"\0");
        let frame = BaseBackupFrame::decode(payload.freeze()).unwrap();
        match frame {
            BaseBackupFrame::NewArchive { archive_name, tablespace_location } => {
                assert_eq!(archive_name, "base.tar");
                assert_eq!(tablespace_location, "");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn base_backup_frame_decodes_progress() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'p');
        payload.put_i64(0x1000);
        let frame = BaseBackupFrame::decode(payload.freeze()).unwrap();
        match frame {
            BaseBackupFrame::Progress(n) => assert_eq!(n, 0x1000),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn base_backup_frame_rejects_unknown_kind() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'z');
        assert!(matches!(
            BaseBackupFrame::decode(payload.freeze()),
            Err(ProtocolError::UnknownCopyKind(b'z'))
        ));
    }
}
