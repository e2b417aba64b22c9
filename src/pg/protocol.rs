//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the subset of the v3 protocol the baseline client
//! needs. Every tagged message is `tag: u8, len: i32, body`, where `len`
//! counts itself plus the body but not the tag.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{PgError, PgResult, ServerError};
use super::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Size of the tag byte plus the length field.
pub const HEADER_LEN: usize = 5;

/// Largest backend message accepted into memory, length field included.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'I' => Some(TransactionStatus::Idle),
            b'T' => Some(TransactionStatus::InTransaction),
            b'E' => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

impl TryFrom<u8> for TransactionStatus {
    type Error = PgError;

    fn try_from(b: u8) -> PgResult<Self> {
        Self::from_byte(b).ok_or_else(|| {
            PgError::Protocol(format!("invalid transaction status byte 0x{:02x}", b))
        })
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Append a tagged frame, back-patching its length once `body` has written
/// the payload.
pub fn put_frame(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_at = buf.len();
    buf.put_i32(0);
    body(buf);
    patch_len(buf, len_at);
}

/// Fallible variant of [`put_frame`]. On error the partially written frame
/// is truncated away.
pub fn try_put_frame<E>(
    buf: &mut BytesMut,
    tag: u8,
    body: impl FnOnce(&mut BytesMut) -> Result<(), E>,
) -> Result<(), E> {
    let start = buf.len();
    buf.put_u8(tag);
    let len_at = buf.len();
    buf.put_i32(0);
    if let Err(e) = body(buf) {
        buf.truncate(start);
        return Err(e);
    }
    patch_len(buf, len_at);
    Ok(())
}

fn patch_len(buf: &mut BytesMut, len_at: usize) {
    let len = (buf.len() - len_at) as i32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

#[inline]
pub fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Encodes a frontend message by appending it to a buffer.
pub trait FrontendMessage {
    fn encode(&self, buf: &mut BytesMut);

    fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf
    }
}

/// Startup message sent at connection start. Untagged.
#[derive(Debug, Clone)]
pub struct StartupMessage<'a> {
    pub user: &'a str,
    pub database: Option<&'a str>,
    pub options: &'a [(&'a str, &'a str)],
}

impl FrontendMessage for StartupMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        let len_at = buf.len();
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        put_cstr(buf, "user");
        put_cstr(buf, self.user);
        if let Some(db) = self.database {
            put_cstr(buf, "database");
            put_cstr(buf, db);
        }
        for (key, value) in self.options {
            put_cstr(buf, key);
            put_cstr(buf, value);
        }
        buf.put_u8(0);

        // Startup length counts the whole message
        patch_len(buf, len_at);
    }
}

/// Password message (cleartext or MD5 digest)
#[derive(Debug, Clone)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendMessage for PasswordMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_frame(buf, b'p', |b| put_cstr(b, self.password));
    }
}

/// SASL Initial Response message ('p')
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage<'a> {
    pub mechanism: &'a str,
    pub data: &'a [u8],
}

impl FrontendMessage for SaslInitialResponseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_frame(buf, b'p', |b| {
            put_cstr(b, self.mechanism);
            b.put_i32(self.data.len() as i32);
            b.put_slice(self.data);
        });
    }
}

/// SASL Response message ('p')
#[derive(Debug, Clone)]
pub struct SaslResponseMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for SaslResponseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_frame(buf, b'p', |b| b.put_slice(self.data));
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_frame(buf, b'Q', |b| put_cstr(b, self.query));
    }
}

/// Parse message ('P'). An empty `param_types` lets the backend infer them.
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_frame(buf, b'P', |b| {
            put_cstr(b, self.name);
            put_cstr(b, self.query);
            b.put_i16(self.param_types.len() as i16);
            for oid in self.param_types {
                b.put_i32(oid.as_i32());
            }
        });
    }
}

/// Describe message ('D')
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_frame(buf, b'D', |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name);
        });
    }
}

/// Execute message ('E')
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// 0 means no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        put_frame(buf, b'E', |b| {
            put_cstr(b, self.portal);
            b.put_i32(self.max_rows);
        });
    }
}

/// Sync message ('S')
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self, buf: &mut BytesMut) {
        put_frame(buf, b'S', |_| {});
    }
}

/// Terminate message ('X')
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self, buf: &mut BytesMut) {
        put_frame(buf, b'X', |_| {});
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    // Query responses
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },
}

impl BackendMessage {
    /// Decode one backend message. `buf` must start with the tag byte and
    /// hold the complete frame; the frame is consumed from `buf`.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        if len < 4 {
            return Err(PgError::Protocol(format!(
                "Invalid length {} for message '{}'",
                len, msg_type as char
            )));
        }
        let body_len = len as usize - 4;
        if buf.remaining() < body_len {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        let body = buf.split_to(body_len);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => {
                let mut body = body;
                let tag = read_cstring(&mut body)?;
                Ok(BackendMessage::CommandComplete { tag })
            }
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            }),
            b'S' => {
                let mut body = body;
                let name = read_cstring(&mut body)?;
                let value = read_cstring(&mut body)?;
                Ok(BackendMessage::ParameterStatus { name, value })
            }
            b'K' => {
                let mut body = body;
                need(&body, 8, "BackendKeyData")?;
                Ok(BackendMessage::BackendKeyData {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                })
            }
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            _ => Err(PgError::Protocol(format!(
                "Unsupported message type: {}",
                msg_type as char
            ))),
        }
    }

    /// The wire tag, for diagnostics.
    pub fn tag(&self) -> char {
        match self {
            BackendMessage::AuthenticationOk
            | BackendMessage::AuthenticationCleartextPassword
            | BackendMessage::AuthenticationMD5Password { .. }
            | BackendMessage::AuthenticationSASL { .. }
            | BackendMessage::AuthenticationSASLContinue { .. }
            | BackendMessage::AuthenticationSASLFinal { .. } => 'R',
            BackendMessage::RowDescription { .. } => 'T',
            BackendMessage::DataRow { .. } => 'D',
            BackendMessage::CommandComplete { .. } => 'C',
            BackendMessage::EmptyQueryResponse => 'I',
            BackendMessage::ParseComplete => '1',
            BackendMessage::BindComplete => '2',
            BackendMessage::CloseComplete => '3',
            BackendMessage::NoData => 'n',
            BackendMessage::PortalSuspended => 's',
            BackendMessage::ParameterDescription { .. } => 't',
            BackendMessage::ReadyForQuery { .. } => 'Z',
            BackendMessage::ParameterStatus { .. } => 'S',
            BackendMessage::BackendKeyData { .. } => 'K',
            BackendMessage::ErrorResponse { .. } => 'E',
            BackendMessage::NoticeResponse { .. } => 'N',
        }
    }

    fn decode_auth(mut body: Bytes) -> PgResult<Self> {
        need(&body, 4, "Authentication")?;
        let auth_type = body.get_i32();

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                need(&body, 4, "AuthenticationMD5Password")?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            _ => Err(PgError::Protocol(format!(
                "Unsupported authentication type: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> PgResult<Self> {
        need(&body, 2, "RowDescription")?;
        let num_fields = body.get_i16().max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            need(&body, 18, "RowDescription field")?;
            fields.push(FieldDescription {
                name,
                table_oid: body.get_i32(),
                column_attr: body.get_i16(),
                type_oid: Oid::from_i32(body.get_i32()),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: if body.get_i16() == 0 {
                    Format::Text
                } else {
                    Format::Binary
                },
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> PgResult<Self> {
        need(&body, 2, "DataRow")?;
        let num_cols = body.get_i16().max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            need(&body, 4, "DataRow column")?;
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                need(&body, len as usize, "DataRow value")?;
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_ready_for_query(body: Bytes) -> PgResult<Self> {
        if body.len() != 1 {
            return Err(PgError::Protocol(format!(
                "ReadyForQuery body must be 1 byte, got {}",
                body.len()
            )));
        }
        let status = TransactionStatus::try_from(body[0])?;
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_parameter_description(mut body: Bytes) -> PgResult<Self> {
        need(&body, 2, "ParameterDescription")?;
        let num_params = body.get_i16().max(0) as usize;
        need(&body, num_params * 4, "ParameterDescription")?;
        let type_oids = (0..num_params)
            .map(|_| Oid::from_i32(body.get_i32()))
            .collect();
        Ok(BackendMessage::ParameterDescription { type_oids })
    }
}

/// Build a [`ServerError`] from ErrorResponse fields.
pub fn server_error(fields: &HashMap<u8, String>) -> ServerError {
    ServerError {
        severity: fields.get(&b'S').cloned().unwrap_or_default(),
        code: fields.get(&b'C').cloned().unwrap_or_default(),
        message: fields.get(&b'M').cloned().unwrap_or_default(),
        detail: fields.get(&b'D').cloned(),
        hint: fields.get(&b'H').cloned(),
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn need(body: &Bytes, n: usize, what: &str) -> PgResult<()> {
    if body.remaining() < n {
        return Err(PgError::Protocol(format!("Truncated {} message", what)));
    }
    Ok(())
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}
