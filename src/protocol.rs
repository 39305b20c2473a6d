//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::buffer::{ReadBuffer, WireBuffer};
use crate::error::{PgError, PgResult, ServerError};
use crate::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Backend message type bytes.
pub mod tag {
    pub const AUTHENTICATION: u8 = b'R';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const NO_DATA: u8 = b'n';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
}

/// Authentication request subtypes.
pub mod auth {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl TryFrom<i16> for Format {
    type Error = PgError;

    fn try_from(code: i16) -> PgResult<Self> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(PgError::Decode(format!("unknown format code {}", other))),
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = PgError;

    fn try_from(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(PgError::Decode(format!(
                "unknown transaction status ({})",
                other as char
            ))),
        }
    }
}

/// What a Describe or Close message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    pub fn as_byte(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    /// Message type byte. Only the startup packet has none.
    const TAG: Option<u8>;

    /// Write everything after the length field.
    fn encode_body(&self, buf: &mut WireBuffer);

    /// Frame the message: `[tag] [int32 length including itself] [body]`.
    fn encode(&self) -> PgResult<BytesMut> {
        let mut body = WireBuffer::new();
        self.encode_body(&mut body);
        let length = frame_length(body.len())?;

        let mut buf = BytesMut::with_capacity(body.len() + 5);
        if let Some(tag) = Self::TAG {
            buf.put_u8(tag);
        }
        buf.put_i32(length);
        buf.put_slice(body.as_slice());
        Ok(buf)
    }
}

/// Length field for a body of `body_len` bytes.
pub fn frame_length(body_len: usize) -> PgResult<i32> {
    body_len
        .checked_add(4)
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| {
            PgError::Protocol(format!(
                "message body of {} bytes exceeds the protocol limit",
                body_len
            ))
        })
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage<'a> {
    pub params: &'a [(String, String)],
}

impl FrontendMessage for StartupMessage<'_> {
    const TAG: Option<u8> = None;

    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.write_i32(PROTOCOL_VERSION);
        for (key, value) in self.params {
            buf.write_cstring(key);
            buf.write_cstring(value);
        }
        buf.write_cstring("");
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendMessage for PasswordMessage<'_> {
    const TAG: Option<u8> = Some(b'p');

    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.write_cstring(self.password);
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage<'a> {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: &'a str,
    /// Initial client response data
    pub data: &'a [u8],
}

impl FrontendMessage for SaslInitialResponseMessage<'_> {
    const TAG: Option<u8> = Some(b'p');

    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.write_cstring(self.mechanism);
        buf.write_i32(self.data.len() as i32);
        buf.write_bytes(self.data);
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for SaslResponseMessage<'_> {
    const TAG: Option<u8> = Some(b'p');

    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.write_bytes(self.data);
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    const TAG: Option<u8> = Some(b'Q');

    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.write_cstring(self.query);
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    /// Parameter types; may be shorter than the parameter count, the server
    /// infers the rest.
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    const TAG: Option<u8> = Some(b'P');

    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.write_cstring(self.name);
        buf.write_cstring(self.query);
        buf.write_i16(self.param_types.len() as i16);
        for oid in self.param_types {
            buf.write_i32(oid.as_i32());
        }
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement
///
/// Parameters and results all use the text format: both format code
/// lists are sent empty.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    /// Text-encoded parameters; `None` is NULL.
    pub params: &'a [Option<String>],
}

impl FrontendMessage for BindMessage<'_> {
    const TAG: Option<u8> = Some(b'B');

    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.write_cstring(self.portal);
        buf.write_cstring(self.statement);

        // Parameter format codes
        buf.write_i16(0);

        buf.write_i16(self.params.len() as i16);
        for param in self.params {
            match param {
                Some(value) => {
                    buf.write_i32(value.len() as i32);
                    buf.write_bytes(value.as_bytes());
                }
                None => buf.write_i32(-1),
            }
        }

        // Result format codes
        buf.write_i16(0);
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    const TAG: Option<u8> = Some(b'E');

    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.write_cstring(self.portal);
        buf.write_i32(self.max_rows);
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    pub target: Target,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    const TAG: Option<u8> = Some(b'D');

    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.write_u8(self.target.as_byte());
        buf.write_cstring(self.name);
    }
}

/// Close message ('C') - Destroy a prepared statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    pub target: Target,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    const TAG: Option<u8> = Some(b'C');

    fn encode_body(&self, buf: &mut WireBuffer) {
        buf.write_u8(self.target.as_byte());
        buf.write_cstring(self.name);
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    const TAG: Option<u8> = Some(b'S');

    fn encode_body(&self, _buf: &mut WireBuffer) {}
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    const TAG: Option<u8> = Some(b'H');

    fn encode_body(&self, _buf: &mut WireBuffer) {}
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    const TAG: Option<u8> = Some(b'X');

    fn encode_body(&self, _buf: &mut WireBuffer) {}
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Largest backend message accepted, length field included (1 GiB).
pub const MAX_MESSAGE_LEN: i32 = 1 << 30;

/// Fixed part of every backend message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u8,
    /// Includes the length field itself but not the tag.
    pub length: i32,
}

impl Header {
    pub const SIZE: usize = 5;

    pub fn parse(raw: [u8; Self::SIZE]) -> PgResult<Self> {
        let length = i32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
        if !(4..=MAX_MESSAGE_LEN).contains(&length) {
            return Err(PgError::Decode(format!(
                "invalid length {} for message ({})",
                length, raw[0] as char
            )));
        }
        Ok(Header {
            tag: raw[0],
            length,
        })
    }

    /// Number of body bytes following the header.
    pub fn body_len(&self) -> usize {
        (self.length - 4) as usize
    }
}

/// A framed message whose body has not been decoded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub header: Header,
    pub body: Bytes,
}

impl RawMessage {
    pub fn decode(self) -> PgResult<Message> {
        Message::decode(self.header.tag, self.body)
    }
}

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

/// An asynchronous NOTIFY delivered outside the request/response flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Process id of the notifying backend.
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Tag of a CommandComplete message, e.g. `INSERT 0 3` or `CREATE TABLE`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandTag(pub String);

impl CommandTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The command word(s), e.g. `INSERT` or `CREATE TABLE`.
    pub fn command(&self) -> &str {
        self.0.trim_end_matches(|c: char| c.is_ascii_digit() || c == ' ')
    }

    /// Rows affected or returned; 0 for commands that report no count.
    pub fn rows_affected(&self) -> u64 {
        let mut words = self.0.split_whitespace();
        match words.next() {
            Some("INSERT" | "UPDATE" | "DELETE" | "SELECT" | "MOVE" | "FETCH" | "COPY" | "MERGE") => {
                words.last().and_then(|n| n.parse().ok()).unwrap_or(0)
            }
            _ => 0,
        }
    }
}

/// Backend message types
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password {
        salt: [u8; 4],
    },
    AuthenticationSasl {
        mechanisms: Vec<String>,
    },
    AuthenticationSaslContinue {
        data: Bytes,
    },
    AuthenticationSaslFinal {
        data: Bytes,
    },
    /// An authentication request this client does not implement.
    AuthenticationOther {
        code: i32,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: CommandTag,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription {
        type_oids: Vec<Oid>,
    },

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse(ServerError),
    NoticeResponse(ServerError),

    // Asynchronous
    NotificationResponse(Notification),
}

impl Message {
    /// Decode one message body.
    ///
    /// The whole body must be consumed; leftovers are a decode error.
    pub fn decode(msg_type: u8, body: Bytes) -> PgResult<Self> {
        let mut buf = ReadBuffer::new(body);

        let msg = match msg_type {
            tag::AUTHENTICATION => Self::decode_auth(&mut buf)?,
            tag::ROW_DESCRIPTION => Self::decode_row_description(&mut buf)?,
            tag::DATA_ROW => Self::decode_data_row(&mut buf)?,
            tag::COMMAND_COMPLETE => Message::CommandComplete {
                tag: CommandTag(buf.read_cstring()?),
            },
            tag::READY_FOR_QUERY => Message::ReadyForQuery {
                status: TransactionStatus::try_from(buf.read_u8()?)?,
            },
            tag::ERROR_RESPONSE => Message::ErrorResponse(read_error_fields(&mut buf)?),
            tag::NOTICE_RESPONSE => Message::NoticeResponse(read_error_fields(&mut buf)?),
            tag::PARAMETER_STATUS => Message::ParameterStatus {
                name: buf.read_cstring()?,
                value: buf.read_cstring()?,
            },
            tag::BACKEND_KEY_DATA => Message::BackendKeyData {
                process_id: buf.read_i32()?,
                secret_key: buf.read_i32()?,
            },
            tag::PARSE_COMPLETE => Message::ParseComplete,
            tag::BIND_COMPLETE => Message::BindComplete,
            tag::CLOSE_COMPLETE => Message::CloseComplete,
            tag::EMPTY_QUERY_RESPONSE => Message::EmptyQueryResponse,
            tag::NO_DATA => Message::NoData,
            tag::PORTAL_SUSPENDED => Message::PortalSuspended,
            tag::PARAMETER_DESCRIPTION => Self::decode_parameter_description(&mut buf)?,
            tag::NOTIFICATION_RESPONSE => Message::NotificationResponse(Notification {
                process_id: buf.read_i32()?,
                channel: buf.read_cstring()?,
                payload: buf.read_cstring()?,
            }),
            _ => {
                return Err(PgError::Protocol(format!(
                    "unknown server response ({})",
                    msg_type as char
                )))
            }
        };

        buf.finish(msg_type)?;
        Ok(msg)
    }

    /// The backend type byte this message was decoded from.
    pub fn tag(&self) -> u8 {
        match self {
            Message::AuthenticationOk
            | Message::AuthenticationCleartextPassword
            | Message::AuthenticationMd5Password { .. }
            | Message::AuthenticationSasl { .. }
            | Message::AuthenticationSaslContinue { .. }
            | Message::AuthenticationSaslFinal { .. }
            | Message::AuthenticationOther { .. } => tag::AUTHENTICATION,
            Message::RowDescription { .. } => tag::ROW_DESCRIPTION,
            Message::DataRow { .. } => tag::DATA_ROW,
            Message::CommandComplete { .. } => tag::COMMAND_COMPLETE,
            Message::EmptyQueryResponse => tag::EMPTY_QUERY_RESPONSE,
            Message::ParseComplete => tag::PARSE_COMPLETE,
            Message::BindComplete => tag::BIND_COMPLETE,
            Message::CloseComplete => tag::CLOSE_COMPLETE,
            Message::NoData => tag::NO_DATA,
            Message::PortalSuspended => tag::PORTAL_SUSPENDED,
            Message::ParameterDescription { .. } => tag::PARAMETER_DESCRIPTION,
            Message::ReadyForQuery { .. } => tag::READY_FOR_QUERY,
            Message::ParameterStatus { .. } => tag::PARAMETER_STATUS,
            Message::BackendKeyData { .. } => tag::BACKEND_KEY_DATA,
            Message::ErrorResponse(_) => tag::ERROR_RESPONSE,
            Message::NoticeResponse(_) => tag::NOTICE_RESPONSE,
            Message::NotificationResponse(_) => tag::NOTIFICATION_RESPONSE,
        }
    }

    fn decode_auth(buf: &mut ReadBuffer) -> PgResult<Self> {
        let auth_type = buf.read_i32()?;

        let msg = match auth_type {
            auth::OK => Message::AuthenticationOk,
            auth::CLEARTEXT_PASSWORD => Message::AuthenticationCleartextPassword,
            auth::MD5_PASSWORD => {
                let raw = buf.read_bytes(4)?;
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&raw);
                Message::AuthenticationMd5Password { salt }
            }
            auth::SASL => {
                let mut mechanisms = Vec::new();
                loop {
                    let mech = buf.read_cstring()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Message::AuthenticationSasl { mechanisms }
            }
            auth::SASL_CONTINUE => Message::AuthenticationSaslContinue {
                data: buf.read_rest(),
            },
            auth::SASL_FINAL => Message::AuthenticationSaslFinal {
                data: buf.read_rest(),
            },
            code => {
                // Kerberos, GSS, SSPI...: payload is opaque to us.
                buf.read_rest();
                Message::AuthenticationOther { code }
            }
        };

        Ok(msg)
    }

    fn decode_row_description(buf: &mut ReadBuffer) -> PgResult<Self> {
        let num_fields = read_count(buf, "field")?;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            fields.push(FieldDescription {
                name: buf.read_cstring()?,
                table_oid: buf.read_i32()?,
                column_attr: buf.read_i16()?,
                type_oid: Oid::from_i32(buf.read_i32()?),
                type_size: buf.read_i16()?,
                type_modifier: buf.read_i32()?,
                format: Format::try_from(buf.read_i16()?)?,
            });
        }

        Ok(Message::RowDescription { fields })
    }

    fn decode_data_row(buf: &mut ReadBuffer) -> PgResult<Self> {
        let num_cols = read_count(buf, "column")?;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = buf.read_i32()?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(buf.read_bytes(len as usize)?));
            }
        }

        Ok(Message::DataRow { values })
    }

    fn decode_parameter_description(buf: &mut ReadBuffer) -> PgResult<Self> {
        let num_params = read_count(buf, "parameter")?;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(buf.read_i32()?));
        }

        Ok(Message::ParameterDescription { type_oids })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Read an int16 element count, rejecting negative values.
fn read_count(buf: &mut ReadBuffer, what: &str) -> PgResult<usize> {
    let n = buf.read_i16()?;
    usize::try_from(n).map_err(|_| PgError::Decode(format!("negative {} count {}", what, n)))
}

/// Read error/notice response fields up to the terminating zero byte.
fn read_error_fields(buf: &mut ReadBuffer) -> PgResult<ServerError> {
    let mut fields = HashMap::new();

    loop {
        let field_type = buf.read_u8()?;
        if field_type == 0 {
            break;
        }
        let value = buf.read_cstring()?;
        fields.insert(field_type, value);
    }

    Ok(ServerError::new(fields))
}
