//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the subset of the v3 protocol a session needs.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::types::{Oid, Value};
use crate::driver::{DriverError, DriverResult, ServerError, TransactionStatus};

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Parameter counts travel as an Int16 in Parse and Bind.
pub const MAX_PARAMS: usize = i16::MAX as usize;

/// Reject parameter lists the Parse and Bind frames cannot describe.
pub fn check_param_count(count: usize) -> DriverResult<()> {
    if count > MAX_PARAMS {
        return Err(DriverError::Protocol(format!(
            "{} parameters exceed the protocol limit of {}",
            count, MAX_PARAMS
        )));
    }
    Ok(())
}

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Prefix `body` with the tag byte and the self-inclusive length.
fn frame(tag: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    buf
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message; the only untagged frame.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: String,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_i32(PROTOCOL_VERSION);
        put_cstring(&mut body, "user");
        put_cstring(&mut body, &self.user);
        put_cstring(&mut body, "database");
        put_cstring(&mut body, &self.database);
        for (key, value) in &self.options {
            put_cstring(&mut body, key);
            put_cstring(&mut body, value);
        }
        body.put_u8(0);

        let mut buf = BytesMut::with_capacity(body.len() + 4);
        buf.put_i32(body.len() as i32 + 4);
        buf.put_slice(&body);
        buf
    }
}

/// Password message (cleartext or MD5)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.password);
        frame(b'p', &body)
    }
}

/// First SCRAM message.
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.mechanism);
        body.put_i32(self.data.len() as i32);
        body.put_slice(&self.data);
        frame(b'p', &body)
    }
}

/// Subsequent SCRAM messages.
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        frame(b'p', &self.data)
    }
}

/// Simple query ('Q'); may carry several statements.
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.query);
        frame(b'Q', &body)
    }
}

/// Parse ('P'). An empty name targets the unnamed statement.
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.name);
        put_cstring(&mut body, &self.query);
        body.put_i16(self.param_types.len() as i16);
        for oid in &self.param_types {
            body.put_i32(oid.as_i32());
        }
        frame(b'P', &body)
    }
}

/// Bind ('B'). Parameters go out binary, results come back binary.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [Value],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, self.portal);
        put_cstring(&mut body, self.statement);

        // A single format code applies to every parameter
        body.put_i16(1);
        body.put_i16(Format::Binary as i16);

        body.put_i16(self.params.len() as i16);
        for param in self.params {
            if param.is_null() {
                body.put_i32(-1);
            } else {
                let encoded = param.encode_binary();
                body.put_i32(encoded.len() as i32);
                body.put_slice(&encoded);
            }
        }

        body.put_i16(1);
        body.put_i16(Format::Binary as i16);
        frame(b'B', &body)
    }
}

/// Describe ('D') of a statement (`S`) or portal (`P`).
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(self.kind);
        put_cstring(&mut body, &self.name);
        frame(b'D', &body)
    }
}

/// Execute ('E') a bound portal.
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.portal);
        body.put_i32(self.max_rows);
        frame(b'E', &body)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        frame(b'S', &[])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        frame(b'X', &[])
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },
    NotificationResponse { process_id: i32, channel: String, payload: String },
}

impl BackendMessage {
    /// Decode one complete frame, starting at the tag byte.
    pub fn decode(buf: &mut Bytes) -> DriverResult<Self> {
        need(buf, 5)?;
        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        if len < 4 {
            return Err(DriverError::Protocol(format!("Invalid frame length {}", len)));
        }
        let len = len as usize - 4;
        need(buf, len)?;
        let mut body = buf.split_to(len);

        let msg = match msg_type {
            b'R' => Self::decode_auth(body)?,
            b'T' => Self::decode_row_description(body)?,
            b'D' => Self::decode_data_row(body)?,
            b'C' => BackendMessage::CommandComplete {
                tag: read_cstring(&mut body)?,
            },
            b'Z' => {
                need(&body, 1)?;
                BackendMessage::ReadyForQuery {
                    status: TransactionStatus::from_indicator(body.get_u8()),
                }
            }
            b'E' => BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: read_cstring(&mut body)?,
                value: read_cstring(&mut body)?,
            },
            b'K' => {
                need(&body, 8)?;
                BackendMessage::BackendKeyData {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                }
            }
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => {
                need(&body, 2)?;
                let count = body.get_i16().max(0) as usize;
                need(&body, count * 4)?;
                let type_oids = (0..count).map(|_| Oid::from_i32(body.get_i32())).collect();
                BackendMessage::ParameterDescription { type_oids }
            }
            b'A' => {
                need(&body, 4)?;
                BackendMessage::NotificationResponse {
                    process_id: body.get_i32(),
                    channel: read_cstring(&mut body)?,
                    payload: read_cstring(&mut body)?,
                }
            }
            _ => {
                return Err(DriverError::Protocol(format!(
                    "Unknown message type: {}",
                    msg_type as char
                )))
            }
        };

        Ok(msg)
    }

    fn decode_auth(mut body: Bytes) -> DriverResult<Self> {
        need(&body, 4)?;
        let auth_type = body.get_i32();

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                need(&body, 4)?;
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
            _ => Err(DriverError::Auth(format!(
                "Unsupported authentication method: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> DriverResult<Self> {
        need(&body, 2)?;
        let num_fields = body.get_i16().max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            need(&body, 18)?;
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

    fn decode_data_row(mut body: Bytes) -> DriverResult<Self> {
        need(&body, 2)?;
        let num_cols = body.get_i16().max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            need(&body, 4)?;
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                need(&body, len as usize)?;
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }
}

/// Build the error for an ErrorResponse.
pub fn server_error(fields: &HashMap<u8, String>) -> DriverError {
    DriverError::Server(ServerError {
        severity: fields.get(&b'S').cloned().unwrap_or_default(),
        code: fields.get(&b'C').cloned().unwrap_or_default(),
        message: fields.get(&b'M').cloned().unwrap_or_default(),
        detail: fields.get(&b'D').cloned(),
        hint: fields.get(&b'H').cloned(),
    })
}

// ============================================================================
// Helper Functions
// ============================================================================

fn need(buf: &Bytes, n: usize) -> DriverResult<()> {
    if buf.remaining() < n {
        return Err(DriverError::Protocol(format!(
            "Truncated message: need {} bytes, have {}",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn read_cstring(buf: &mut Bytes) -> DriverResult<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| DriverError::Protocol("Missing null terminator in string".to_string()))?;

    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(s)
}

fn read_error_fields(mut body: Bytes) -> DriverResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        fields.insert(field_type, read_cstring(&mut body)?);
    }

    Ok(fields)
}
