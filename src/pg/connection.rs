//! PostgreSQL connection implementation.
//!
//! This module provides the async connection the blocking [`PgHandle`](super::PgHandle)
//! drives. It handles:
//! - TCP connection establishment
//! - Startup and authentication (cleartext, MD5, SCRAM-SHA-256)
//! - Simple and extended query protocols
//! - Tracking of the server-reported transaction status

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

use super::protocol::*;
use super::scram::{md5_password, ScramClient};
use super::types::{Oid, Value};
use crate::config::ConnectTarget;
use crate::driver::{DriverError, DriverResult, QueryResult, TransactionStatus};
use crate::escape;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;

/// A PostgreSQL connection.
pub struct PgConnection {
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,
    /// Status from the most recent ReadyForQuery
    transaction_status: TransactionStatus,
    backend_pid: i32,
    /// Server parameters (e.g., server_version, standard_conforming_strings)
    parameters: HashMap<String, String>,
    closed: bool,
    read_buffer: BytesMut,
}

impl PgConnection {
    /// Open a fresh connection and authenticate.
    pub async fn connect(target: &ConnectTarget) -> DriverResult<Self> {
        let host = target.host().unwrap_or(DEFAULT_HOST);
        let port = target.port().unwrap_or(DEFAULT_PORT);
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            transaction_status: TransactionStatus::Unknown,
            backend_pid: 0,
            parameters: HashMap::new(),
            closed: false,
            read_buffer: BytesMut::with_capacity(8192),
        };

        conn.startup(target).await?;
        Ok(conn)
    }

    async fn startup(&mut self, target: &ConnectTarget) -> DriverResult<()> {
        let startup = StartupMessage {
            user: target.user().to_string(),
            database: target.database().to_string(),
            options: vec![("application_name".to_string(), "pgsession".to_string())],
        };
        self.send_message(&startup).await?;

        let password = || {
            target
                .password()
                .ok_or_else(|| DriverError::Auth("Password required".to_string()))
        };

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let msg = PasswordMessage {
                        password: password()?.to_string(),
                    };
                    self.send_message(&msg).await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let msg = PasswordMessage {
                        password: md5_password(target.user(), password()?, &salt),
                    };
                    self.send_message(&msg).await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                        return Err(DriverError::Auth(format!(
                            "Server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    self.authenticate_scram(target.user(), password()?).await?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData { process_id, .. } => {
                    self.backend_pid = process_id;
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(server_error(&fields));
                }
                _ => {}
            }
        }
    }

    async fn authenticate_scram(&mut self, user: &str, password: &str) -> DriverResult<()> {
        let mut scram = ScramClient::new(user, password);
        let initial = SaslInitialResponseMessage {
            mechanism: "SCRAM-SHA-256".to_string(),
            data: scram.client_first_message(),
        };
        self.send_message(&initial).await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let data = scram
                        .process_server_first(&data)
                        .map_err(|e| DriverError::Auth(e.to_string()))?;
                    self.send_message(&SaslResponseMessage { data }).await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    return scram
                        .verify_server_final(&data)
                        .map_err(|e| DriverError::Auth(e.to_string()));
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(server_error(&fields));
                }
                _ => {}
            }
        }
    }

    /// Simple query protocol; one result per statement in `query`.
    pub async fn simple_query(&mut self, query: &str) -> DriverResult<Vec<QueryResult>> {
        self.ensure_open()?;
        self.transaction_status = TransactionStatus::Active;
        self.send_message(&QueryMessage {
            query: query.to_string(),
        })
        .await?;

        let mut results = Vec::new();
        let mut current = QueryResult::new();
        let mut failure = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription { fields } => {
                    current.columns = Arc::new(fields);
                }
                BackendMessage::DataRow { values } => {
                    let row = decode_row(&values, &current.columns, Value::decode_text)?;
                    current.rows.push(row);
                }
                BackendMessage::CommandComplete { tag } => {
                    current.command_tag = tag;
                    results.push(std::mem::take(&mut current));
                }
                BackendMessage::EmptyQueryResponse => {
                    results.push(QueryResult::new());
                }
                BackendMessage::ErrorResponse { fields } => {
                    // Keep reading: the server still sends ReadyForQuery
                    failure = Some(server_error(&fields));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return match failure {
                        Some(err) => Err(err),
                        None => Ok(results),
                    };
                }
                _ => {}
            }
        }
    }

    /// Run one statement through the unnamed statement and portal.
    pub async fn query_params(&mut self, query: &str, params: &[Value]) -> DriverResult<QueryResult> {
        self.ensure_open()?;
        check_param_count(params.len())?;
        let parse = ParseMessage {
            name: String::new(),
            query: query.to_string(),
            param_types: params.iter().map(Value::type_oid).collect(),
        };
        self.buffer_message(&parse).await?;
        self.bind_and_execute("", params).await
    }

    /// Create a named prepared statement.
    pub async fn prepare(&mut self, name: &str, query: &str, param_types: &[Oid]) -> DriverResult<()> {
        self.ensure_open()?;
        check_param_count(param_types.len())?;
        let parse = ParseMessage {
            name: name.to_string(),
            query: query.to_string(),
            param_types: param_types.to_vec(),
        };
        self.buffer_message(&parse).await?;
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;

        let mut failure = None;
        loop {
            match self.receive_message().await? {
                BackendMessage::ErrorResponse { fields } => {
                    failure = Some(server_error(&fields));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return match failure {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
                _ => {}
            }
        }
    }

    /// Execute a named prepared statement.
    pub async fn execute(&mut self, name: &str, params: &[Value]) -> DriverResult<QueryResult> {
        self.ensure_open()?;
        check_param_count(params.len())?;
        self.bind_and_execute(name, params).await
    }

    /// Bind + Describe portal + Execute + Sync in one flush.
    async fn bind_and_execute(&mut self, statement: &str, params: &[Value]) -> DriverResult<QueryResult> {
        let bind = BindMessage {
            portal: "",
            statement,
            params,
        };
        self.buffer_message(&bind).await?;
        let describe = DescribeMessage {
            kind: b'P',
            name: String::new(),
        };
        self.buffer_message(&describe).await?;
        let execute = ExecuteMessage {
            portal: String::new(),
            max_rows: 0,
        };
        self.buffer_message(&execute).await?;
        self.buffer_message(&SyncMessage).await?;
        self.transaction_status = TransactionStatus::Active;
        self.flush().await?;

        let mut result = QueryResult::new();
        let mut failure = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription { fields } => {
                    result.columns = Arc::new(fields);
                }
                BackendMessage::DataRow { values } => {
                    let row = decode_row(&values, &result.columns, Value::decode_binary)?;
                    result.rows.push(row);
                }
                BackendMessage::CommandComplete { tag } => {
                    result.command_tag = tag;
                }
                BackendMessage::ErrorResponse { fields } => {
                    failure = Some(server_error(&fields));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return match failure {
                        Some(err) => Err(err),
                        None => Ok(result),
                    };
                }
                _ => {}
            }
        }
    }

    /// Send Terminate. Idempotent.
    pub async fn close(&mut self) -> DriverResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.transaction_status = TransactionStatus::Unknown;
        self.send_message(&TerminateMessage).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        if self.closed {
            TransactionStatus::Unknown
        } else {
            self.transaction_status
        }
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    /// Whether the server treats backslashes in '...' literally. Servers
    /// that never reported the setting are assumed to be conforming.
    pub fn standard_conforming_strings(&self) -> bool {
        self.parameter("standard_conforming_strings") != Some("off")
    }

    pub fn escape_identifier(&self, ident: &str) -> String {
        escape::quote_identifier(ident)
    }

    pub fn escape_literal(&self, literal: &str) -> String {
        escape::quote_literal(literal)
    }

    pub fn escape_string(&self, value: &str) -> String {
        escape::escape_string(value, self.standard_conforming_strings())
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    async fn send_message<M: FrontendMessage>(&mut self, msg: &M) -> DriverResult<()> {
        self.buffer_message(msg).await?;
        self.flush().await
    }

    async fn buffer_message<M: FrontendMessage>(&mut self, msg: &M) -> DriverResult<()> {
        let encoded = msg.encode();
        let written = self.writer.write_all(&encoded).await;
        written.map_err(|e| self.broken(e))
    }

    async fn flush(&mut self) -> DriverResult<()> {
        let flushed = self.writer.flush().await;
        flushed.map_err(|e| self.broken(e))
    }

    /// An I/O failure leaves the stream unusable.
    fn broken(&mut self, e: std::io::Error) -> DriverError {
        self.closed = true;
        DriverError::Io(e)
    }

    async fn receive_message(&mut self) -> DriverResult<BackendMessage> {
        loop {
            if self.read_buffer.len() >= 5 {
                let length = i32::from_be_bytes([
                    self.read_buffer[1],
                    self.read_buffer[2],
                    self.read_buffer[3],
                    self.read_buffer[4],
                ]);
                if length < 4 {
                    self.closed = true;
                    return Err(DriverError::Protocol(format!("Invalid frame length {}", length)));
                }

                // type byte + length field value (includes the length field itself)
                let total_len = 1 + length as usize;
                if self.read_buffer.len() >= total_len {
                    let mut frame = self.read_buffer.split_to(total_len).freeze();
                    return BackendMessage::decode(&mut frame);
                }
            }

            let mut buf = [0u8; 4096];
            let read = self.reader.read(&mut buf).await;
            let n = read.map_err(|e| self.broken(e))?;
            if n == 0 {
                self.closed = true;
                return Err(DriverError::Closed);
            }
            self.read_buffer.extend_from_slice(&buf[..n]);
        }
    }
}

fn decode_row(
    values: &[Option<Bytes>],
    columns: &[FieldDescription],
    decode: fn(Oid, &[u8]) -> DriverResult<Value>,
) -> DriverResult<Vec<Value>> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| match value {
            Some(data) => {
                let oid = columns.get(i).map_or(Oid::TEXT, |c| c.type_oid);
                decode(oid, data)
            }
            None => Ok(Value::Null),
        })
        .collect()
}
