//! PostgreSQL connection implementation.
//!
//! This module provides the connection type that handles:
//! - TCP connection establishment and the startup handshake
//! - Cleartext, MD5 and SCRAM-SHA-256 authentication
//! - Statement preparation (Parse + Describe + Sync)
//! - Raw socket access for pre-built request buffers
//!
//! All I/O is blocking and unbuffered on the write side. The connection is
//! used by one caller at a time; every method takes `&mut self`.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use super::config::PgConfig;
use super::error::{ConnectError, PgError, PgResult};
use super::protocol::*;
use super::scanner::ResponseScanner;
use super::scram::{self, ScramClient};
use super::statement::{PreparedStatement, StatementRegistry};

/// Bytes pulled from the socket per read while decoding whole messages.
const READ_CHUNK: usize = 4096;

/// A PostgreSQL connection.
pub struct PgConnection {
    stream: TcpStream,
    statements: StatementRegistry,
    protocol_version: i32,
    transaction_status: TransactionStatus,
    backend_pid: i32,
    backend_secret_key: i32,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    closed: bool,
    /// Set by the first I/O or protocol failure
    broken: bool,
    /// Partial messages read during handshake, prepare and simple queries.
    /// Always empty once control returns to the caller.
    read_buffer: BytesMut,
}

/// Position in the prepare reply sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrepareStep {
    ParseComplete,
    ParameterDescription,
    RowDescription,
    ReadyForQuery,
}

impl PgConnection {
    /// Connect using a `postgresql://` URL.
    pub fn connect_url(url: &str) -> PgResult<Self> {
        let config = PgConfig::from_url(url)?;
        Self::connect(&config)
    }

    /// Connect and authenticate. Returns once the backend reports
    /// ReadyForQuery.
    pub fn connect(config: &PgConfig) -> PgResult<Self> {
        let addr = config.addr();
        let stream = TcpStream::connect(&addr).map_err(|source| ConnectError::Dial {
            addr: addr.clone(),
            source,
        })?;
        stream.set_nodelay(true).map_err(ConnectError::Io)?;

        let mut conn = Self {
            stream,
            statements: StatementRegistry::new(),
            protocol_version: PROTOCOL_VERSION,
            transaction_status: TransactionStatus::Idle,
            backend_pid: 0,
            backend_secret_key: 0,
            parameters: HashMap::new(),
            closed: false,
            broken: false,
            read_buffer: BytesMut::with_capacity(READ_CHUNK),
        };

        conn.startup(config).map_err(|e| {
            let _ = conn.stream.shutdown(Shutdown::Both);
            PgError::Connection(match e {
                PgError::Connection(c) => c,
                PgError::Io(e) | PgError::Read(e) => ConnectError::Io(e),
                other => ConnectError::Malformed(other.to_string()),
            })
        })?;

        debug!(
            addr = %addr,
            backend_pid = conn.backend_pid,
            server_version = conn.parameter("server_version").unwrap_or("?"),
            "connected"
        );
        Ok(conn)
    }

    /// Send the startup message and run authentication until ReadyForQuery.
    fn startup(&mut self, config: &PgConfig) -> PgResult<()> {
        let options: Vec<(&str, &str)> = config
            .application_name
            .as_deref()
            .map(|name| vec![("application_name", name)])
            .unwrap_or_default();

        self.send(&StartupMessage {
            user: &config.user,
            database: Some(&config.database),
            options: &options,
        })?;

        let mut scram: Option<ScramClient> = None;

        loop {
            let msg = self.receive_message()?;
            trace!(tag = %msg.tag(), "startup");

            match msg {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = require_password(config)?;
                    self.send(&PasswordMessage { password })?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let hash = md5_password(&config.user, require_password(config)?, &salt);
                    self.send(&PasswordMessage { password: &hash })?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                        return Err(ConnectError::Auth(format!(
                            "server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        ))
                        .into());
                    }
                    let client = ScramClient::new(&config.user, require_password(config)?);
                    self.send(&SaslInitialResponseMessage {
                        mechanism: scram::MECHANISM,
                        data: &client.client_first_message(),
                    })?;
                    scram = Some(client);
                }
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client = scram
                        .as_mut()
                        .ok_or(ConnectError::UnexpectedMessage('R'))?;
                    let client_final = client
                        .process_server_first(&data)
                        .map_err(|e| ConnectError::Auth(e.to_string()))?;
                    self.send(&SaslResponseMessage {
                        data: &client_final,
                    })?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    scram
                        .as_mut()
                        .ok_or(ConnectError::UnexpectedMessage('R'))?
                        .verify_server_final(&data)
                        .map_err(|e| ConnectError::Auth(e.to_string()))?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.backend_pid = process_id;
                    self.backend_secret_key = secret_key;
                }
                BackendMessage::NoticeResponse { fields } => log_notice(&fields),
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return self.expect_drained();
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(ConnectError::Rejected(server_error(&fields)).into());
                }
                other => return Err(ConnectError::UnexpectedMessage(other.tag()).into()),
            }
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Prepare `query` under `name`, letting the backend infer parameter
    /// types, and cache its parameter and result metadata.
    ///
    /// A rejected statement leaves the registry unchanged and the connection
    /// usable.
    pub fn prepare(&mut self, name: &str, query: &str) -> PgResult<Arc<PreparedStatement>> {
        self.ensure_usable()?;
        if self.statements.contains(name) {
            return Err(PgError::DuplicateStatement(name.to_string()));
        }

        let result = self.prepare_inner(name, query);
        let stmt = self.track(result)?;
        debug!(
            statement = name,
            params = stmt.param_count(),
            columns = stmt.columns.len(),
            "prepared"
        );
        self.statements.insert(stmt)
    }

    fn prepare_inner(&mut self, name: &str, query: &str) -> PgResult<PreparedStatement> {
        let mut buf = BytesMut::new();
        ParseMessage {
            name,
            query,
            param_types: &[],
        }
        .encode(&mut buf);
        DescribeMessage { kind: b'S', name }.encode(&mut buf);
        SyncMessage.encode(&mut buf);
        self.stream.write_all(&buf)?;

        let mut stmt = PreparedStatement::new(name, query);
        let mut step = PrepareStep::ParseComplete;

        loop {
            let msg = self.receive_message()?;
            trace!(tag = %msg.tag(), ?step, "prepare");

            match (step, msg) {
                (_, BackendMessage::NoticeResponse { fields }) => log_notice(&fields),
                (_, BackendMessage::ParameterStatus { name, value }) => {
                    self.parameters.insert(name, value);
                }
                (_, BackendMessage::ErrorResponse { fields }) => {
                    let source = server_error(&fields);
                    self.drain_until_ready()?;
                    return Err(PgError::Prepare {
                        name: name.to_string(),
                        source,
                    });
                }
                (PrepareStep::ParseComplete, BackendMessage::ParseComplete) => {
                    step = PrepareStep::ParameterDescription;
                }
                (
                    PrepareStep::ParameterDescription,
                    BackendMessage::ParameterDescription { type_oids },
                ) => {
                    stmt.param_types = type_oids;
                    step = PrepareStep::RowDescription;
                }
                (PrepareStep::RowDescription, BackendMessage::RowDescription { fields }) => {
                    stmt.columns = fields;
                    step = PrepareStep::ReadyForQuery;
                }
                (PrepareStep::RowDescription, BackendMessage::NoData) => {
                    step = PrepareStep::ReadyForQuery;
                }
                (PrepareStep::ReadyForQuery, BackendMessage::ReadyForQuery { status }) => {
                    self.transaction_status = status;
                    self.expect_drained()?;
                    return Ok(stmt);
                }
                (step, other) => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message '{}' while waiting for {:?}",
                        other.tag(),
                        step
                    )))
                }
            }
        }
    }

    /// Look up a statement prepared on this connection.
    pub fn statement(&self, name: &str) -> Option<Arc<PreparedStatement>> {
        self.statements.get(name)
    }

    pub fn statements(&self) -> &StatementRegistry {
        &self.statements
    }

    // ========================================================================
    // Simple query (setup only)
    // ========================================================================

    /// Run one or more statements with the simple query protocol and return
    /// their command tags. Rows are discarded.
    ///
    /// Meant for schema setup, not for measured work.
    pub fn simple_query(&mut self, sql: &str) -> PgResult<Vec<String>> {
        self.ensure_usable()?;
        let result = self.simple_query_inner(sql);
        self.track(result)
    }

    fn simple_query_inner(&mut self, sql: &str) -> PgResult<Vec<String>> {
        self.send(&QueryMessage { query: sql })?;

        let mut tags = Vec::new();
        let mut error = None;

        loop {
            match self.receive_message()? {
                BackendMessage::RowDescription { .. }
                | BackendMessage::DataRow { .. }
                | BackendMessage::EmptyQueryResponse => {}
                BackendMessage::CommandComplete { tag } => tags.push(tag),
                BackendMessage::NoticeResponse { fields } => log_notice(&fields),
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::ErrorResponse { fields } => {
                    error.get_or_insert_with(|| server_error(&fields));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    self.expect_drained()?;
                    return match error {
                        Some(e) => Err(PgError::Server(e)),
                        None => Ok(tags),
                    };
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message '{}' in simple query response",
                        other.tag()
                    )))
                }
            }
        }
    }

    // ========================================================================
    // Raw socket access
    // ========================================================================

    /// The unbuffered socket, for writing pre-built buffers and reading
    /// replies directly.
    pub fn raw_socket(&mut self) -> PgResult<&mut TcpStream> {
        self.ensure_usable()?;
        Ok(&mut self.stream)
    }

    /// Write a pre-built request buffer with a single `write_all`.
    pub fn send_query_buf(&mut self, buf: &[u8]) -> PgResult<()> {
        self.ensure_usable()?;
        let result = self.stream.write_all(buf).map_err(PgError::Io);
        self.track(result)
    }

    /// Drain the reply to a previously sent buffer.
    pub fn read_until_ready(&mut self, scanner: &mut ResponseScanner) -> PgResult<TransactionStatus> {
        self.ensure_usable()?;
        let result = scanner.read_until_ready(&mut self.stream);
        let status = self.track(result)?;
        self.transaction_status = status;
        Ok(status)
    }

    // ========================================================================
    // Lifecycle and state
    // ========================================================================

    /// Send Terminate and shut the socket down. Calling it again is a no-op.
    pub fn close(&mut self) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = if self.broken {
            Ok(())
        } else {
            self.stream
                .write_all(&TerminateMessage.to_bytes())
                .map_err(PgError::Io)
        };
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                warn!(error = %e, "socket shutdown failed");
            }
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether an I/O or protocol failure has made this connection unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Secret key for CancelRequest.
    pub fn backend_secret_key(&self) -> i32 {
        self.backend_secret_key
    }

    /// Get a server parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn ensure_usable(&self) -> PgResult<()> {
        if self.closed || self.broken {
            return Err(PgError::ConnectionClosed);
        }
        Ok(())
    }

    /// Mark the connection broken if `result` carries a fatal error.
    fn track<T>(&mut self, result: PgResult<T>) -> PgResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                warn!(error = %e, "connection is no longer usable");
                self.broken = true;
            }
        }
        result
    }

    fn send<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        self.stream.write_all(&msg.to_bytes())?;
        Ok(())
    }

    /// Receive one complete backend message.
    fn receive_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            if self.read_buffer.len() >= HEADER_LEN {
                let length = i32::from_be_bytes([
                    self.read_buffer[1],
                    self.read_buffer[2],
                    self.read_buffer[3],
                    self.read_buffer[4],
                ]);
                if length < 4 || length as usize > MAX_MESSAGE_LEN {
                    return Err(PgError::Protocol(format!(
                        "invalid length {} for message '{}'",
                        length, self.read_buffer[0] as char
                    )));
                }

                // type byte + length field value (includes length field itself)
                let total_len = 1 + length as usize;
                if self.read_buffer.len() >= total_len {
                    let mut frame = self.read_buffer.split_to(total_len).freeze();
                    return BackendMessage::decode(&mut frame);
                }
                self.read_buffer.reserve(total_len - self.read_buffer.len());
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(PgError::Read(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    )))
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PgError::Read(e)),
            };
            self.read_buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Skip messages until ReadyForQuery (after an ErrorResponse).
    fn drain_until_ready(&mut self) -> PgResult<()> {
        loop {
            if let BackendMessage::ReadyForQuery { status } = self.receive_message()? {
                self.transaction_status = status;
                return self.expect_drained();
            }
        }
    }

    /// Nothing may follow ReadyForQuery: the backend only speaks when asked.
    fn expect_drained(&self) -> PgResult<()> {
        if !self.read_buffer.is_empty() {
            return Err(PgError::Protocol(format!(
                "{} unexpected bytes after ReadyForQuery",
                self.read_buffer.len()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn require_password(config: &PgConfig) -> Result<&str, ConnectError> {
    config
        .password
        .as_deref()
        .ok_or_else(|| ConnectError::Auth("password required".to_string()))
}

/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer = format!("{:x}", inner).into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer))
}

fn log_notice(fields: &HashMap<u8, String>) {
    let notice = server_error(fields);
    warn!(severity = %notice.severity, code = %notice.code, "{}", notice.message);
}
