//! MySQL connection implementation.
//!
//! A [`Connection`] owns one blocking TCP socket and drives the protocol
//! state machine over it:
//!
//! ```text
//! CONNECTING --connect()--> CONNECTED --close()--> CLOSING --> CLOSED
//!      \____________ failure / timeout / IO error ___________/
//! ```
//!
//! CLOSED is terminal. Every packet read is bounded by the configured
//! timeout; when it elapses the socket is shut down and the pending call
//! fails with [`Error::ResponseTimeout`]. A [`CloseHandle`] aborts a
//! pending read from another thread the same way, reported as
//! [`Error::Read`].

use std::io::{self, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mywire_core::{
    ColumnInfo, ConnectionError, ConnectionErrorKind, Error, ReadError, ResponseTimeoutError,
    Result, Value,
};

use crate::auth::{self, plugins};
use crate::config::ClientConfig;
use crate::protocol::handshake::{AUTH_MORE_DATA_MARKER, AUTH_SWITCH_MARKER};
use crate::protocol::{
    AuthSwitchRequest, ByteCursor, Command, ExecuteResult, FieldInfo, HandshakePacket,
    HandshakeResponse, Packet, PacketKind, QueryResult, WriteResult, build_command, build_query,
    capabilities, charset, parse_err_packet, parse_field_info, parse_ok_packet, parse_text_row,
    read_packet, write_packet,
};
use crate::types::interpolate_params;
use crate::version::less_than_57;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, or handshake in progress
    Connecting,
    /// Ready for commands
    Connected,
    /// Shutting down
    Closing,
    /// Socket released; terminal
    Closed,
}

/// A client connection to a MySQL or MariaDB server.
pub struct Connection {
    config: Arc<ClientConfig>,
    state: ConnectionState,
    stream: Option<TcpStream>,
    /// Negotiated capability flags
    capabilities: u32,
    server_version: String,
    connection_id: u32,
    /// Set when a read deadline expired and the socket was shut down
    timed_out: bool,
    /// Shared with every [`CloseHandle`]; set when one of them fired
    aborted: Arc<AtomicBool>,
    /// Sequence number for the next packet written
    sequence_id: u8,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("connection_id", &self.connection_id)
            .field("server_version", &self.server_version)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .finish_non_exhaustive()
    }
}

/// Reader that bounds every socket read by a shared deadline.
///
/// On expiry it records the timeout and shuts the socket down, so the
/// caller can report a response timeout instead of a generic IO error.
struct DeadlineReader<'a> {
    stream: &'a TcpStream,
    deadline: Option<Instant>,
    timed_out: &'a mut bool,
}

impl DeadlineReader<'_> {
    fn expire(&mut self) -> io::Error {
        *self.timed_out = true;
        let _ = self.stream.shutdown(Shutdown::Both);
        io::Error::new(io::ErrorKind::TimedOut, "response timeout elapsed")
    }
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.expire());
            }
            self.stream.set_read_timeout(Some(remaining))?;
        }
        let mut stream = self.stream;
        match stream.read(buf) {
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Err(self.expire())
            }
            other => other,
        }
    }
}

impl Connection {
    /// Create an unconnected connection. Call [`connect`](Self::connect)
    /// before issuing commands.
    pub fn new(config: impl Into<Arc<ClientConfig>>) -> Self {
        Self {
            config: config.into(),
            state: ConnectionState::Connecting,
            stream: None,
            capabilities: 0,
            server_version: String::new(),
            connection_id: 0,
            timed_out: false,
            aborted: Arc::new(AtomicBool::new(false)),
            sequence_id: 0,
        }
    }

    /// Create a connection and connect it.
    pub fn open(config: impl Into<Arc<ClientConfig>>) -> Result<Self> {
        let mut conn = Self::new(config);
        conn.connect()?;
        Ok(conn)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Version string from the server handshake; empty before connecting.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Capability flags negotiated with the server.
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A handle that can close this connection from another thread.
    ///
    /// Only available once the socket is open.
    pub fn close_handle(&self) -> Result<CloseHandle> {
        let stream = self.stream.as_ref().ok_or_else(|| {
            Error::connection(ConnectionErrorKind::NotConnected, "must be connected first")
        })?;
        let stream = stream.try_clone().map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("Failed to clone socket for close handle: {e}"),
                source: Some(Box::new(e)),
            })
        })?;
        Ok(CloseHandle {
            stream: Arc::new(stream),
            aborted: Arc::clone(&self.aborted),
        })
    }

    /// Open the socket, run the handshake and authenticate.
    ///
    /// When a charset is configured, `SET NAMES` is issued before
    /// returning. Any failure leaves the connection CLOSED.
    pub fn connect(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connecting => {}
            ConnectionState::Connected => {
                return Err(Error::connection(
                    ConnectionErrorKind::AlreadyConnected,
                    "already connected",
                ));
            }
            ConnectionState::Closing => {
                return Err(Error::connection(
                    ConnectionErrorKind::NotConnected,
                    "must be connected first",
                ));
            }
            ConnectionState::Closed => {
                return Err(Error::connection(
                    ConnectionErrorKind::Closed,
                    "connection is closed",
                ));
            }
        }

        if let Err(e) = self.handshake() {
            self.terminate();
            return Err(e);
        }
        self.state = ConnectionState::Connected;
        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            server_version = %self.server_version,
            connection_id = self.connection_id,
            "Connected to MySQL server"
        );

        if let Some(charset) = self.config.charset.clone() {
            if let Err(e) = self.execute(&format!("SET NAMES {charset}"), &[]) {
                tracing::error!(
                    charset = %charset,
                    error = %e,
                    "Failed to apply connection charset"
                );
                self.terminate();
                return Err(e);
            }
        }
        Ok(())
    }

    fn handshake(&mut self) -> Result<()> {
        self.stream = Some(self.open_socket()?);

        let packet = self.read_server_packet()?;
        if packet.kind == PacketKind::Err {
            let err = parse_err_packet(&packet.payload)?;
            tracing::error!(code = err.code, message = %err.message, "Server refused connection");
            return Err(Error::Server(err));
        }
        let handshake = HandshakePacket::parse(&packet.payload)?;
        tracing::debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            auth_plugin = %handshake.auth_plugin,
            "Received handshake"
        );

        let mut flags = capabilities::DEFAULT_CLIENT_FLAGS;
        if self.config.database.is_some() {
            flags |= capabilities::CLIENT_CONNECT_WITH_DB;
        }
        flags &= handshake.capabilities;
        if flags & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::connection(
                ConnectionErrorKind::Connect,
                format!(
                    "server {} does not support protocol 4.1",
                    handshake.server_version
                ),
            ));
        }

        let scramble =
            auth::mysql_native_password(self.config.password_str(), &handshake.auth_seed);
        let response = HandshakeResponse {
            capabilities: flags,
            max_packet_size: self.config.max_packet_size,
            collation: charset::HANDSHAKE_COLLATION,
            username: &self.config.user,
            auth_response: &scramble,
            database: self.config.database.as_deref(),
            auth_plugin: plugins::MYSQL_NATIVE_PASSWORD,
        }
        .encode();
        self.write_payload(&response)?;

        self.capabilities = flags;
        self.server_version = handshake.server_version;
        self.connection_id = handshake.connection_id;

        self.read_auth_result()
    }

    fn open_socket(&self) -> Result<TcpStream> {
        let addrs = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| self.connect_error(e))?;

        let mut last_err = None;
        for addr in addrs {
            let attempt = if self.config.connect_timeout.is_zero() {
                TcpStream::connect(addr)
            } else {
                TcpStream::connect_timeout(&addr, self.config.connect_timeout)
            };
            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(self.connect_error(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        })))
    }

    fn connect_error(&self, e: io::Error) -> Error {
        let kind = if e.kind() == io::ErrorKind::ConnectionRefused {
            ConnectionErrorKind::Refused
        } else {
            ConnectionErrorKind::Connect
        };
        Error::Connection(ConnectionError {
            kind,
            message: format!("Failed to connect to {}: {}", self.config.socket_addr(), e),
            source: Some(Box::new(e)),
        })
    }

    /// Read the server's verdict on the handshake response, following a
    /// native-password auth switch if requested.
    fn read_auth_result(&mut self) -> Result<()> {
        loop {
            let packet = self.read_server_packet()?;
            match packet.kind {
                PacketKind::Ok => return Ok(()),
                PacketKind::Err => {
                    let err = parse_err_packet(&packet.payload)?;
                    tracing::error!(
                        code = err.code,
                        message = %err.message,
                        user = %self.config.user,
                        "Authentication failed"
                    );
                    return Err(Error::Server(err));
                }
                PacketKind::Eof | PacketKind::Data => {}
            }

            match packet.payload.first().copied() {
                Some(AUTH_SWITCH_MARKER) => {
                    let switch = AuthSwitchRequest::parse(&packet.payload)?;
                    if switch.plugin != plugins::MYSQL_NATIVE_PASSWORD {
                        return Err(unsupported_auth(&switch.plugin));
                    }
                    tracing::debug!("Server requested auth switch to mysql_native_password");
                    let scramble =
                        auth::mysql_native_password(self.config.password_str(), &switch.seed);
                    self.write_payload(&scramble)?;
                }
                Some(AUTH_MORE_DATA_MARKER) => {
                    return Err(unsupported_auth(plugins::CACHING_SHA2_PASSWORD));
                }
                other => {
                    return Err(Error::decode(format!(
                        "unexpected authentication reply with leading byte {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// Execute SQL text and return the full result.
    ///
    /// `params` are interpolated into `sql` before sending. A server ERR
    /// leaves the connection usable; IO, decode and timeout failures close
    /// it.
    #[tracing::instrument(
        level = "debug",
        skip(self, params),
        fields(connection_id = self.connection_id)
    )]
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        self.ensure_connected()?;
        let sql = interpolate_params(sql, params);
        tracing::debug!(sql = %sql, "Executing query");

        self.send_command(&build_query(&sql))?;
        match self.read_query_response() {
            Ok(result) => {
                match &result {
                    ExecuteResult::Write(w) => tracing::debug!(
                        affected_rows = w.affected_rows,
                        last_insert_id = w.last_insert_id,
                        "Query OK"
                    ),
                    ExecuteResult::ResultSet { fields, rows } => tracing::debug!(
                        field_count = fields.len(),
                        row_count = rows.len(),
                        "Query returned result set"
                    ),
                }
                Ok(result)
            }
            Err(e @ Error::Server(_)) => {
                tracing::debug!(error = %e, "Query failed");
                Err(e)
            }
            Err(e) => {
                self.terminate();
                Err(e)
            }
        }
    }

    /// Execute SQL text, returning the rows of a result set or the write
    /// summary of a statement without one.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.execute(sql, params).map(QueryResult::from)
    }

    /// Check that the server is still answering.
    pub fn ping(&mut self) -> Result<()> {
        self.ensure_connected()?;
        self.send_command(&build_command(Command::Ping, &[]))?;
        let packet = self.read_server_packet()?;
        match packet.kind {
            PacketKind::Ok => Ok(()),
            PacketKind::Err => Err(Error::Server(parse_err_packet(&packet.payload)?)),
            PacketKind::Eof | PacketKind::Data => {
                self.terminate();
                Err(Error::decode("unexpected reply to COM_PING"))
            }
        }
    }

    /// Close the connection. Never fails and may be called repeatedly.
    ///
    /// A CONNECTED connection first tells the server it is leaving.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let was_connected =
            self.state == ConnectionState::Connected && !self.aborted.load(Ordering::Acquire);
        self.state = ConnectionState::Closing;
        if was_connected {
            if let Some(stream) = self.stream.as_mut() {
                let _ = write_packet(stream, &build_command(Command::Quit, &[]), 0);
            }
        }
        self.release_socket();
        self.state = ConnectionState::Closed;
        tracing::debug!(connection_id = self.connection_id, "Connection closed");
    }

    /// Close without saying goodbye; used on error paths.
    fn terminate(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        self.release_socket();
        self.state = ConnectionState::Closed;
    }

    fn release_socket(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            self.terminate();
        }
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(Error::connection(
                ConnectionErrorKind::Closed,
                "connection is closed",
            )),
            ConnectionState::Connecting | ConnectionState::Closing => Err(Error::connection(
                ConnectionErrorKind::NotConnected,
                "must be connected first",
            )),
        }
    }

    fn read_query_response(&mut self) -> Result<ExecuteResult> {
        let first = self.read_server_packet()?;
        match first.kind {
            PacketKind::Ok => {
                let ok = parse_ok_packet(&first.payload)?;
                Ok(ExecuteResult::Write(WriteResult {
                    affected_rows: ok.affected_rows,
                    last_insert_id: ok.last_insert_id,
                }))
            }
            PacketKind::Err => Err(Error::Server(parse_err_packet(&first.payload)?)),
            PacketKind::Eof => Err(
                Error::decode("unexpected EOF packet in place of a result")
                    .with_raw_data(&first.payload),
            ),
            PacketKind::Data => self.read_result_set(&first.payload),
        }
    }

    fn read_result_set(&mut self, header: &[u8]) -> Result<ExecuteResult> {
        if header.first() == Some(&0xFB) {
            return Err(
                Error::decode("LOCAL INFILE requests are not supported").with_raw_data(header),
            );
        }
        let column_count = ByteCursor::new(header).read_encoded_len()?;
        let column_count = usize::try_from(column_count)
            .map_err(|_| Error::decode(format!("invalid column count {column_count}")))?;

        let mut fields: Vec<FieldInfo> = Vec::with_capacity(column_count.min(4096));
        for _ in 0..column_count {
            let packet = self.read_server_packet()?;
            let field = parse_field_info(&packet.payload)
                .map_err(|e| e.with_raw_data(&packet.payload))?;
            fields.push(field);
        }

        let mut pending = self.read_field_terminator()?;

        let columns = Arc::new(ColumnInfo::new(
            fields.iter().map(|f| f.name.clone()).collect(),
        ));
        let mut rows = Vec::new();
        loop {
            let packet = match pending.take() {
                Some(packet) => packet,
                None => self.read_server_packet()?,
            };
            match packet.kind {
                PacketKind::Eof => break,
                PacketKind::Err => return Err(Error::Server(parse_err_packet(&packet.payload)?)),
                PacketKind::Ok | PacketKind::Data => {
                    let row = parse_text_row(&packet.payload, &fields, &columns)
                        .map_err(|e| e.with_raw_data(&packet.payload))?;
                    rows.push(row);
                }
            }
        }

        Ok(ExecuteResult::ResultSet { fields, rows })
    }

    /// Consume the EOF that legacy servers send after the column
    /// definitions.
    ///
    /// Without DEPRECATE_EOF the marker is always there. With it, only a
    /// pre-5.7 version string makes us look, and a packet that is not a
    /// bare EOF is handed back as the first row or terminator.
    fn read_field_terminator(&mut self) -> Result<Option<Packet>> {
        if self.capabilities & capabilities::CLIENT_DEPRECATE_EOF == 0 {
            let packet = self.read_server_packet()?;
            return match packet.kind {
                PacketKind::Eof => Ok(None),
                PacketKind::Err => Err(Error::Server(parse_err_packet(&packet.payload)?)),
                PacketKind::Ok | PacketKind::Data => Err(Error::decode(
                    "expected EOF packet after column definitions",
                )),
            };
        }
        if !less_than_57(&self.server_version) {
            return Ok(None);
        }
        let packet = self.read_server_packet()?;
        if is_bare_eof(&packet) {
            Ok(None)
        } else {
            Ok(Some(packet))
        }
    }

    fn send_command(&mut self, payload: &[u8]) -> Result<()> {
        self.sequence_id = 0;
        self.write_payload(payload)
    }

    fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            Error::connection(ConnectionErrorKind::NotConnected, "must be connected first")
        })?;
        match write_packet(stream, payload, self.sequence_id) {
            Ok(next) => {
                self.sequence_id = next;
                Ok(())
            }
            Err(e) => {
                self.terminate();
                Err(Error::Read(ReadError {
                    message: format!("Failed to write packet: {e}"),
                    source: Some(e),
                }))
            }
        }
    }

    /// Read one packet under the response timeout.
    ///
    /// Peer close, IO failure and timeout all close the connection.
    fn read_server_packet(&mut self) -> Result<Packet> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(Error::connection(
                ConnectionErrorKind::NotConnected,
                "must be connected first",
            ));
        };
        let timeout = self.config.timeout;
        let result = {
            let mut reader = DeadlineReader {
                stream,
                deadline: deadline_after(timeout),
                timed_out: &mut self.timed_out,
            };
            read_packet(&mut reader)
        };
        let _ = stream.set_read_timeout(None);

        match result {
            Ok(Some(packet)) => {
                self.sequence_id = packet.next_sequence();
                Ok(packet)
            }
            Ok(None) | Err(_) if self.aborted.load(Ordering::Acquire) => {
                tracing::debug!(
                    connection_id = self.connection_id,
                    "Pending read aborted by close handle"
                );
                self.terminate();
                Err(Error::Read(ReadError {
                    message: "Connection closed".to_string(),
                    source: None,
                }))
            }
            Ok(None) => {
                self.terminate();
                Err(Error::Read(ReadError {
                    message: "Connection closed by server".to_string(),
                    source: None,
                }))
            }
            Err(_) if self.timed_out => {
                tracing::warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    connection_id = self.connection_id,
                    "No response from server before timeout"
                );
                self.terminate();
                Err(Error::ResponseTimeout(ResponseTimeoutError { timeout }))
            }
            Err(e) => {
                self.terminate();
                Err(Error::Read(ReadError {
                    message: format!("Failed to read packet: {e}"),
                    source: Some(e),
                }))
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cloneable handle that closes a [`Connection`] from another thread.
///
/// Closing shuts the socket down, so a read blocked in `execute`, `query`
/// or `ping` fails with [`Error::Read`] and the connection ends CLOSED.
/// No COM_QUIT is sent.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    stream: Arc<TcpStream>,
    aborted: Arc<AtomicBool>,
}

impl CloseHandle {
    /// Shut the socket down. Never fails and may be called repeatedly.
    pub fn close(&self) {
        self.aborted.store(true, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn is_closed(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// An EOF packet in the pre-DEPRECATE_EOF layout: marker, warnings and
/// status, nothing more.
fn is_bare_eof(packet: &Packet) -> bool {
    packet.kind == PacketKind::Eof && packet.payload.len() <= 5
}

/// A zero timeout disables the deadline.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Instant::now().checked_add(timeout)
    }
}

fn unsupported_auth(plugin: &str) -> Error {
    Error::connection(
        ConnectionErrorKind::UnsupportedAuth,
        format!("authentication plugin '{plugin}' is not supported"),
    )
}
