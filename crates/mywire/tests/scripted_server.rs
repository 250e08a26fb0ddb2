//! End-to-end tests against an in-process scripted MySQL server.
//!
//! Each test binds a listener on an ephemeral port and plays the server
//! side of the conversation on a background thread, asserting on what the
//! client sends.

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mywire::auth::mysql_native_password;
use mywire::protocol::{ByteCursor, Packet, PacketWriter, capabilities, read_packet, write_packet};
use mywire::{
    ClientConfig, Connection, ConnectionErrorKind, ConnectionState, Error, ExecuteResult,
    FieldType, QueryResult, Value,
};

const SEED: [u8; 20] = *b"0123456789ABCDEFGHIJ";
const PASSWORD: &str = "secret";

fn modern_caps() -> u32 {
    capabilities::DEFAULT_CLIENT_FLAGS | capabilities::CLIENT_CONNECT_WITH_DB
}

fn legacy_caps() -> u32 {
    modern_caps() & !capabilities::CLIENT_DEPRECATE_EOF
}

// ==================== Server payload builders ====================

fn handshake(version: &str, caps: u32) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string(version);
    w.write_u32_le(4242);
    w.write_bytes(&SEED[..8]);
    w.write_u8(0);
    w.write_u16_le((caps & 0xFFFF) as u16);
    w.write_u8(45);
    w.write_u16_le(0x0002);
    w.write_u16_le((caps >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&SEED[8..]);
    w.write_u8(0);
    w.write_null_string("mysql_native_password");
    w.into_bytes()
}

fn ok(affected_rows: u64, last_insert_id: u64) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(affected_rows);
    w.write_lenenc_int(last_insert_id);
    w.write_u16_le(0x0002);
    w.write_u16_le(0);
    w.into_bytes()
}

/// End-of-rows marker as sent with CLIENT_DEPRECATE_EOF (an OK with 0xFE).
fn ok_eof() -> Vec<u8> {
    vec![0xFE, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

fn eof() -> Vec<u8> {
    vec![0xFE, 0x00, 0x00, 0x02, 0x00]
}

fn err(code: u16, state: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(state.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

fn column_count(n: u64) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_int(n);
    w.into_bytes()
}

fn column(name: &str, field_type: FieldType) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for part in ["def", "shop", "t", "t", name, name] {
        w.write_lenenc_string(part);
    }
    w.write_lenenc_int(0x0c);
    w.write_u16_le(45);
    w.write_u32_le(255);
    w.write_u8(field_type as u8);
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

fn row(cells: &[Option<&str>]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for cell in cells {
        match cell {
            Some(text) => w.write_lenenc_string(text),
            None => w.write_u8(0xFB),
        }
    }
    w.into_bytes()
}

// ==================== Scripted peer ====================

struct Peer {
    stream: TcpStream,
}

impl Peer {
    fn send(&mut self, sequence_id: u8, payload: &[u8]) {
        write_packet(&mut self.stream, payload, sequence_id).expect("server write");
    }

    fn recv(&mut self) -> Packet {
        read_packet(&mut self.stream)
            .expect("server read")
            .expect("client hung up early")
    }

    /// Expect a COM_QUERY carrying `sql`.
    fn expect_query(&mut self, sql: &str) {
        let packet = self.recv();
        assert_eq!(packet.sequence_id, 0, "commands restart the sequence");
        assert_eq!(packet.payload[0], 0x03);
        assert_eq!(String::from_utf8_lossy(&packet.payload[1..]), sql);
    }

    /// Send the handshake and return the client's response.
    fn greet(&mut self, version: &str, caps: u32) -> Packet {
        self.send(0, &handshake(version, caps));
        let response = self.recv();
        assert_eq!(response.sequence_id, 1);
        response
    }

    /// Handshake followed by a successful auth OK.
    fn login(&mut self, version: &str, caps: u32) {
        self.greet(version, caps);
        self.send(2, &ok(0, 0));
    }

    /// Block until the client closes its end.
    fn wait_for_hangup(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}

fn spawn_server<F>(script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(&mut Peer) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut peer = Peer { stream };
        script(&mut peer);
    });
    (addr, handle)
}

fn config_for(addr: SocketAddr) -> ClientConfig {
    ClientConfig::new()
        .host("127.0.0.1")
        .port(addr.port())
        .user("app")
        .password(PASSWORD)
        .database("shop")
        .timeout(Duration::from_secs(5))
}

fn finish(handle: JoinHandle<()>) {
    handle.join().expect("server script panicked");
}

// ==================== Tests ====================

#[test]
fn connect_sends_native_password_response() {
    let (addr, server) = spawn_server(|peer| {
        let response = peer.greet("8.0.36", modern_caps());
        let mut cursor = ByteCursor::new(&response.payload);
        let flags = cursor.read_u32_le().unwrap();
        assert!(flags & capabilities::CLIENT_PROTOCOL_41 != 0);
        assert!(flags & capabilities::CLIENT_CONNECT_WITH_DB != 0);
        cursor.read_u32_le().unwrap();
        assert_eq!(cursor.read_u8().unwrap(), 33, "utf8_general_ci");
        cursor.skip(23).unwrap();
        assert_eq!(cursor.read_null_string(), "app");
        assert_eq!(
            cursor.read_lenenc_bytes().unwrap(),
            mysql_native_password(PASSWORD, &SEED).as_slice()
        );
        assert_eq!(cursor.read_null_string(), "shop");
        assert_eq!(cursor.read_null_string(), "mysql_native_password");
        peer.send(2, &ok(0, 0));

        let quit = peer.recv();
        assert_eq!(quit.payload, vec![0x01]);
    });

    let mut conn = Connection::new(config_for(addr));
    conn.connect().expect("connect");
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.server_version(), "8.0.36");
    assert_eq!(conn.connection_id(), 4242);
    assert!(conn.capabilities() & capabilities::CLIENT_DEPRECATE_EOF != 0);

    let err = conn.connect().unwrap_err();
    assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::AlreadyConnected));

    conn.close();
    assert_eq!(conn.state(), ConnectionState::Closed);
    finish(server);
}

#[test]
fn insert_returns_affected_rows_and_last_insert_id() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("8.0.36", modern_caps());
        peer.expect_query("INSERT INTO t (name) VALUES ('Alice')");
        peer.send(1, &ok(1, 42));
        peer.wait_for_hangup();
    });

    let mut conn = Connection::open(config_for(addr)).expect("connect");
    let result = conn
        .execute("INSERT INTO t (name) VALUES (?)", &[Value::Text("Alice".into())])
        .expect("insert");

    let write = result.write_result().expect("write result");
    assert_eq!(write.affected_rows, 1);
    assert_eq!(write.last_insert_id, 42);
    assert!(result.rows().is_none());
    assert!(result.fields().is_none());

    conn.close();
    finish(server);
}

#[test]
fn select_returns_fields_and_rows_in_server_order() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("8.0.36", modern_caps());
        peer.expect_query("SELECT a,b FROM t");
        peer.send(1, &column_count(2));
        peer.send(2, &column("a", FieldType::Long));
        peer.send(3, &column("b", FieldType::VarString));
        peer.send(4, &row(&[Some("1"), Some("first")]));
        peer.send(5, &row(&[Some("2"), None]));
        peer.send(6, &ok_eof());
        peer.wait_for_hangup();
    });

    let mut conn = Connection::open(config_for(addr)).expect("connect");
    let ExecuteResult::ResultSet { fields, rows } =
        conn.execute("SELECT a,b FROM t", &[]).expect("select")
    else {
        panic!("expected a result set");
    };

    let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["a", "b"]);
    assert_eq!(fields[0].column_type, FieldType::Long);

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get(0), Some(&Value::Int(1)));
    assert_eq!(rows[0].get(1), Some(&Value::Text("first".into())));
    assert_eq!(rows[1].get_by_name("a"), Some(&Value::Int(2)));
    assert_eq!(rows[1].get_by_name("b"), Some(&Value::Null));
    assert_eq!(rows[1].get_named::<i64>("a").unwrap(), 2);
    assert_eq!(conn.state(), ConnectionState::Connected);

    conn.close();
    finish(server);
}

#[test]
fn legacy_server_eof_after_fields_is_consumed() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("5.6.51-log", legacy_caps());
        peer.expect_query("SELECT a FROM t");
        peer.send(1, &column_count(1));
        peer.send(2, &column("a", FieldType::Long));
        peer.send(3, &eof());
        peer.send(4, &row(&[Some("7")]));
        peer.send(5, &eof());
        peer.wait_for_hangup();
    });

    let mut conn = Connection::open(config_for(addr)).expect("connect");
    let rows = conn.query("SELECT a FROM t", &[]).expect("select").into_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(&Value::Int(7)));

    conn.close();
    finish(server);
}

#[test]
fn mariadb_11_with_deprecate_eof_keeps_first_row() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("11.4.2-MariaDB", modern_caps());
        peer.expect_query("SELECT a FROM t");
        peer.send(1, &column_count(1));
        peer.send(2, &column("a", FieldType::Long));
        peer.send(3, &row(&[Some("1")]));
        peer.send(4, &row(&[Some("2")]));
        peer.send(5, &ok_eof());
        peer.wait_for_hangup();
    });

    let mut conn = Connection::open(config_for(addr)).expect("connect");
    let rows = conn.query("SELECT a FROM t", &[]).expect("select").into_rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get(0), Some(&Value::Int(1)));
    assert_eq!(rows[1].get(0), Some(&Value::Int(2)));

    conn.close();
    finish(server);
}

#[test]
fn mariadb_11_empty_result_ends_at_terminator() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("11.4.2-MariaDB", modern_caps());
        peer.expect_query("SELECT a FROM t WHERE 0");
        peer.send(1, &column_count(1));
        peer.send(2, &column("a", FieldType::Long));
        peer.send(3, &ok_eof());
        peer.wait_for_hangup();
    });

    let config = config_for(addr).timeout(Duration::from_secs(2));
    let mut conn = Connection::open(config).expect("connect");
    let result = conn.execute("SELECT a FROM t WHERE 0", &[]).expect("select");
    assert_eq!(result.fields().map(<[_]>::len), Some(1));
    assert_eq!(result.rows().map(<[_]>::len), Some(0));
    assert_eq!(conn.state(), ConnectionState::Connected);

    conn.close();
    finish(server);
}

#[test]
fn close_handle_aborts_pending_read() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("8.0.36", modern_caps());
        peer.expect_query("SELECT SLEEP(60)");
        peer.wait_for_hangup();
    });

    let mut conn = Connection::open(config_for(addr)).expect("connect");
    let handle = conn.close_handle().expect("close handle");
    let closer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.close();
        handle
    });

    let started = Instant::now();
    let e = conn.execute("SELECT SLEEP(60)", &[]).unwrap_err();
    assert!(matches!(e, Error::Read(_)), "expected read error, got {e:?}");
    assert!(!e.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(conn.state(), ConnectionState::Closed);

    let handle = closer.join().expect("closer thread");
    assert!(handle.is_closed());
    handle.close();

    let again = conn.ping().unwrap_err();
    assert_eq!(again.connection_kind(), Some(ConnectionErrorKind::Closed));
    finish(server);
}

#[test]
fn malformed_row_is_decode_error_with_payload() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("8.0.36", modern_caps());
        peer.expect_query("SELECT a FROM t");
        peer.send(1, &column_count(1));
        peer.send(2, &column("a", FieldType::Long));
        // Claims five bytes, carries one.
        peer.send(3, &[0x05, b'1']);
        peer.wait_for_hangup();
    });

    let mut conn = Connection::open(config_for(addr)).expect("connect");
    match conn.execute("SELECT a FROM t", &[]).unwrap_err() {
        Error::Decode(e) => assert_eq!(e.raw_data.as_deref(), Some(&[0x05, b'1'][..])),
        other => panic!("expected decode error, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Closed);
    finish(server);
}

#[test]
fn query_of_write_statement_returns_write_result() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("8.0.36", modern_caps());
        peer.expect_query("DELETE FROM t");
        peer.send(1, &ok(3, 0));
        peer.wait_for_hangup();
    });

    let mut conn = Connection::open(config_for(addr)).expect("connect");
    match conn.query("DELETE FROM t", &[]).expect("delete") {
        QueryResult::Write(w) => assert_eq!(w.affected_rows, 3),
        QueryResult::Rows(rows) => panic!("unexpected rows: {rows:?}"),
    }

    conn.close();
    finish(server);
}

#[test]
fn server_error_on_connect_closes_connection() {
    let (addr, server) = spawn_server(|peer| {
        peer.greet("8.0.36", modern_caps());
        peer.send(2, &err(1045, "28000", "Access denied for user 'app'@'localhost'"));
        peer.wait_for_hangup();
    });

    let mut conn = Connection::new(config_for(addr));
    let e = conn.connect().unwrap_err();
    match &e {
        Error::Server(s) => {
            assert_eq!(s.code, 1045);
            assert_eq!(s.message, "Access denied for user 'app'@'localhost'");
        }
        other => panic!("expected server error, got {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Closed);

    let again = conn.execute("SELECT 1", &[]).unwrap_err();
    assert_eq!(again.connection_kind(), Some(ConnectionErrorKind::Closed));
    finish(server);
}

#[test]
fn server_error_during_execute_keeps_connection() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("8.0.36", modern_caps());
        peer.expect_query("SELECT * FROM missing");
        peer.send(1, &err(1146, "42S02", "Table 'shop.missing' doesn't exist"));
        let ping = peer.recv();
        assert_eq!(ping.payload, vec![0x0e]);
        peer.send(1, &ok(0, 0));
        peer.wait_for_hangup();
    });

    let mut conn = Connection::open(config_for(addr)).expect("connect");
    let e = conn.execute("SELECT * FROM missing", &[]).unwrap_err();
    assert_eq!(e.server_code(), Some(1146));
    assert_eq!(e.sqlstate(), Some("42S02"));
    assert_eq!(conn.state(), ConnectionState::Connected);

    conn.ping().expect("ping after server error");

    conn.close();
    finish(server);
}

#[test]
fn no_response_within_timeout_closes_connection() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("8.0.36", modern_caps());
        peer.expect_query("SELECT SLEEP(10)");
        peer.wait_for_hangup();
    });

    let config = config_for(addr).timeout(Duration::from_millis(200));
    let mut conn = Connection::open(config).expect("connect");

    let started = Instant::now();
    let e = conn.execute("SELECT SLEEP(10)", &[]).unwrap_err();
    assert!(e.is_timeout(), "expected timeout, got {e:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(conn.state(), ConnectionState::Closed);

    finish(server);
}

#[test]
fn handshake_timeout_fails_connect() {
    let (addr, server) = spawn_server(|peer| {
        peer.wait_for_hangup();
    });

    let config = config_for(addr).timeout(Duration::from_millis(100));
    let mut conn = Connection::new(config);
    let e = conn.connect().unwrap_err();
    assert!(matches!(e, Error::ResponseTimeout(_)), "got {e:?}");
    assert_eq!(conn.state(), ConnectionState::Closed);

    finish(server);
}

#[test]
fn charset_is_applied_with_set_names() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("8.0.36", modern_caps());
        peer.expect_query("SET NAMES utf8mb4");
        peer.send(1, &ok(0, 0));
        peer.wait_for_hangup();
    });

    let mut conn = Connection::open(config_for(addr).charset("utf8mb4")).expect("connect");
    assert!(conn.is_connected());
    conn.close();
    finish(server);
}

#[test]
fn failed_set_names_fails_connect() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("8.0.36", modern_caps());
        peer.expect_query("SET NAMES klingon");
        peer.send(1, &err(1115, "42000", "Unknown character set: 'klingon'"));
        peer.wait_for_hangup();
    });

    let mut conn = Connection::new(config_for(addr).charset("klingon"));
    let e = conn.connect().unwrap_err();
    assert_eq!(e.server_code(), Some(1115));
    assert_eq!(conn.state(), ConnectionState::Closed);
    finish(server);
}

#[test]
fn native_auth_switch_is_followed() {
    const NEW_SEED: &[u8; 20] = b"zyxwvutsrqponmlkjihg";

    let (addr, server) = spawn_server(|peer| {
        peer.greet("8.0.36", modern_caps());
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_native_password\0");
        switch.extend_from_slice(NEW_SEED);
        switch.push(0);
        peer.send(2, &switch);

        let reply = peer.recv();
        assert_eq!(reply.sequence_id, 3);
        assert_eq!(reply.payload, mysql_native_password(PASSWORD, NEW_SEED));
        peer.send(4, &ok(0, 0));
        peer.wait_for_hangup();
    });

    let mut conn = Connection::open(config_for(addr)).expect("connect after auth switch");
    assert!(conn.is_connected());
    conn.close();
    finish(server);
}

#[test]
fn unsupported_auth_switch_fails_connect() {
    let (addr, server) = spawn_server(|peer| {
        peer.greet("8.0.36", modern_caps());
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"caching_sha2_password\0");
        switch.extend_from_slice(&SEED);
        switch.push(0);
        peer.send(2, &switch);
        peer.wait_for_hangup();
    });

    let mut conn = Connection::new(config_for(addr));
    let e = conn.connect().unwrap_err();
    assert_eq!(e.connection_kind(), Some(ConnectionErrorKind::UnsupportedAuth));
    assert_eq!(conn.state(), ConnectionState::Closed);
    finish(server);
}

#[test]
fn server_hangup_mid_result_is_read_error() {
    let (addr, server) = spawn_server(|peer| {
        peer.login("8.0.36", modern_caps());
        peer.expect_query("SELECT a FROM t");
        peer.send(1, &column_count(1));
        // Drop the socket before the column definition.
    });

    let mut conn = Connection::open(config_for(addr)).expect("connect");
    let e = conn.execute("SELECT a FROM t", &[]).unwrap_err();
    assert!(matches!(e, Error::Read(_)), "got {e:?}");
    assert!(e.is_connection_error());
    assert_eq!(conn.state(), ConnectionState::Closed);
    finish(server);
}

#[test]
fn refused_connection_ends_closed() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };

    let mut conn = Connection::new(ClientConfig::new().host("127.0.0.1").port(port));
    let e = conn.connect().unwrap_err();
    assert!(e.is_connection_error(), "got {e:?}");
    assert_eq!(conn.state(), ConnectionState::Closed);
}
