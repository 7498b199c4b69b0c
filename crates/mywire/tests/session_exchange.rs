//! Session-engine tests against an in-process scripted server.
//!
//! Each test binds a loopback listener, scripts the server side of the
//! exchange with raw frames, and drives the real client through handshake,
//! queries, and error paths.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;

use mywire::protocol::capabilities;
use mywire::{ConnectionSettings, Session, Value};
use mywire_core::error::UsageErrorKind;
use mywire_core::Error;

const SERVER_CAPS: u32 = capabilities::PROTOCOL_41
    | capabilities::SECURE_CONNECTION
    | capabilities::PLUGIN_AUTH
    | capabilities::LONG_FLAG
    | capabilities::CONNECT_WITH_DB
    | capabilities::MULTI_STATEMENTS
    | capabilities::MULTI_RESULTS
    | capabilities::PS_MULTI_RESULTS;

const NONCE: &[u8] = b"abcdefghijklmnopqrst";

fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).expect("frame header");
    let len = usize::from(header[0]) | (usize::from(header[1]) << 8) | (usize::from(header[2]) << 16);
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).expect("frame payload");
    (header[3], payload)
}

fn write_frame(stream: &mut TcpStream, seq: u8, payload: &[u8]) {
    let len = payload.len();
    let header = [
        (len & 0xFF) as u8,
        ((len >> 8) & 0xFF) as u8,
        ((len >> 16) & 0xFF) as u8,
        seq,
    ];
    stream.write_all(&header).unwrap();
    stream.write_all(payload).unwrap();
    stream.flush().unwrap();
}

fn lenenc_str(out: &mut Vec<u8>, s: &str) {
    assert!(s.len() < 251);
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

fn greeting_payload() -> Vec<u8> {
    let mut p = Vec::new();
    p.push(10);
    p.extend_from_slice(b"5.7.30-mock\0");
    p.extend_from_slice(&7u32.to_le_bytes()); // thread id
    p.extend_from_slice(&NONCE[..8]);
    p.push(0); // filler
    p.extend_from_slice(&((SERVER_CAPS & 0xFFFF) as u16).to_le_bytes());
    p.push(33); // charset
    p.extend_from_slice(&2u16.to_le_bytes()); // status: autocommit
    p.extend_from_slice(&((SERVER_CAPS >> 16) as u16).to_le_bytes());
    p.push(21); // nonce length
    p.extend_from_slice(&[0u8; 10]);
    p.extend_from_slice(&NONCE[8..]);
    p.push(0);
    p.extend_from_slice(b"mysql_native_password\0");
    p
}

fn ok_payload(affected: u8, insert_id: u8, status: u16, warnings: u16) -> Vec<u8> {
    let mut p = vec![0x00, affected, insert_id];
    p.extend_from_slice(&status.to_le_bytes());
    p.extend_from_slice(&warnings.to_le_bytes());
    p
}

fn eof_payload(status: u16) -> Vec<u8> {
    let mut p = vec![0xFE, 0, 0];
    p.extend_from_slice(&status.to_le_bytes());
    p
}

fn err_payload(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut p = vec![0xFF];
    p.extend_from_slice(&code.to_le_bytes());
    p.push(b'#');
    p.extend_from_slice(sqlstate.as_bytes());
    p.extend_from_slice(message.as_bytes());
    p
}

fn column_payload(name: &str, field_type: u8, flags: u16, cs: u16) -> Vec<u8> {
    let mut p = Vec::new();
    lenenc_str(&mut p, "def");
    lenenc_str(&mut p, "shop");
    lenenc_str(&mut p, "t");
    lenenc_str(&mut p, "t");
    lenenc_str(&mut p, name);
    lenenc_str(&mut p, name);
    p.push(0x0C);
    p.extend_from_slice(&cs.to_le_bytes());
    p.extend_from_slice(&11u32.to_le_bytes());
    p.push(field_type);
    p.extend_from_slice(&flags.to_le_bytes());
    p.push(0);
    p.extend_from_slice(&0u16.to_le_bytes());
    p
}

fn text_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut p = Vec::new();
    for v in values {
        match v {
            None => p.push(0xFB),
            Some(s) => lenenc_str(&mut p, s),
        }
    }
    p
}

/// Serve the handshake: greeting, response validation, final OK.
fn serve_handshake(stream: &mut TcpStream) {
    write_frame(stream, 0, &greeting_payload());
    let (seq, response) = read_frame(stream);
    assert_eq!(seq, 1);

    let caps = u32::from_le_bytes([response[0], response[1], response[2], response[3]]);
    assert!(caps & capabilities::PROTOCOL_41 != 0);
    assert!(caps & capabilities::SECURE_CONNECTION != 0);

    // Past caps(4) + max packet(4) + charset(1) + reserved(23): user NUL-terminated.
    let rest = &response[32..];
    let nul = rest.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&rest[..nul], b"app");
    let rest = &rest[nul + 1..];
    let cred_len = usize::from(rest[0]);
    let credential = &rest[1..1 + cred_len];
    assert_eq!(
        credential,
        mywire::auth::scramble_411("secret", NONCE).as_slice(),
        "client sent the 4.1.1 scramble for the advertised nonce"
    );

    write_frame(stream, 2, &ok_payload(0, 0, 2, 0));
}

fn settings_for(addr: std::net::SocketAddr) -> ConnectionSettings {
    ConnectionSettings::new()
        .host("127.0.0.1")
        .port(addr.port())
        .user("app")
        .password("secret")
        .database("shop")
}

fn spawn_server(script: impl FnOnce(&mut TcpStream) + Send + 'static) -> (std::net::SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        script(&mut stream);
        // Swallow whatever trailing frames (QUIT) the client sends.
        let mut sink = [0u8; 64];
        while let Ok(n) = stream.read(&mut sink) {
            if n == 0 {
                break;
            }
        }
    });
    (addr, handle)
}

#[test]
fn handshake_ping_and_text_query() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);

        // COM_PING
        let (seq, cmd) = read_frame(stream);
        assert_eq!(seq, 0);
        assert_eq!(cmd, [0x0E]);
        write_frame(stream, 1, &ok_payload(0, 0, 2, 0));

        // COM_QUERY
        let (_, cmd) = read_frame(stream);
        assert_eq!(cmd[0], 0x03);
        assert_eq!(&cmd[1..], b"SELECT id, name FROM t");
        write_frame(stream, 1, &[0x02]); // two columns
        write_frame(stream, 2, &column_payload("id", 0x03, 1, 63));
        write_frame(stream, 3, &column_payload("name", 0xFD, 0, 33));
        write_frame(stream, 4, &eof_payload(2));
        write_frame(stream, 5, &text_row(&[Some("1"), Some("ada")]));
        write_frame(stream, 6, &text_row(&[Some("2"), None]));
        write_frame(stream, 7, &eof_payload(2));
    });

    let mut session = Session::open(settings_for(addr)).unwrap();
    assert_eq!(session.thread_id(), 7);
    assert_eq!(session.server_version(), "5.7.30-mock");
    assert!(session.is_ready());

    assert!(session.ping());

    let mut cursor = session.execute("SELECT id, name FROM t").unwrap();
    assert!(cursor.has_rows());
    assert_eq!(cursor.columns().len(), 2);
    assert_eq!(cursor.columns()[0].name, "id");

    let row = cursor.next_row().unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Int(1)));
    assert_eq!(row.get_by_name("name"), Some(&Value::Text("ada".to_string())));

    let row = cursor.next_row().unwrap().unwrap();
    assert_eq!(row.get(1), Some(&Value::Null));

    assert!(cursor.next_row().unwrap().is_none());
    assert!(session.is_ready());

    session.close();
    server.join().unwrap();
}

#[test]
fn chained_results_are_walked_in_order() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);

        let (_, cmd) = read_frame(stream);
        assert_eq!(cmd[0], 0x03);
        // First set: one column, one row, more-results flag set on its EOF.
        write_frame(stream, 1, &[0x01]);
        write_frame(stream, 2, &column_payload("n", 0x03, 0, 63));
        write_frame(stream, 3, &eof_payload(2));
        write_frame(stream, 4, &text_row(&[Some("5")]));
        write_frame(stream, 5, &eof_payload(2 | 0x0008));
        // Second response: plain OK ending the chain.
        write_frame(stream, 6, &ok_payload(3, 0, 2, 0));
    });

    let mut session = Session::open(settings_for(addr)).unwrap();
    let mut cursor = session.execute("CALL totals()").unwrap();
    let row = cursor.next_row().unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Int(5)));
    assert!(cursor.next_row().unwrap().is_none());

    let tail = cursor.next_result().unwrap().expect("second result");
    assert!(!tail.has_rows());
    assert_eq!(tail.affected_rows(), 3);
    assert!(tail.next_result().unwrap().is_none());

    assert!(session.is_ready());
    session.close();
    server.join().unwrap();
}

#[test]
fn server_error_is_structured_and_not_fatal() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);

        let (_, cmd) = read_frame(stream);
        assert_eq!(cmd[0], 0x03);
        write_frame(stream, 1, &err_payload(1146, "42S02", "Table 'shop.missing' doesn't exist"));

        // The session stays usable: expect a ping next.
        let (_, cmd) = read_frame(stream);
        assert_eq!(cmd, [0x0E]);
        write_frame(stream, 1, &ok_payload(0, 0, 2, 0));
    });

    let mut session = Session::open(settings_for(addr)).unwrap();
    let err = session.execute("SELECT * FROM missing").unwrap_err();
    match err {
        Error::Server(e) => {
            assert_eq!(e.code, 1146);
            assert_eq!(e.sqlstate.as_deref(), Some("42S02"));
            assert_eq!(e.message, "Table 'shop.missing' doesn't exist");
            assert!(!e.is_fatal());
        }
        other => panic!("expected server error, got {other:?}"),
    }

    assert!(session.ping(), "session survives a non-fatal server error");
    session.close();
    server.join().unwrap();
}

#[test]
fn sequential_access_enforces_ordering() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);

        let (_, cmd) = read_frame(stream);
        assert_eq!(cmd[0], 0x03);
        write_frame(stream, 1, &[0x03]);
        write_frame(stream, 2, &column_payload("a", 0x03, 0, 63));
        write_frame(stream, 3, &column_payload("b", 0xFD, 0, 33));
        write_frame(stream, 4, &column_payload("c", 0xFD, 0, 33));
        write_frame(stream, 5, &eof_payload(2));
        write_frame(stream, 6, &text_row(&[Some("9"), Some("skipped"), Some("last")]));
        write_frame(stream, 7, &eof_payload(2));
    });

    let mut session = Session::open(settings_for(addr)).unwrap();
    let cursor = session.execute("SELECT a, b, c FROM t").unwrap();
    let mut cursor = cursor.into_sequential().unwrap();

    assert!(cursor.advance().unwrap());

    // Forward skip over column 0 straight to column 1.
    assert_eq!(cursor.column(1).unwrap(), Value::Text("skipped".to_string()));
    // Re-reading the same column comes from cache.
    assert_eq!(cursor.column(1).unwrap(), Value::Text("skipped".to_string()));

    // Going backwards is caller misuse.
    match cursor.column(0).unwrap_err() {
        Error::Usage(u) => assert_eq!(u.kind, UsageErrorKind::OutOfOrderColumn),
        other => panic!("expected usage error, got {other:?}"),
    }

    // Forward reads still work after the failed backward read.
    assert_eq!(cursor.column(2).unwrap(), Value::Text("last".to_string()));

    assert!(!cursor.advance().unwrap());
    session.close();
    server.join().unwrap();
}

#[test]
fn prepared_statement_roundtrip() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);

        // COM_STMT_PREPARE
        let (seq, cmd) = read_frame(stream);
        assert_eq!(seq, 0);
        assert_eq!(cmd[0], 0x16);
        assert_eq!(&cmd[1..], b"SELECT n FROM t WHERE id = ?");
        // Prepare OK: stmt id 4, one column, one param.
        let mut ok = vec![0x00];
        ok.extend_from_slice(&4u32.to_le_bytes());
        ok.extend_from_slice(&1u16.to_le_bytes()); // columns
        ok.extend_from_slice(&1u16.to_le_bytes()); // params
        ok.push(0);
        ok.extend_from_slice(&0u16.to_le_bytes());
        write_frame(stream, 1, &ok);
        write_frame(stream, 2, &column_payload("id", 0x03, 0, 63)); // param def
        write_frame(stream, 3, &eof_payload(2));
        write_frame(stream, 4, &column_payload("n", 0x03, 0, 63)); // column def
        write_frame(stream, 5, &eof_payload(2));

        // COM_STMT_EXECUTE
        let (seq, cmd) = read_frame(stream);
        assert_eq!(seq, 0);
        assert_eq!(cmd[0], 0x17);
        assert_eq!(u32::from_le_bytes([cmd[1], cmd[2], cmd[3], cmd[4]]), 4);
        assert_eq!(cmd[10], 0x00, "no nulls bound");
        assert_eq!(cmd[11], 1, "types sent on first execution");
        // Binary result: one column, one row.
        write_frame(stream, 1, &[0x01]);
        write_frame(stream, 2, &column_payload("n", 0x03, 0, 63));
        write_frame(stream, 3, &eof_payload(2));
        write_frame(stream, 4, &[0x00, 0x00, 0x2A, 0x00, 0x00, 0x00]); // row: n = 42
        write_frame(stream, 5, &eof_payload(2));

        // COM_STMT_CLOSE (no response)
        let (_, cmd) = read_frame(stream);
        assert_eq!(cmd[0], 0x19);
        assert_eq!(u32::from_le_bytes([cmd[1], cmd[2], cmd[3], cmd[4]]), 4);
    });

    let mut session = Session::open(settings_for(addr)).unwrap();
    let mut statement = session.prepare("SELECT n FROM t WHERE id = @id").unwrap();
    assert_eq!(statement.statement_id, 4);
    assert_eq!(statement.param_names, vec!["@id"]);
    assert_eq!(statement.param_count(), 1);

    let mut cursor = session
        .execute_prepared(&mut statement, &[Value::Int(7)])
        .unwrap();
    let row = cursor.next_row().unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Int(42)));
    assert!(cursor.next_row().unwrap().is_none());

    session.close_statement(&mut statement).unwrap();
    assert!(statement.closed);
    // Closing twice is caller misuse.
    assert!(session.close_statement(&mut statement).is_err());

    session.close();
    server.join().unwrap();
}

#[test]
fn dropped_cursor_is_drained_before_next_command() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream);

        let (_, cmd) = read_frame(stream);
        assert_eq!(cmd[0], 0x03);
        write_frame(stream, 1, &[0x01]);
        write_frame(stream, 2, &column_payload("n", 0x03, 0, 63));
        write_frame(stream, 3, &eof_payload(2));
        for (i, v) in ["1", "2", "3"].iter().enumerate() {
            write_frame(stream, 4 + i as u8, &text_row(&[Some(v)]));
        }
        write_frame(stream, 7, &eof_payload(2));

        // The abandoned rows must not leak into the ping exchange.
        let (_, cmd) = read_frame(stream);
        assert_eq!(cmd, [0x0E]);
        write_frame(stream, 1, &ok_payload(0, 0, 2, 0));
    });

    let mut session = Session::open(settings_for(addr)).unwrap();
    {
        let mut cursor = session.execute("SELECT n FROM t").unwrap();
        // Read one of three rows, then abandon the cursor.
        assert!(cursor.next_row().unwrap().is_some());
    }
    assert!(session.ping(), "ping sees an aligned stream after the drain");
    session.close();
    server.join().unwrap();
}

#[test]
fn auth_switch_reruns_the_scramble() {
    let (addr, server) = spawn_server(|stream| {
        write_frame(stream, 0, &greeting_payload());
        let (_, _response) = read_frame(stream);

        // Ask the client to redo auth with a fresh nonce.
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_native_password\0");
        switch.extend_from_slice(b"ABCDEFGHIJKLMNOPQRST");
        switch.push(0);
        write_frame(stream, 2, &switch);

        let (_, reply) = read_frame(stream);
        assert_eq!(
            reply,
            mywire::auth::scramble_411("secret", b"ABCDEFGHIJKLMNOPQRST"),
            "client re-scrambled against the switch nonce"
        );
        write_frame(stream, 4, &ok_payload(0, 0, 2, 0));
    });

    let session = Session::open(settings_for(addr)).unwrap();
    assert!(session.is_ready());
    drop(session);
    server.join().unwrap();
}

#[test]
fn too_old_server_is_rejected() {
    let (addr, server) = spawn_server(|stream| {
        let mut p = Vec::new();
        p.push(10);
        p.extend_from_slice(b"4.1.22\0");
        p.extend_from_slice(&1u32.to_le_bytes());
        p.extend_from_slice(&NONCE[..8]);
        p.push(0);
        p.extend_from_slice(&((SERVER_CAPS & 0xFFFF) as u16).to_le_bytes());
        p.push(33);
        p.extend_from_slice(&2u16.to_le_bytes());
        p.extend_from_slice(&((SERVER_CAPS >> 16) as u16).to_le_bytes());
        p.push(21);
        p.extend_from_slice(&[0u8; 10]);
        p.extend_from_slice(&NONCE[8..]);
        p.push(0);
        p.extend_from_slice(b"mysql_native_password\0");
        write_frame(stream, 0, &p);
    });

    let err = Session::open(settings_for(addr)).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    server.join().unwrap();
}
