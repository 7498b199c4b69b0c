//! The session engine: one authenticated protocol endpoint.
//!
//! A `Session` owns one framed transport and drives the full lifecycle:
//! greeting, capability negotiation, optional TLS upgrade, authentication
//! (including plugin switches), command dispatch, and result retrieval.
//! Every command is a strict request/response cycle — the engine drains any
//! outstanding response data before the next command goes out, so the stream
//! never desynchronizes.

#![allow(clippy::cast_possible_truncation)]

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mywire_core::error::{
    TransportErrorKind, UsageErrorKind, config_error, protocol_error, transport_error,
    usage_error,
};
use mywire_core::{Error, Result};

use crate::auth;
use crate::buffer::BufferPool;
use crate::protocol::codec::{ByteReader, ByteWriter};
use crate::protocol::{
    Command, OkPacket, ResponseKind, capabilities, parse_eof, parse_err, parse_ok, server_status,
};
use crate::result::ResultCursor;
use crate::settings::ConnectionSettings;
use crate::statement::{
    self, PreparedStatement, build_close, build_execute, build_fetch, build_prepare, build_reset,
    rewrite_for_prepare,
};
use crate::tls;
use crate::transport::{FramedTransport, NetStream, TimedStream};
use crate::types::{Column, DecodePolicy, parse_column};

/// Oldest server the driver will talk to.
const MIN_SERVER_VERSION: (u16, u16, u16) = (5, 0, 0);

/// Budget for the out-of-band kill connection during timeout recovery.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// ER_QUERY_INTERRUPTED: what a killed query reports.
const QUERY_INTERRUPTED: u16 = 1317;

/// Protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Ready,
    Executing,
    Closed,
    /// Fatal transport or protocol error; the session must be discarded.
    Broken,
}

/// Where the response stream currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResultState {
    /// Request/response aligned; a new command may be sent.
    Idle,
    /// A command went out and its first response packet is unread.
    AwaitingResponse,
    /// Row packets of a result set are pending on the wire.
    Rows,
    /// A result set ended with the more-results flag set.
    MoreResults,
}

/// The parsed server greeting.
#[derive(Debug, Clone)]
pub struct ServerGreeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    /// Nonce parts 1 and 2 joined, trailing NUL stripped
    pub nonce: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
}

/// Parse the server greeting payload.
pub fn parse_greeting(payload: &[u8]) -> Result<ServerGreeting> {
    let mut r = ByteReader::new(payload);
    let protocol_version = r
        .take_u8()
        .ok_or_else(|| protocol_error("empty server greeting"))?;
    if protocol_version < 10 {
        return Err(protocol_error(format!(
            "unsupported protocol version {protocol_version}"
        )));
    }
    let server_version = r
        .take_cstr()
        .ok_or_else(|| protocol_error("greeting missing server version"))?;
    let thread_id = r
        .take_u32_le()
        .ok_or_else(|| protocol_error("greeting missing thread id"))?;
    let mut nonce = r
        .take_slice(8)
        .ok_or_else(|| protocol_error("greeting missing auth nonce"))?
        .to_vec();
    r.advance(1); // filler

    let caps_low = r.take_u16_le().unwrap_or(0);
    let charset = r.take_u8().unwrap_or(0);
    let status_flags = r.take_u16_le().unwrap_or(0);
    let caps_high = r.take_u16_le().unwrap_or(0);
    let caps = u32::from(caps_low) | (u32::from(caps_high) << 16);

    let nonce_len = if caps & capabilities::PLUGIN_AUTH != 0 {
        usize::from(r.take_u8().unwrap_or(0))
    } else {
        r.advance(1);
        0
    };
    r.advance(10); // reserved

    if caps & capabilities::SECURE_CONNECTION != 0 {
        let part2_len = nonce_len.saturating_sub(8).max(13);
        if let Some(part2) = r.take_slice(part2_len) {
            nonce.extend_from_slice(part2);
        }
        if nonce.last() == Some(&0) {
            nonce.pop();
        }
    }

    let auth_plugin = if caps & capabilities::PLUGIN_AUTH != 0 {
        r.take_cstr().unwrap_or_default()
    } else {
        auth::plugins::NATIVE_PASSWORD.to_string()
    };

    Ok(ServerGreeting {
        protocol_version,
        server_version,
        thread_id,
        nonce,
        capabilities: caps,
        charset,
        status_flags,
        auth_plugin,
    })
}

/// Parse "5.7.44-log" style version strings; unparsable parts become zero.
pub fn parse_server_version(version: &str) -> (u16, u16, u16) {
    let numeric = version
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()
        .unwrap_or("");
    let mut parts = numeric.split('.');
    let mut next = || {
        parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(0)
    };
    (next(), next(), next())
}

/// Build the full handshake response payload.
fn build_handshake_response(
    settings: &ConnectionSettings,
    client_caps: u32,
    auth_plugin: &str,
    credential: &[u8],
) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(128);
    w.put_u32_le(client_caps);
    w.put_u32_le(settings.max_packet_size);
    w.put_u8(settings.charset);
    w.put_zeros(23);
    w.put_cstr(&settings.user);

    if client_caps & capabilities::PLUGIN_AUTH_LENENC_DATA != 0 {
        w.put_lenenc_bytes(credential);
    } else if client_caps & capabilities::SECURE_CONNECTION != 0 {
        w.put_u8(credential.len() as u8);
        w.put_bytes(credential);
    } else {
        w.put_bytes(credential);
        w.put_u8(0);
    }

    if client_caps & capabilities::CONNECT_WITH_DB != 0 {
        w.put_cstr(settings.database.as_deref().unwrap_or(""));
    }
    if client_caps & capabilities::PLUGIN_AUTH != 0 {
        w.put_cstr(auth_plugin);
    }
    w.into_vec()
}

/// What a command exchange produced: a completed statement or a result set.
#[derive(Debug)]
pub(crate) enum Exchange {
    Done(OkPacket),
    ResultSet(Arc<Vec<Column>>),
}

/// One authenticated, stateful protocol endpoint.
pub struct Session {
    transport: FramedTransport,
    settings: Arc<ConnectionSettings>,
    buffers: Arc<BufferPool>,
    policy: DecodePolicy,
    state: SessionState,
    result_state: ResultState,
    capabilities: u32,
    tls_active: bool,
    server_version: String,
    version: (u16, u16, u16),
    thread_id: u32,
    auth_nonce: Vec<u8>,
    status_flags: u16,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
    created_at: Instant,
    idle_since: Instant,
    enlisted: Option<u64>,
}

impl Session {
    /// Open, handshake, and authenticate a new session.
    pub fn open(settings: ConnectionSettings) -> Result<Self> {
        Self::open_with(Arc::new(settings))
    }

    /// As [`Session::open`], sharing an already-built settings bundle.
    pub fn open_with(settings: Arc<ConnectionSettings>) -> Result<Self> {
        let addr = settings
            .endpoint()
            .to_socket_addrs()
            .map_err(|e| {
                transport_error(
                    TransportErrorKind::Connect,
                    format!("cannot resolve {}: {}", settings.endpoint(), e),
                )
            })?
            .next()
            .ok_or_else(|| {
                transport_error(
                    TransportErrorKind::Connect,
                    format!("no address for {}", settings.endpoint()),
                )
            })?;

        let tcp = TcpStream::connect_timeout(&addr, settings.connect_timeout).map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                TransportErrorKind::Refused
            } else {
                TransportErrorKind::Connect
            };
            transport_error(kind, format!("cannot connect to {}: {}", settings.endpoint(), e))
        })?;
        tcp.set_nodelay(true).ok();

        let connect_ms = settings.connect_timeout.as_millis() as u64;
        let mut transport = FramedTransport::new(TimedStream::new(NetStream::Tcp(tcp)));
        transport.reset_timeout(connect_ms);

        let greeting_payload = transport.receive_message()?;
        let greeting = parse_greeting(&greeting_payload)?;
        let version = parse_server_version(&greeting.server_version);
        if version < MIN_SERVER_VERSION {
            return Err(protocol_error(format!(
                "server version {} is older than the minimum supported {}.{}.{}",
                greeting.server_version,
                MIN_SERVER_VERSION.0,
                MIN_SERVER_VERSION.1,
                MIN_SERVER_VERSION.2
            )));
        }
        if greeting.capabilities & capabilities::PROTOCOL_41 == 0 {
            return Err(protocol_error("server does not speak protocol 4.1"));
        }

        let mut client_caps = settings.capability_flags() & greeting.capabilities;
        client_caps |= capabilities::PROTOCOL_41;

        let mut tls_active = false;
        if settings.ssl_mode.should_try_ssl() {
            if tls::server_supports_ssl(greeting.capabilities) {
                transport.send_message(&tls::build_ssl_request(
                    client_caps,
                    settings.max_packet_size,
                    settings.charset,
                ))?;
                let stream = transport
                    .into_stream()
                    .ok_or_else(|| protocol_error("transport detached during TLS upgrade"))?;
                let upgraded = tls::upgrade(stream, &settings)?;
                // The encrypted stream keeps its own counter, picking up
                // after the greeting and the SSL request.
                transport = FramedTransport::resume(upgraded, 2);
                transport.reset_timeout(connect_ms);
                tls_active = true;
            } else if settings.ssl_mode.is_required() {
                return Err(transport_error(
                    TransportErrorKind::Tls,
                    format!("server {} does not support TLS", settings.endpoint()),
                ));
            } else {
                client_caps &= !capabilities::SSL;
            }
        } else {
            client_caps &= !capabilities::SSL;
        }

        let password = settings.password.clone().unwrap_or_default();
        let credential = compute_credential(&greeting.auth_plugin, &password, &greeting.nonce);
        transport.send_message(&build_handshake_response(
            &settings,
            client_caps,
            &greeting.auth_plugin,
            &credential,
        ))?;

        let policy = DecodePolicy::from_settings(&settings);
        let now = Instant::now();
        let mut session = Self {
            transport,
            settings,
            buffers: Arc::new(BufferPool::new()),
            policy,
            state: SessionState::Handshaking,
            result_state: ResultState::Idle,
            capabilities: client_caps,
            tls_active,
            server_version: greeting.server_version,
            version,
            thread_id: greeting.thread_id,
            auth_nonce: greeting.nonce,
            status_flags: greeting.status_flags,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            created_at: now,
            idle_since: now,
            enlisted: None,
        };

        session.complete_authentication(&password)?;

        if client_caps & capabilities::COMPRESS != 0 {
            let pool = session.buffers.clone();
            session.transport.enable_compression(pool);
        }
        session.transport.reset_timeout(0);
        session.state = SessionState::Ready;
        tracing::debug!(
            thread_id = session.thread_id,
            server = %session.server_version,
            tls = session.tls_active,
            compressed = client_caps & capabilities::COMPRESS != 0,
            "session established"
        );
        Ok(session)
    }

    /// Drive OK / ERR / auth-switch / extra-data packets until the server
    /// accepts or rejects the credentials.
    fn complete_authentication(&mut self, password: &str) -> Result<()> {
        loop {
            let payload = self.transport.receive_message()?;
            match payload.first() {
                Some(0x00) => {
                    self.absorb_ok(&payload)?;
                    return Ok(());
                }
                Some(0xFF) => {
                    let err = parse_err(&payload)?;
                    return Err(Error::Server(err));
                }
                Some(0xFE) => {
                    if payload.len() == 1 {
                        // Bare 0xFE: the server wants the pre-4.1 scramble.
                        let nonce = &self.auth_nonce[..self.auth_nonce.len().min(8)];
                        let mut reply = auth::scramble_323(password, nonce);
                        reply.push(0);
                        self.transport.send_message(&reply)?;
                    } else {
                        let mut r = ByteReader::new(&payload[1..]);
                        let plugin = r
                            .take_cstr()
                            .ok_or_else(|| protocol_error("auth switch missing plugin name"))?;
                        let mut nonce = r.take_rest().to_vec();
                        if nonce.last() == Some(&0) {
                            nonce.pop();
                        }
                        self.auth_nonce = nonce;
                        let reply =
                            compute_credential(&plugin, password, &self.auth_nonce);
                        self.transport.send_message(&reply)?;
                    }
                }
                Some(0x01) => self.continue_caching_sha2(&payload[1..], password)?,
                Some(other) => {
                    return Err(protocol_error(format!(
                        "unexpected auth packet 0x{other:02X}"
                    )));
                }
                None => return Err(protocol_error("empty auth packet")),
            }
        }
    }

    /// caching_sha2 continuation: fast-auth confirmation or full auth via
    /// cleartext-over-TLS / RSA key exchange.
    fn continue_caching_sha2(&mut self, data: &[u8], password: &str) -> Result<()> {
        match data.first() {
            Some(&auth::caching_sha2_status::FAST_AUTH_SUCCESS) => Ok(()),
            Some(&auth::caching_sha2_status::PERFORM_FULL_AUTH) => {
                if self.tls_active {
                    let mut cleartext = password.as_bytes().to_vec();
                    cleartext.push(0);
                    self.transport.send_message(&cleartext)?;
                } else {
                    self.transport
                        .send_message(&[auth::caching_sha2_status::REQUEST_PUBLIC_KEY])?;
                    let key_packet = self.transport.receive_message()?;
                    let pem = match key_packet.first() {
                        Some(0x01) => &key_packet[1..],
                        _ => &key_packet[..],
                    };
                    let encrypted =
                        auth::rsa_encrypted_password(password, &self.auth_nonce, pem, true)
                            .map_err(|e| {
                                transport_error(TransportErrorKind::Tls, e)
                            })?;
                    self.transport.send_message(&encrypted)?;
                }
                Ok(())
            }
            _ => Err(protocol_error("unexpected caching_sha2 continuation")),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn is_broken(&self) -> bool {
        self.state == SessionState::Broken
    }

    /// Server-side connection id, the target for kill-by-thread-id.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn settings(&self) -> &Arc<ConnectionSettings> {
        &self.settings
    }

    pub fn has_status(&self, flag: u16) -> bool {
        self.status_flags & flag != 0
    }

    pub fn in_transaction(&self) -> bool {
        self.has_status(server_status::IN_TRANSACTION)
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.idle_since.elapsed()
    }

    /// Stamp the session as idle-from-now (pool bookkeeping).
    pub fn mark_idle(&mut self) {
        self.idle_since = Instant::now();
    }

    /// Bind the session to an ambient transaction.
    pub fn enlist(&mut self, transaction_id: u64) -> Result<()> {
        if let Some(existing) = self.enlisted {
            if existing != transaction_id {
                return Err(usage_error(
                    UsageErrorKind::Transaction,
                    format!(
                        "session already enlisted in transaction {existing}, cannot join {transaction_id}"
                    ),
                ));
            }
        }
        self.enlisted = Some(transaction_id);
        Ok(())
    }

    pub fn enlistment(&self) -> Option<u64> {
        self.enlisted
    }

    pub fn clear_enlistment(&mut self) {
        self.enlisted = None;
    }

    /// Whether the lifetime limit in the settings has passed.
    pub fn lifetime_expired(&self) -> bool {
        !self.settings.connection_lifetime.is_zero() && self.age() > self.settings.connection_lifetime
    }

    pub(crate) fn decode_policy(&self) -> &DecodePolicy {
        &self.policy
    }

    pub(crate) fn long_flag(&self) -> bool {
        self.capabilities & capabilities::LONG_FLAG != 0
    }

    /// Re-arm the per-command deadline (zero disables).
    pub fn reset_timeout(&mut self, timeout: Duration) {
        self.transport.reset_timeout(timeout.as_millis() as u64);
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    /// Ensure the stream is aligned and start a command cycle.
    fn begin_command(&mut self) -> Result<()> {
        match self.state {
            SessionState::Broken => {
                return Err(transport_error(
                    TransportErrorKind::Disconnected,
                    "session is broken",
                ));
            }
            SessionState::Closed => {
                return Err(usage_error(
                    UsageErrorKind::SessionClosed,
                    "session is closed",
                ));
            }
            _ => {}
        }
        // A dropped cursor leaves responses on the wire; consume them so the
        // next exchange starts aligned.
        self.drain_results()?;
        self.transport.reset_sequence();
        self.reset_timeout(self.settings.command_timeout);
        self.state = SessionState::Executing;
        self.warnings = 0;
        Ok(())
    }

    fn send_command(&mut self, command: Command, tail: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(1 + tail.len());
        payload.push(command as u8);
        payload.extend_from_slice(tail);
        self.transport.send_message(&payload)?;
        self.result_state = ResultState::AwaitingResponse;
        Ok(())
    }

    /// Apply the failure policy to a command outcome.
    fn settle<T>(&mut self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(v) => Ok(v),
            Err(e) => Err(self.absorb_failure(e)),
        }
    }

    fn absorb_failure(&mut self, error: Error) -> Error {
        match &error {
            Error::Timeout(_) => {
                if self.recover_from_timeout() {
                    tracing::warn!(thread_id = self.thread_id, "query killed after timeout");
                } else {
                    self.mark_broken();
                }
            }
            e if e.is_fatal() => self.mark_broken(),
            _ => {
                // Server errors leave the exchange completed.
                self.state = SessionState::Ready;
                self.result_state = ResultState::Idle;
            }
        }
        error
    }

    /// Kill the in-flight query from a second session, then try to drain the
    /// interrupted response so this session stays usable. Returns whether
    /// recovery succeeded.
    fn recover_from_timeout(&mut self) -> bool {
        let kill = self.kill_in_flight();
        if kill.is_err() {
            tracing::warn!(
                thread_id = self.thread_id,
                "kill after timeout failed; discarding session"
            );
            return false;
        }
        // The killed query still owes us its (error) response.
        self.transport
            .reset_timeout(CANCEL_TIMEOUT.as_millis() as u64);
        match self.drain_after_kill() {
            Ok(()) => {
                self.state = SessionState::Ready;
                self.result_state = ResultState::Idle;
                true
            }
            Err(_) => false,
        }
    }

    fn kill_in_flight(&self) -> Result<()> {
        let settings = (*self.settings)
            .clone()
            .pooling(false)
            .connect_timeout(CANCEL_TIMEOUT)
            .command_timeout(CANCEL_TIMEOUT);
        let mut killer = Session::open(settings)?;
        killer.execute_discard(&format!("KILL QUERY {}", self.thread_id))?;
        killer.close();
        Ok(())
    }

    fn drain_after_kill(&mut self) -> Result<()> {
        loop {
            match self.result_state {
                ResultState::Idle => return Ok(()),
                ResultState::Rows => while self.fetch_row_payload()?.is_some() {},
                ResultState::AwaitingResponse | ResultState::MoreResults => {
                    self.result_state = ResultState::AwaitingResponse;
                    match self.read_exchange() {
                        Ok(Exchange::Done(_)) | Ok(Exchange::ResultSet(_)) => {}
                        Err(Error::Server(e)) if e.code == QUERY_INTERRUPTED => {
                            self.result_state = ResultState::Idle;
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    fn mark_broken(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Broken;
        }
        self.result_state = ResultState::Idle;
        self.transport.close();
    }

    fn absorb_ok(&mut self, payload: &[u8]) -> Result<OkPacket> {
        let ok = parse_ok(payload)?;
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.status_flags = ok.status_flags;
        self.warnings = ok.warnings;
        Ok(ok)
    }

    /// Read one response header: OK, ERR, a column-count-prefixed result
    /// set, or a LOCAL INFILE request the engine satisfies in-band.
    pub(crate) fn read_exchange(&mut self) -> Result<Exchange> {
        let mut infile_error: Option<Error> = None;
        loop {
            let payload = self.transport.receive_message()?;
            match ResponseKind::classify(&payload) {
                ResponseKind::Ok => {
                    let ok = self.absorb_ok(&payload)?;
                    self.finish_set();
                    if let Some(e) = infile_error {
                        return Err(self.absorb_failure(e));
                    }
                    return Ok(Exchange::Done(ok));
                }
                ResponseKind::Err => {
                    let err = parse_err(&payload)?;
                    self.result_state = ResultState::Idle;
                    return Err(Error::Server(err));
                }
                ResponseKind::LocalInfile => {
                    let filename = String::from_utf8_lossy(&payload[1..]).into_owned();
                    infile_error = self.stream_local_file(&filename).err();
                }
                ResponseKind::Eof => {
                    return Err(protocol_error("unexpected EOF packet in response header"));
                }
                ResponseKind::Data => {
                    let mut r = ByteReader::new(&payload);
                    let column_count = r
                        .take_lenenc()
                        .ok_or_else(|| protocol_error("malformed result-set header"))?
                        as usize;
                    let columns = self.read_column_block(column_count)?;
                    self.result_state = ResultState::Rows;
                    return Ok(Exchange::ResultSet(Arc::new(columns)));
                }
            }
        }
    }

    /// Read `count` column definitions plus the trailing EOF marker.
    fn read_column_block(&mut self, count: usize) -> Result<Vec<Column>> {
        let long_flag = self.long_flag();
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let payload = self.transport.receive_message()?;
            columns.push(parse_column(&payload, long_flag)?);
        }
        self.read_eof_marker()?;
        Ok(columns)
    }

    fn read_eof_marker(&mut self) -> Result<()> {
        let payload = self.transport.receive_message()?;
        if ResponseKind::classify(&payload) != ResponseKind::Eof {
            return Err(protocol_error("expected end-of-metadata marker"));
        }
        let eof = parse_eof(&payload)?;
        self.status_flags = eof.status_flags;
        self.warnings = self.warnings.saturating_add(eof.warnings);
        Ok(())
    }

    /// Stream a local file to the server as raw frames, empty-terminated.
    fn stream_local_file(&mut self, filename: &str) -> Result<()> {
        if !self.settings.local_infile {
            // Terminate the exchange so the stream stays aligned, then fail.
            self.transport.send_raw_frame(&[])?;
            return Err(config_error(
                "server requested a local file but local_infile is disabled",
            ));
        }
        match std::fs::File::open(filename) {
            Ok(mut file) => {
                let mut chunk = vec![0u8; 8192];
                loop {
                    let n = file.read(&mut chunk).map_err(Error::from)?;
                    if n == 0 {
                        break;
                    }
                    self.transport.send_raw_frame(&chunk[..n])?;
                }
                self.transport.send_raw_frame(&[])?;
                Ok(())
            }
            Err(e) => {
                self.transport.send_raw_frame(&[])?;
                Err(transport_error(
                    TransportErrorKind::Disconnected,
                    format!("cannot read local file '{filename}': {e}"),
                ))
            }
        }
    }

    /// End-of-set bookkeeping shared by OK packets and row EOFs.
    fn finish_set(&mut self) {
        if self.has_status(server_status::MORE_RESULTS) {
            self.result_state = ResultState::MoreResults;
        } else {
            self.result_state = ResultState::Idle;
            self.state = SessionState::Ready;
        }
    }

    /// Read the next row payload of the current set, or None at its end.
    /// Row packets are only ever distinguished from EOF by the short-0xFE
    /// rule; a leading 0x00 or 0xFB byte is valid row data.
    pub(crate) fn fetch_row_payload(&mut self) -> Result<Option<Vec<u8>>> {
        if self.result_state != ResultState::Rows {
            return Ok(None);
        }
        let payload = self.transport.receive_message()?;
        match payload.first() {
            Some(0xFE) if payload.len() < 9 => {
                let eof = parse_eof(&payload)?;
                self.status_flags = eof.status_flags;
                self.warnings = self.warnings.saturating_add(eof.warnings);
                self.finish_set();
                Ok(None)
            }
            Some(0xFF) => {
                let err = parse_err(&payload)?;
                self.result_state = ResultState::Idle;
                self.state = SessionState::Ready;
                Err(Error::Server(err))
            }
            Some(_) => Ok(Some(payload)),
            None => Err(protocol_error("empty row packet")),
        }
    }

    /// Move to the next chained result set, if the server announced one.
    pub(crate) fn advance_result(&mut self) -> Result<Option<Exchange>> {
        // Unread rows of the current set go first.
        while self.result_state == ResultState::Rows {
            self.fetch_row_payload()?;
        }
        if self.result_state != ResultState::MoreResults {
            return Ok(None);
        }
        self.result_state = ResultState::AwaitingResponse;
        let outcome = self.read_exchange();
        self.settle(outcome).map(Some)
    }

    /// Consume every outstanding response so the stream is request/response
    /// aligned again.
    pub fn drain_results(&mut self) -> Result<()> {
        loop {
            match self.result_state {
                ResultState::Idle => return Ok(()),
                ResultState::Rows => {
                    while self.fetch_row_payload()?.is_some() {}
                }
                ResultState::AwaitingResponse | ResultState::MoreResults => {
                    self.result_state = ResultState::AwaitingResponse;
                    match self.read_exchange() {
                        Ok(_) => {}
                        Err(Error::Server(_)) => {
                            // A failed trailing statement still completes
                            // the exchange.
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Caller-facing operations
    // ------------------------------------------------------------------

    /// Run a text-protocol statement and return a cursor over its response.
    pub fn execute(&mut self, sql: &str) -> Result<ResultCursor<'_>> {
        self.begin_command()?;
        let outcome = (|| {
            self.send_command(Command::Query, sql.as_bytes())?;
            self.read_exchange()
        })();
        let exchange = self.settle(outcome)?;
        Ok(ResultCursor::new(self, exchange, false))
    }

    /// Run a statement and discard every result set, returning the affected
    /// row count.
    pub fn execute_discard(&mut self, sql: &str) -> Result<u64> {
        self.begin_command()?;
        let outcome = (|| {
            self.send_command(Command::Query, sql.as_bytes())?;
            self.read_exchange()?;
            self.drain_results()
        })();
        self.settle(outcome)?;
        Ok(self.affected_rows)
    }

    /// Prepare a statement server-side. Named placeholders are rewritten to
    /// positional markers; the ordered name list rides on the handle.
    pub fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        let backslash_escapes = !self.has_status(server_status::NO_BACKSLASH_ESCAPES);
        let (rewritten, param_names) = rewrite_for_prepare(sql, false, backslash_escapes);

        self.begin_command()?;
        let outcome = (|| {
            self.transport.send_message(&build_prepare(&rewritten))?;
            self.result_state = ResultState::AwaitingResponse;

            let payload = self.transport.receive_message()?;
            if payload.first() == Some(&0xFF) {
                let err = parse_err(&payload)?;
                self.result_state = ResultState::Idle;
                return Err(Error::Server(err));
            }
            let ok = statement::parse_prepare_ok(&payload)
                .ok_or_else(|| protocol_error("malformed prepare response"))?;

            let params = if ok.num_params > 0 {
                self.read_column_block(usize::from(ok.num_params))?
            } else {
                Vec::new()
            };
            let columns = if ok.num_columns > 0 {
                self.read_column_block(usize::from(ok.num_columns))?
            } else {
                Vec::new()
            };
            self.result_state = ResultState::Idle;
            self.state = SessionState::Ready;
            Ok(PreparedStatement {
                statement_id: ok.statement_id,
                sql: rewritten.clone(),
                param_names,
                params,
                columns,
                types_sent: false,
                closed: false,
            })
        })();
        self.settle(outcome)
    }

    /// Execute a prepared statement with bound parameters.
    pub fn execute_prepared(
        &mut self,
        statement: &mut PreparedStatement,
        params: &[mywire_core::Value],
    ) -> Result<ResultCursor<'_>> {
        statement.ensure_open()?;
        if params.len() != statement.param_count() {
            return Err(usage_error(
                UsageErrorKind::ParameterMismatch,
                format!(
                    "statement expects {} parameters, got {}",
                    statement.param_count(),
                    params.len()
                ),
            ));
        }
        self.begin_command()?;
        let send_types = !statement.types_sent;
        let outcome = (|| {
            self.transport
                .send_message(&build_execute(statement.statement_id, params, send_types))?;
            self.result_state = ResultState::AwaitingResponse;
            self.read_exchange()
        })();
        let exchange = self.settle(outcome)?;
        statement.types_sent = true;
        Ok(ResultCursor::new(self, exchange, true))
    }

    /// Fetch rows from a server-side cursor opened by a prior execute.
    pub fn fetch(
        &mut self,
        statement: &PreparedStatement,
        rows: u32,
    ) -> Result<ResultCursor<'_>> {
        statement.ensure_open()?;
        self.begin_command()?;
        let outcome = (|| {
            self.transport
                .send_message(&build_fetch(statement.statement_id, rows))?;
            self.result_state = ResultState::Rows;
            Ok(())
        })();
        self.settle(outcome)?;
        let columns = Arc::new(statement.columns.clone());
        Ok(ResultCursor::new(self, Exchange::ResultSet(columns), true))
    }

    /// Free the server-side statement. The server sends no reply.
    pub fn close_statement(&mut self, statement: &mut PreparedStatement) -> Result<()> {
        statement.ensure_open()?;
        self.begin_command()?;
        let outcome = self
            .transport
            .send_message(&build_close(statement.statement_id));
        self.settle(outcome)?;
        statement.closed = true;
        self.state = SessionState::Ready;
        self.result_state = ResultState::Idle;
        Ok(())
    }

    /// Reset accumulated long data for a statement.
    pub fn reset_statement(&mut self, statement: &PreparedStatement) -> Result<()> {
        statement.ensure_open()?;
        self.begin_command()?;
        let outcome = (|| {
            self.transport
                .send_message(&build_reset(statement.statement_id))?;
            self.result_state = ResultState::AwaitingResponse;
            self.read_exchange()?;
            Ok(())
        })();
        self.settle(outcome)
    }

    /// Lightweight liveness probe.
    pub fn ping(&mut self) -> bool {
        if self.begin_command().is_err() {
            return false;
        }
        let outcome = (|| {
            self.send_command(Command::Ping, &[])?;
            self.read_exchange()
        })();
        self.settle(outcome).is_ok()
    }

    /// Switch the default database.
    pub fn set_database(&mut self, name: &str) -> Result<()> {
        self.begin_command()?;
        let outcome = (|| {
            self.send_command(Command::InitDb, name.as_bytes())?;
            self.read_exchange()?;
            Ok(())
        })();
        self.settle(outcome)
    }

    /// Reset server-side session state without re-authenticating. Servers
    /// too old for COM_RESET_CONNECTION get the re-authenticating fallback.
    pub fn reset(&mut self) -> Result<()> {
        if self.version >= (5, 7, 3) {
            self.begin_command()?;
            let outcome = (|| {
                self.send_command(Command::ResetConnection, &[])?;
                self.read_exchange()?;
                Ok(())
            })();
            self.settle(outcome)
        } else {
            self.change_user()
        }
    }

    /// Re-authenticate as the configured user, resetting all session state.
    pub fn change_user(&mut self) -> Result<()> {
        self.begin_command()?;
        let password = self.settings.password.clone().unwrap_or_default();
        let outcome = (|| {
            let credential = auth::scramble_411(&password, &self.auth_nonce);
            let mut w = ByteWriter::with_capacity(64);
            w.put_cstr(&self.settings.user);
            if self.capabilities & capabilities::SECURE_CONNECTION != 0 {
                w.put_u8(credential.len() as u8);
                w.put_bytes(&credential);
            } else {
                w.put_bytes(&credential);
                w.put_u8(0);
            }
            w.put_cstr(self.settings.database.as_deref().unwrap_or(""));
            w.put_u16_le(u16::from(self.settings.charset));
            if self.capabilities & capabilities::PLUGIN_AUTH != 0 {
                w.put_cstr(auth::plugins::NATIVE_PASSWORD);
            }
            self.send_command(Command::ChangeUser, w.as_slice())?;
            self.complete_authentication(&password)?;
            self.result_state = ResultState::Idle;
            self.state = SessionState::Ready;
            Ok(())
        })();
        self.settle(outcome)
    }

    /// Abort the in-flight command from a second, independent session by
    /// killing this session's server thread.
    pub fn cancel_query(&self, timeout: Duration) -> Result<()> {
        let settings = (*self.settings)
            .clone()
            .pooling(false)
            .connect_timeout(timeout)
            .command_timeout(timeout);
        let mut killer = Session::open(settings)?;
        killer.execute_discard(&format!("KILL QUERY {}", self.thread_id))?;
        killer.close();
        Ok(())
    }

    /// Kill this session's server thread entirely (used by pool clearing).
    pub fn kill_connection(&self, timeout: Duration) -> Result<()> {
        let settings = (*self.settings)
            .clone()
            .pooling(false)
            .connect_timeout(timeout)
            .command_timeout(timeout);
        let mut killer = Session::open(settings)?;
        killer.execute_discard(&format!("KILL {}", self.thread_id))?;
        killer.close();
        Ok(())
    }

    /// Send QUIT (best effort) and shut the transport down.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.state != SessionState::Broken {
            let _ = self.drain_results();
            self.transport.reset_sequence();
            let _ = self.transport.send_message(&[Command::Quit as u8]);
        }
        self.transport.close();
        self.state = SessionState::Closed;
        self.result_state = ResultState::Idle;
        tracing::debug!(thread_id = self.thread_id, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("thread_id", &self.thread_id)
            .field("server", &self.server_version)
            .field("endpoint", &self.settings.endpoint())
            .finish_non_exhaustive()
    }
}

/// Compute the credential for an authentication plugin.
fn compute_credential(plugin: &str, password: &str, nonce: &[u8]) -> Vec<u8> {
    match plugin {
        auth::plugins::NATIVE_PASSWORD => auth::scramble_411(password, nonce),
        auth::plugins::OLD_PASSWORD => {
            let nonce = &nonce[..nonce.len().min(8)];
            auth::scramble_323(password, nonce)
        }
        auth::plugins::CACHING_SHA2_PASSWORD => auth::scramble_caching_sha2(password, nonce),
        auth::plugins::CLEAR_PASSWORD => {
            let mut out = password.as_bytes().to_vec();
            out.push(0);
            out
        }
        _ => auth::scramble_411(password, nonce),
    }
}
