//! Connection settings.
//!
//! One immutable bundle per logical connection: endpoint, credentials,
//! protocol toggles, timeouts, and the pooling limits the pool manager
//! reads. The canonical serialized form doubles as the pool-registry key.

use std::time::Duration;

use crate::protocol::{capabilities, charset};

/// TLS negotiation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never negotiate TLS
    #[default]
    Disable,
    /// Use TLS when the server offers it
    Preferred,
    /// Fail unless TLS is negotiated
    Required,
    /// Require TLS and a CA-verified server certificate
    VerifyCa,
    /// Require TLS and a certificate matching the host name
    VerifyIdentity,
}

impl SslMode {
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

/// Immutable per-connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Server host name or address
    pub host: String,
    /// Server port (default 3306)
    pub port: u16,
    /// Account name
    pub user: String,
    /// Account password
    pub password: Option<String>,
    /// Initial default database
    pub database: Option<String>,
    /// Character set id sent in the handshake
    pub charset: u8,
    /// TCP connect + handshake budget
    pub connect_timeout: Duration,
    /// Default per-command budget; zero disables enforcement
    pub command_timeout: Duration,
    /// Negotiate the compressed protocol
    pub compression: bool,
    /// TLS policy
    pub ssl_mode: SslMode,
    /// PEM file with the CA certificate(s) to trust
    pub ssl_ca: Option<String>,
    /// Report affected rows instead of found rows
    pub use_affected_rows: bool,
    /// Allow multi-statement batches
    pub allow_batch: bool,
    /// Register as an interactive client (server applies the interactive
    /// idle timeout)
    pub interactive: bool,
    /// Permit LOAD DATA LOCAL INFILE file streaming
    pub local_infile: bool,
    /// Largest logical message the client will send
    pub max_packet_size: u32,
    /// Decode BINARY(16) columns as 128-bit identifiers
    pub old_guids: bool,
    /// Decode blob columns as text when their name matches the include
    /// pattern (and not the exclude pattern)
    pub treat_blobs_as_text: bool,
    /// Regex of column names forced to text
    pub blob_text_include: Option<String>,
    /// Regex of column names kept binary even when included
    pub blob_text_exclude: Option<String>,
    /// Whether sessions are pooled at all
    pub pooling: bool,
    /// Best-effort idle floor per pool
    pub min_pool_size: usize,
    /// Hard cap on idle + in-use sessions per pool
    pub max_pool_size: usize,
    /// Maximum session age before it is retired; zero means unlimited
    pub connection_lifetime: Duration,
    /// Re-synchronize session state when a pooled session is checked out
    pub connection_reset: bool,
    /// Idle time after which the reaper may close a session
    pub idle_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT,
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(30),
            compression: false,
            ssl_mode: SslMode::default(),
            ssl_ca: None,
            use_affected_rows: false,
            allow_batch: true,
            interactive: false,
            local_infile: false,
            max_packet_size: 64 * 1024 * 1024,
            old_guids: false,
            treat_blobs_as_text: false,
            blob_text_include: None,
            blob_text_exclude: None,
            pooling: true,
            min_pool_size: 0,
            max_pool_size: 100,
            connection_lifetime: Duration::ZERO,
            connection_reset: false,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl ConnectionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn ssl_ca(mut self, path: impl Into<String>) -> Self {
        self.ssl_ca = Some(path.into());
        self
    }

    pub fn use_affected_rows(mut self, enabled: bool) -> Self {
        self.use_affected_rows = enabled;
        self
    }

    pub fn allow_batch(mut self, enabled: bool) -> Self {
        self.allow_batch = enabled;
        self
    }

    pub fn interactive(mut self, enabled: bool) -> Self {
        self.interactive = enabled;
        self
    }

    /// Streaming local files to the server is a data-exfiltration hazard;
    /// leave this off unless the deployment needs it.
    pub fn local_infile(mut self, enabled: bool) -> Self {
        self.local_infile = enabled;
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn old_guids(mut self, enabled: bool) -> Self {
        self.old_guids = enabled;
        self
    }

    pub fn treat_blobs_as_text(mut self, enabled: bool) -> Self {
        self.treat_blobs_as_text = enabled;
        self
    }

    pub fn blob_text_include(mut self, pattern: impl Into<String>) -> Self {
        self.blob_text_include = Some(pattern.into());
        self
    }

    pub fn blob_text_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.blob_text_exclude = Some(pattern.into());
        self
    }

    pub fn pooling(mut self, enabled: bool) -> Self {
        self.pooling = enabled;
        self
    }

    pub fn min_pool_size(mut self, size: usize) -> Self {
        self.min_pool_size = size;
        self
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    pub fn connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.connection_lifetime = lifetime;
        self
    }

    pub fn connection_reset(mut self, enabled: bool) -> Self {
        self.connection_reset = enabled;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Endpoint in `host:port` form.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Canonical serialized identity, used as the pool-registry key. Every
    /// field that changes what a physical session is participates.
    pub fn cache_key(&self) -> String {
        format!(
            "host={};port={};user={};password={};database={};charset={};compress={};ssl={:?};\
             affected={};batch={};interactive={};infile={};maxpacket={};guids={};blobtext={};\
             include={};exclude={}",
            self.host,
            self.port,
            self.user,
            self.password.as_deref().unwrap_or(""),
            self.database.as_deref().unwrap_or(""),
            self.charset,
            self.compression,
            self.ssl_mode,
            self.use_affected_rows,
            self.allow_batch,
            self.interactive,
            self.local_infile,
            self.max_packet_size,
            self.old_guids,
            self.treat_blobs_as_text,
            self.blob_text_include.as_deref().unwrap_or(""),
            self.blob_text_exclude.as_deref().unwrap_or(""),
        )
    }

    /// Capability flags the client asks for; the session intersects these
    /// with what the server advertises.
    pub fn capability_flags(&self) -> u32 {
        let mut flags = capabilities::PROTOCOL_41
            | capabilities::LONG_PASSWORD
            | capabilities::TRANSACTIONS
            | capabilities::SECURE_CONNECTION
            | capabilities::LONG_FLAG
            | capabilities::MULTI_RESULTS
            | capabilities::PS_MULTI_RESULTS
            | capabilities::PLUGIN_AUTH;

        if !self.use_affected_rows {
            flags |= capabilities::FOUND_ROWS;
        }
        if self.allow_batch {
            flags |= capabilities::MULTI_STATEMENTS;
        }
        if self.interactive {
            flags |= capabilities::INTERACTIVE;
        }
        if self.database.is_some() {
            flags |= capabilities::CONNECT_WITH_DB;
        }
        if self.compression {
            flags |= capabilities::COMPRESS;
        }
        if self.ssl_mode.should_try_ssl() {
            flags |= capabilities::SSL;
        }
        if self.local_infile {
            flags |= capabilities::LOCAL_FILES;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let settings = ConnectionSettings::new()
            .host("db.internal")
            .port(3307)
            .user("app")
            .password("hunter2")
            .database("orders")
            .compression(true)
            .max_pool_size(25)
            .connection_lifetime(Duration::from_secs(1800));

        assert_eq!(settings.host, "db.internal");
        assert_eq!(settings.port, 3307);
        assert_eq!(settings.endpoint(), "db.internal:3307");
        assert_eq!(settings.password.as_deref(), Some("hunter2"));
        assert!(settings.compression);
        assert_eq!(settings.max_pool_size, 25);
    }

    #[test]
    fn cache_key_distinguishes_endpoints() {
        let a = ConnectionSettings::new().host("a").user("u");
        let b = ConnectionSettings::new().host("b").user("u");
        let a2 = ConnectionSettings::new().host("a").user("u");
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), a2.cache_key());
    }

    #[test]
    fn cache_key_ignores_pool_shape() {
        // Pool sizing tunes the pool, not the physical session identity.
        let a = ConnectionSettings::new().max_pool_size(5);
        let b = ConnectionSettings::new().max_pool_size(50);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn capability_flags_follow_settings() {
        let settings = ConnectionSettings::new()
            .database("d")
            .compression(true)
            .ssl_mode(SslMode::Preferred);
        let flags = settings.capability_flags();
        assert!(flags & capabilities::CONNECT_WITH_DB != 0);
        assert!(flags & capabilities::COMPRESS != 0);
        assert!(flags & capabilities::SSL != 0);
        assert!(flags & capabilities::FOUND_ROWS != 0);

        let plain = ConnectionSettings::new().use_affected_rows(true);
        assert!(plain.capability_flags() & capabilities::FOUND_ROWS == 0);
        assert!(plain.capability_flags() & capabilities::SSL == 0);
    }

    #[test]
    fn ssl_mode_predicates() {
        assert!(!SslMode::Disable.should_try_ssl());
        assert!(SslMode::Preferred.should_try_ssl());
        assert!(!SslMode::Preferred.is_required());
        assert!(SslMode::VerifyIdentity.is_required());
    }
}
