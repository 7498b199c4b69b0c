//! In-handshake TLS upgrade.
//!
//! When both sides advertise SSL and the settings ask for it, the session
//! sends the short SSL-request packet (capability flags, max packet size,
//! charset, 23 reserved bytes), upgrades the raw stream in place, then
//! resends the full handshake response over the encrypted stream. The
//! upgraded stream's sequence counter continues at 2, independent of the
//! plaintext counter.

use crate::protocol::capabilities;
use crate::protocol::codec::ByteWriter;
use crate::settings::ConnectionSettings;
#[cfg(feature = "tls")]
use crate::settings::SslMode;

#[cfg(feature = "tls")]
use crate::transport::{NetStream, TimedStream};
#[cfg(feature = "tls")]
use mywire_core::error::{TransportErrorKind, transport_error};
#[cfg(feature = "tls")]
use mywire_core::{Error, Result};
#[cfg(feature = "tls")]
use std::sync::Arc;

/// Build the partial handshake response announcing the TLS upgrade.
pub fn build_ssl_request(client_caps: u32, max_packet_size: u32, charset: u8) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(32);
    w.put_u32_le(client_caps | capabilities::SSL);
    w.put_u32_le(max_packet_size);
    w.put_u8(charset);
    w.put_zeros(23);
    w.into_vec()
}

/// Whether the server handshake advertised TLS support.
pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::SSL != 0
}

/// Perform the TLS client handshake over the timed stream, returning the
/// encrypted replacement.
#[cfg(feature = "tls")]
pub fn upgrade(stream: TimedStream, settings: &ConnectionSettings) -> Result<TimedStream> {
    let NetStream::Tcp(tcp) = stream.into_inner() else {
        return Err(transport_error(
            TransportErrorKind::Tls,
            "stream is already encrypted",
        ));
    };

    let config = build_client_config(settings)?;
    let server_name: rustls::pki_types::ServerName<'static> = settings
        .host
        .clone()
        .try_into()
        .map_err(|e| tls_error(format!("invalid server name '{}': {e}", settings.host)))?;

    let conn = rustls::ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| tls_error(format!("TLS setup failed: {e}")))?;

    let mut owned = rustls::StreamOwned::new(conn, tcp);
    // Drive the handshake to completion before handing the stream back;
    // rustls finishes it lazily on first use otherwise.
    while owned.conn.is_handshaking() {
        owned
            .conn
            .complete_io(&mut owned.sock)
            .map_err(|e| tls_error(format!("TLS handshake failed: {e}")))?;
    }
    tracing::debug!(
        host = %settings.host,
        version = ?owned.conn.protocol_version(),
        "TLS negotiated"
    );

    Ok(TimedStream::new(NetStream::Tls(Box::new(owned))))
}

#[cfg(not(feature = "tls"))]
pub fn upgrade(
    _stream: crate::transport::TimedStream,
    _settings: &ConnectionSettings,
) -> mywire_core::Result<crate::transport::TimedStream> {
    Err(mywire_core::error::config_error(
        "TLS requested but mywire was built without the `tls` feature",
    ))
}

#[cfg(feature = "tls")]
fn tls_error(message: String) -> Error {
    transport_error(TransportErrorKind::Tls, message)
}

#[cfg(feature = "tls")]
fn build_client_config(settings: &ConnectionSettings) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder();
    let config = match settings.ssl_mode {
        SslMode::Disable => {
            return Err(tls_error("TLS upgrade requested with ssl_mode=Disable".to_string()));
        }
        // Self-signed certificates are the norm for MySQL deployments that
        // have not opted into verification, so these modes encrypt without
        // authenticating the peer.
        SslMode::Preferred | SslMode::Required => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verify::AcceptAny))
            .with_no_client_auth(),
        SslMode::VerifyCa | SslMode::VerifyIdentity => {
            let roots = load_roots(settings)?;
            let base = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| tls_error(format!("failed to build certificate verifier: {e}")))?;
            if settings.ssl_mode == SslMode::VerifyCa {
                // Chain is checked, host name mismatches are tolerated.
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(verify::CaOnly { inner: base }))
                    .with_no_client_auth()
            } else {
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(base)
                    .with_no_client_auth()
            }
        }
    };
    Ok(config)
}

#[cfg(feature = "tls")]
fn load_roots(settings: &ConnectionSettings) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    match &settings.ssl_ca {
        Some(path) => {
            let pem = std::fs::read(path).map_err(|e| {
                tls_error(format!("cannot read CA certificate '{path}': {e}"))
            })?;
            let mut cursor = std::io::Cursor::new(pem);
            for cert in rustls_pemfile::certs(&mut cursor) {
                let cert =
                    cert.map_err(|e| tls_error(format!("malformed CA certificate: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| tls_error(format!("rejected CA certificate: {e}")))?;
            }
            if roots.is_empty() {
                return Err(tls_error(format!("no certificates found in '{path}'")));
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(roots)
}

#[cfg(feature = "tls")]
mod verify {
    use std::sync::Arc;

    use rustls::CertificateError;
    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    /// Accepts any server certificate: encryption without authentication.
    #[derive(Debug)]
    pub struct AcceptAny;

    impl ServerCertVerifier for AcceptAny {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
            ]
        }
    }

    /// Full chain validation, host name mismatch tolerated (VerifyCa).
    #[derive(Debug)]
    pub struct CaOnly {
        pub inner: Arc<WebPkiServerVerifier>,
    }

    impl ServerCertVerifier for CaOnly {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            match self.inner.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Err(RustlsError::InvalidCertificate(CertificateError::NotValidForName)) => {
                    Ok(ServerCertVerified::assertion())
                }
                other => other,
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            self.inner.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            self.inner.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.inner.supported_verify_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssl_request_layout() {
        let payload = build_ssl_request(capabilities::PROTOCOL_41, 0x0100_0000, 33);
        assert_eq!(payload.len(), 32);
        let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert!(caps & capabilities::SSL != 0);
        assert!(caps & capabilities::PROTOCOL_41 != 0);
        assert_eq!(payload[8], 33);
        assert!(payload[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn server_ssl_detection() {
        assert!(server_supports_ssl(capabilities::SSL));
        assert!(!server_supports_ssl(capabilities::PROTOCOL_41));
    }
}
