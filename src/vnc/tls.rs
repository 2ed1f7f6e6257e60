//! TLS channel used by the TLS and VeNCrypt security types.
//!
//! rustls has no anonymous Diffie-Hellman suites, so the "anonymous" modes run
//! ordinary TLS with a verifier that accepts any server certificate while still
//! checking the handshake signatures. The X.509 modes verify against the CA
//! bundle (and CRL) supplied through the credential callback. In both modes the
//! outcome of certificate validation is handed to
//! [`ClientHandler::verify_certificate`](super::client::ClientHandler::verify_certificate),
//! which has the final say.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme, StreamOwned};

use super::auth::X509Credential;
use super::error::{Result, RfbError};
use super::stream::Transport;

/// How the server certificate is judged.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Any certificate is acceptable.
    Anonymous,
    /// Certificates must chain to the supplied CA.
    X509(X509Credential),
}

/// Handshake parameters.
#[derive(Debug, Clone)]
pub struct TlsParams {
    /// Name presented for SNI and checked in X.509 mode.
    pub server_name: String,
    /// Attempts allowed while the socket reports would-block during the handshake.
    pub handshake_retries: u32,
    /// Pause between those attempts.
    pub retry_delay: Duration,
}

/// Records the built-in validation outcome instead of failing the handshake,
/// so the caller's certificate callback can overrule it.
#[derive(Debug)]
struct DeferredVerifier {
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    failure: Mutex<Option<rustls::Error>>,
}

impl DeferredVerifier {
    fn take_failure(&self) -> Option<rustls::Error> {
        match self.failure.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl ServerCertVerifier for DeferredVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if let Some(webpki) = &self.webpki {
            if let Err(e) = webpki.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
                debug!("built-in certificate validation failed: {}", e);
                match self.failure.lock() {
                    Ok(mut guard) => *guard = Some(e),
                    Err(poisoned) => *poisoned.into_inner() = Some(e),
                }
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn pem_error(path: &Path, err: impl std::fmt::Display) -> RfbError {
    RfbError::Io(io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", path.display(), err)))
}

fn load_roots(ca_cert: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let Some(path) = ca_cert else {
        warn!("no CA certificate supplied; server certificate cannot be validated");
        return Ok(roots);
    };
    for cert in CertificateDer::pem_file_iter(path).map_err(|e| pem_error(path, e))? {
        roots.add(cert.map_err(|e| pem_error(path, e))?)?;
    }
    info!("loaded {} CA certificate(s) from {}", roots.len(), path.display());
    Ok(roots)
}

fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let crls = CertificateRevocationListDer::pem_file_iter(path)
        .map_err(|e| pem_error(path, e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| pem_error(path, e))?;
    info!("loaded {} CRL(s) from {}", crls.len(), path.display());
    Ok(crls)
}

fn build_config(mode: &TlsMode) -> Result<(Arc<rustls::ClientConfig>, Arc<DeferredVerifier>)> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let (webpki, credential) = match mode {
        TlsMode::Anonymous => (None, None),
        TlsMode::X509(cred) => {
            let roots = load_roots(cred.ca_cert.as_deref())?;
            let webpki = if roots.is_empty() {
                None
            } else {
                let mut builder = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone());
                if let Some(crl) = &cred.ca_crl {
                    builder = builder.with_crls(load_crls(crl)?);
                }
                Some(builder.build().map_err(|e| RfbError::Tls(rustls::Error::General(e.to_string())))?)
            };
            (webpki, Some(cred))
        }
    };

    let verifier = Arc::new(DeferredVerifier {
        webpki,
        provider: provider.clone(),
        failure: Mutex::new(match (mode, credential) {
            (TlsMode::X509(_), Some(cred)) if cred.ca_cert.is_none() => {
                Some(rustls::Error::General("no CA certificate to validate against".into()))
            }
            _ => None,
        }),
    });

    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier.clone());

    let config = match credential {
        Some(X509Credential { client_cert: Some(cert_path), client_key: Some(key_path), .. }) => {
            let certs = CertificateDer::pem_file_iter(cert_path)
                .map_err(|e| pem_error(cert_path, e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| pem_error(cert_path, e))?;
            let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| pem_error(key_path, e))?;
            builder.with_client_auth_cert(certs, key)?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok((Arc::new(config), verifier))
}

/// An established TLS session over a [`Transport`].
pub struct TlsChannel<S: Transport> {
    stream: StreamOwned<ClientConnection, S>,
}

impl<S: Transport> TlsChannel<S> {
    /// Performs the client handshake over `sock`.
    ///
    /// `check` receives the server's end-entity certificate (DER) and whether
    /// built-in validation passed; returning `false` aborts the session.
    pub fn connect<F>(sock: S, mode: &TlsMode, params: &TlsParams, check: F) -> Result<Self>
    where
        F: FnOnce(&[u8], bool) -> bool,
    {
        let (config, verifier) = build_config(mode)?;
        let name = ServerName::try_from(params.server_name.clone())
            .map_err(|e| RfbError::Tls(rustls::Error::General(format!("invalid server name: {e}"))))?;
        let conn = ClientConnection::new(config, name)?;
        let mut stream = StreamOwned::new(conn, sock);

        let mut attempts = 0u32;
        while stream.conn.is_handshaking() {
            match stream.conn.complete_io(&mut stream.sock) {
                Ok(_) => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    attempts += 1;
                    if attempts >= params.handshake_retries {
                        warn!("TLS handshake gave up after {} attempts", attempts);
                        return Err(RfbError::TransportTimeout);
                    }
                    debug!("TLS handshake would block, retry {}/{}", attempts, params.handshake_retries);
                    std::thread::sleep(params.retry_delay);
                }
                Err(e) => return Err(tls_io_error(e)),
            }
        }

        let failure = verifier.take_failure();
        let accepted = match stream.conn.peer_certificates().and_then(|c| c.first()) {
            Some(cert) => check(cert.as_ref(), failure.is_none()),
            None => false,
        };
        if !accepted {
            return Err(RfbError::Tls(
                failure.unwrap_or_else(|| rustls::Error::General("server certificate rejected".into())),
            ));
        }

        info!(
            "TLS established ({:?}, {:?})",
            stream.conn.protocol_version(),
            stream.conn.negotiated_cipher_suite().map(|s| s.suite())
        );
        Ok(Self { stream })
    }
}

/// Unwraps a rustls error that travelled through `io::Error`.
fn tls_io_error(err: io::Error) -> RfbError {
    if let Some(tls) = err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        return RfbError::Tls(tls.clone());
    }
    err.into()
}

impl<S: Transport> Read for TlsChannel<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl<S: Transport> Write for TlsChannel<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl<S: Transport> Transport for TlsChannel<S> {
    fn wait_for_data(&mut self, timeout: Duration) -> io::Result<bool> {
        let state = self
            .stream
            .conn
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if state.plaintext_bytes_to_read() > 0 || state.peer_has_closed() {
            return Ok(true);
        }
        self.stream.sock.wait_for_data(timeout)
    }
}
