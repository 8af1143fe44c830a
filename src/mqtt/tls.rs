//! TLS material and server certificate verification.
//!
//! Broker certificates are issued for names that rarely match the address a
//! device dials, so hostname checks are skipped. Instead every certificate in
//! the presented chain is tried against the configured trust root, and the
//! handshake is accepted when any of them chains up to it.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::client::verify_server_cert_signed_by_trust_anchor;
use rumqttc::tokio_rustls::rustls::crypto::{
    ring, verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms,
};
use rumqttc::tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, ServerName, UnixTime,
};
use rumqttc::tokio_rustls::rustls::server::ParsedCertificate;
use rumqttc::tokio_rustls::rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore,
    SignatureScheme,
};
use tracing::{debug, warn};

use crate::error::{ConfigError, TransportError};

/// Trust root and optional client identity, loaded once at construction
pub struct TlsMaterial {
    roots: Vec<CertificateDer<'static>>,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("roots", &self.roots.len())
            .field("client_identity", &self.identity.is_some())
            .finish()
    }
}

impl TlsMaterial {
    pub fn load(
        ca_path: &Path,
        client_identity: Option<(&Path, &Path)>,
    ) -> Result<Self, ConfigError> {
        let roots = read_certs(ca_path)?;
        let identity = match client_identity {
            Some((cert_path, key_path)) => Some((read_certs(cert_path)?, read_key(key_path)?)),
            None => None,
        };
        debug!(
            "Loaded {} trust root(s) from {}",
            roots.len(),
            ca_path.display()
        );
        Ok(Self { roots, identity })
    }

    pub fn has_client_identity(&self) -> bool {
        self.identity.is_some()
    }

    pub fn client_config(&self) -> Result<ClientConfig, TransportError> {
        let mut store = RootCertStore::empty();
        let (added, ignored) = store.add_parsable_certificates(self.roots.iter().cloned());
        if ignored > 0 {
            warn!("Ignored {ignored} unparsable trust root certificate(s)");
        }
        if added == 0 {
            return Err(TransportError::Tls("no usable trust root".into()));
        }

        let verifier = ChainVerifier {
            roots: Arc::new(store),
            algorithms: ring::default_provider().signature_verification_algorithms,
        };
        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));

        match &self.identity {
            Some((chain, key)) => builder
                .with_client_auth_cert(chain.clone(), key.clone_key())
                .map_err(|e| TransportError::Tls(e.to_string())),
            None => Ok(builder.with_no_client_auth()),
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>, ConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ConfigError::TlsMaterial {
            path: path.to_path_buf(),
            source,
        })
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::TlsMaterial {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ConfigError::EmptyTlsMaterial(path.to_path_buf()));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| ConfigError::TlsMaterial {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| ConfigError::EmptyTlsMaterial(path.to_path_buf()))
}

#[derive(Debug)]
struct ChainVerifier {
    roots: Arc<RootCertStore>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for ChainVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        let presented: Vec<CertificateDer<'_>> = std::iter::once(end_entity)
            .chain(intermediates)
            .cloned()
            .collect();

        for cert in &presented {
            let Ok(parsed) = ParsedCertificate::try_from(cert) else {
                continue;
            };
            if verify_server_cert_signed_by_trust_anchor(
                &parsed,
                &self.roots,
                &presented,
                now,
                self.algorithms.all,
            )
            .is_ok()
            {
                return Ok(ServerCertVerified::assertion());
            }
        }

        warn!("No certificate in the presented chain verifies against the trust root");
        Err(RustlsError::InvalidCertificate(CertificateError::UnknownIssuer))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
