//! TLS material loading for the tunnel port

use crate::{ServerError, TlsMaterial};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

pub(crate) fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path).map_err(|e| ServerError::TlsMaterial {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsMaterial {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path).map_err(|e| ServerError::TlsMaterial {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::TlsMaterial {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| ServerError::TlsMaterial {
            path: path.to_path_buf(),
            reason: "no private key found".to_string(),
        })
}

/// Build the rustls server config from the CLI-supplied material.
///
/// When `--ca` anchors are present, client certificates are verified against
/// them if a client offers one; connections without a certificate are still
/// accepted.
pub fn build_server_config(material: &TlsMaterial) -> Result<rustls::ServerConfig, ServerError> {
    ensure_crypto_provider();

    let certs = load_certs(&material.cert)?;
    let key = load_private_key(&material.key)?;

    let builder = if material.ca.is_empty() {
        rustls::ServerConfig::builder().with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        for path in &material.ca {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(|e| ServerError::TlsMaterial {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            }
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .allow_unauthenticated()
            .build()
            .map_err(|e| ServerError::TlsConfig(e.to_string()))?;
        rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
    };

    builder
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::TlsConfig(e.to_string()))
}

/// Connector used by the cleartext proxy front-end to reach the tunnel port
/// over loopback when it runs TLS. The certificate there may well be
/// self-signed, so verification is skipped for this loopback hop only.
pub(crate) fn loopback_connector() -> tokio_rustls::TlsConnector {
    ensure_crypto_provider();
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipVerification::new())
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

pub(crate) fn loopback_server_name() -> ServerName<'static> {
    // "localhost" always parses as a DNS name.
    ServerName::try_from("localhost").unwrap()
}

// Certificate verifier that skips verification (loopback hop only)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_self_signed(dir: &tempfile::TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();

        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        File::create(&cert_path)
            .unwrap()
            .write_all(cert.pem().as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(key_pair.serialize_pem().as_bytes())
            .unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn loads_pem_material() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(&dir);

        let config = build_server_config(&TlsMaterial {
            cert: cert_path,
            key: key_path,
            ca: vec![],
        });
        assert!(config.is_ok());
    }

    #[test]
    fn missing_files_are_reported() {
        let err = build_server_config(&TlsMaterial {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
            ca: vec![],
        })
        .unwrap_err();
        assert!(matches!(err, ServerError::TlsMaterial { .. }));
    }

    #[test]
    fn ca_anchors_enable_optional_client_auth() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(&dir);

        let config = build_server_config(&TlsMaterial {
            cert: cert_path.clone(),
            key: key_path,
            ca: vec![cert_path],
        });
        assert!(config.is_ok());
    }
}
