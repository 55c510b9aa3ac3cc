use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// How strictly the server certificate is checked against the trust material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerVerify {
    #[default]
    Required,
    /// Accept any certificate. Only useful to diagnose trust material problems.
    None,
}

pub fn connector(trust: &[PathBuf], verify: PeerVerify) -> Result<TlsConnector> {
    if trust.is_empty() {
        return Err(Error::InvalidConfig(
            "secure transport requires trust material".to_string(),
        ));
    }

    let mut roots = RootCertStore::empty();
    for path in trust {
        let certs = CertificateDer::pem_file_iter(path).map_err(|err| {
            Error::InvalidConfig(format!("unable to read {}: {err}", path.display()))
        })?;
        for cert in certs {
            let cert = cert.map_err(|err| {
                Error::InvalidConfig(format!("invalid certificate in {}: {err}", path.display()))
            })?;
            roots.add(cert).map_err(|err| {
                Error::InvalidConfig(format!("rejected certificate in {}: {err}", path.display()))
            })?;
        }
    }
    debug!("loaded {} trusted certificates", roots.len());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|err| Error::InvalidConfig(err.to_string()))?;
    let config = match verify {
        PeerVerify::Required => builder.with_root_certificates(roots).with_no_client_auth(),
        PeerVerify::None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|err| Error::InvalidConfig(format!("invalid server name {host:?}: {err}")))
}

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
