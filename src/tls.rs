use std::{fs, io::BufReader, path::Path, sync::Arc};

use anyhow::Context as _;
use rustls::{
    DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::parse_x509_certificate;

pub fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

pub fn load_server_identity(
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file = fs::File::open(cert_path)
        .with_context(|| format!("open TLS certificate {}", cert_path.display()))?;
    let cert_chain = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse TLS certificate {}", cert_path.display()))?;
    if cert_chain.is_empty() {
        anyhow::bail!("no CERTIFICATE blocks in {}", cert_path.display());
    }

    let key_file = fs::File::open(key_path)
        .with_context(|| format!("open TLS private key {}", key_path.display()))?;
    let private_key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("parse TLS private key {}", key_path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key block in {}", key_path.display()))?;

    Ok((cert_chain, private_key))
}

/// Builds the TLS server acceptor presenting the single provisioned
/// identity. Intercepted clients see this certificate for every host, so
/// they must trust it explicitly.
pub fn build_tls_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let (cert_chain, private_key) = load_server_identity(cert_path, key_path)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|err| anyhow::anyhow!("build TLS server certificate: {err}"))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub fn validate_identity(cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
    let (cert_chain, _) = load_server_identity(cert_path, key_path)?;
    for (index, cert) in cert_chain.iter().enumerate() {
        parse_x509_certificate(cert.as_ref()).map_err(|err| {
            anyhow::anyhow!(
                "parse certificate {index} in {}: {err}",
                cert_path.display()
            )
        })?;
    }
    Ok(())
}

/// TLS connector for the upstream leg of a tunnel. Certificate
/// verification is disabled on purpose: the proxy breaks the trust chain
/// in both directions.
pub fn insecure_upstream_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
