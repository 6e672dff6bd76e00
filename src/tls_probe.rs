use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::parse_x509_certificate;

use crate::models::TlsFinding;

/// Handshake budget. TLS probing happens after the port is known open, so
/// this is independent of the adaptive probe timeout.
const TLS_TIMEOUT: Duration = Duration::from_secs(5);

/// Verifier that accepts any certificate. Reconnaissance wants the peer's
/// certificate contents, including expired and self-signed ones that a
/// validating client would reject before we could read them.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
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
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Client config with validation disabled, shared with the HTTPS fetch in
/// the HTTP prober.
pub(crate) fn permissive_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    Arc::new(config)
}

/// Handshake with the target and pull protocol, cipher, and certificate
/// details. `None` means no TLS service answered; per-field gaps inside the
/// finding mean the handshake worked but the certificate was absent or
/// unparseable.
pub async fn probe(ip: IpAddr, host: &str, port: u16) -> Option<TlsFinding> {
    let connector = TlsConnector::from(permissive_config());
    let server_name = match ServerName::try_from(host.to_string()) {
        Ok(name) => name,
        Err(_) => ServerName::IpAddress(ip.into()),
    };

    let stream = match timeout(TLS_TIMEOUT, TcpStream::connect((ip, port))).await {
        Ok(Ok(s)) => s,
        _ => {
            debug!("[TLS Scan:{}:{}] Connection failed", ip, port);
            return None;
        }
    };

    let tls = match timeout(TLS_TIMEOUT, connector.connect(server_name, stream)).await {
        Ok(Ok(t)) => t,
        Ok(Err(e)) => {
            debug!("[TLS Scan:{}:{}] Handshake failed: {}", ip, port, e);
            return None;
        }
        Err(_) => {
            debug!("[TLS Scan:{}:{}] Handshake timed out", ip, port);
            return None;
        }
    };

    let (_, conn) = tls.get_ref();
    let mut finding = TlsFinding {
        version: conn.protocol_version().map(protocol_name),
        cipher: conn
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite())),
        ..TlsFinding::default()
    };

    if let Some(certs) = conn.peer_certificates() {
        if let Some(leaf) = certs.first() {
            fill_certificate_details(&mut finding, leaf.as_ref());
        }
    }

    debug!(
        "[TLS Scan:{}:{}] version={:?} cipher={:?}",
        ip, port, finding.version, finding.cipher
    );
    Some(finding)
}

fn protocol_name(version: rustls::ProtocolVersion) -> String {
    match version {
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        other => format!("{:?}", other),
    }
}

fn fill_certificate_details(finding: &mut TlsFinding, der: &[u8]) {
    finding.fingerprint_sha256 = Some(hex_fingerprint(der));

    let (_, cert) = match parse_x509_certificate(der) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("[TLS Scan] Certificate parse failed: {}", e);
            return;
        }
    };

    finding.subject = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
        .or_else(|| Some(cert.subject().to_string()));
    finding.issuer = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
        .or_else(|| Some(cert.issuer().to_string()));
    finding.valid_from = Some(cert.validity().not_before.to_datetime().to_string());
    finding.valid_to = Some(cert.validity().not_after.to_datetime().to_string());

    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(dns) => finding.san.push((*dns).to_string()),
                    other => finding.san.push(other.to_string()),
                }
            }
        }
    }
}

fn hex_fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
