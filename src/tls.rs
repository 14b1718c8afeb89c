use anyhow::{Context, Result, anyhow};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use rustls_pemfile::certs;
use std::{fs::File, io::BufReader, path::PathBuf, sync::Arc};

/// Verification policy for the outbound leg of HTTPS relays. Set once at startup.
#[derive(Debug, Clone, Default)]
pub struct TlsPolicy {
    pub insecure_skip_verify: bool,
    /// Extra PEM trust anchors, used instead of the bundled web roots.
    pub ca_file: Option<PathBuf>,
}

pub fn load_tls_config(policy: &TlsPolicy) -> Result<ClientConfig> {
    let mut config = if policy.insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerification))
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .with_root_certificates(load_roots(policy)?)
            .with_no_client_auth()
    };

    // Outbound exchanges are HTTP/1.1 only.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn load_roots(policy: &TlsPolicy) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    let Some(path) = &policy.ca_file else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    };

    let ca_file = File::open(path)
        .with_context(|| format!("Failed to open CA file: {}", path.display()))?;
    let ca_certs = certs(&mut BufReader::new(ca_file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse CA file")?;

    if ca_certs.is_empty() {
        return Err(anyhow!("No certificates found in CA file"));
    }

    for cert in ca_certs {
        roots
            .add(cert)
            .context("Failed to add CA certificate to trust store")?;
    }
    Ok(roots)
}

/// Accepts any server certificate. Only installed when verification is disabled.
#[derive(Debug)]
struct SkipVerification;

impl ServerCertVerifier for SkipVerification {
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

    #[test]
    fn builds_verifying_config_from_web_roots() {
        let config = load_tls_config(&TlsPolicy::default()).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn builds_insecure_config() {
        let policy = TlsPolicy {
            insecure_skip_verify: true,
            ca_file: None,
        };
        assert!(load_tls_config(&policy).is_ok());
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        let policy = TlsPolicy {
            insecure_skip_verify: false,
            ca_file: Some(PathBuf::from("/nonexistent/railtail-ca.pem")),
        };
        let err = load_tls_config(&policy).unwrap_err();
        assert!(err.to_string().contains("Failed to open CA file"));
    }
}
