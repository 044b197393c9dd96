//! TLS client settings for connections made outside the `kube` client.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use super::{ClusterError, ClusterRecord, ClusterResult};

/// Client config honouring the record's CA bundle and `insecure_skip_tls_verify`.
///
/// Returns `None` when neither is set, leaving the public web PKI roots in charge.
pub(super) fn client_config(record: &ClusterRecord) -> ClusterResult<Option<Arc<ClientConfig>>> {
    let ca_data = record
        .certificate_authority_data
        .as_deref()
        .map(str::trim)
        .filter(|data| !data.is_empty());
    if ca_data.is_none() && !record.insecure_skip_tls_verify {
        return Ok(None);
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ClusterError::ConfigInvalid(format!("tls config error: {e}")))?;

    let config = if record.insecure_skip_tls_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
            .with_no_client_auth()
    } else {
        let roots = root_store(ca_data.unwrap_or_default())?;
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Some(Arc::new(config)))
}

fn root_store(ca_data: &str) -> ClusterResult<RootCertStore> {
    let pem = STANDARD
        .decode(ca_data)
        .map_err(|e| ClusterError::ConfigInvalid(format!("certificate authority data: {e}")))?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClusterError::ConfigInvalid(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(ClusterError::ConfigInvalid("no CA certificates found".to_string()));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| ClusterError::ConfigInvalid(format!("failed to add CA certificate: {e}")))?;
    }
    Ok(roots)
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Self-signed P-256 CA, base64 of its PEM as a kubeconfig would carry it.
    const TEST_CA: &str = "LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCk1JSUJpekNDQVRHZ0F3SUJBZ0lVY2VvL2RBSTFwOWtGQ2tDZS9HSjZNM3MzY1VVd0NnWUlLb1pJemowRUF3SXcKR2pFWU1CWUdBMVVFQXd3UGNHOWtkR1Z5YlMxMFpYTjBMV05oTUNBWERUSTJNVEF4T1RBNU5EWXpPVm9ZRHpJeApNall3T1RJMU1EazBOak01V2pBYU1SZ3dGZ1lEVlFRRERBOXdiMlIwWlhKdExYUmxjM1F0WTJFd1dUQVRCZ2NxCmhrak9QUUlCQmdncWhrak9QUU1CQndOQ0FBUlNTbEFkVGxMcFloek8vMlByVWdITDBSQTFKV2pvMWxmMUpMUmMKZlYreklQbHVsQUlYTFlpZlAzSjg0ajJRQjNNT2xMSzVSZ1pQcHBWamRabEZJZWVCbzFNd1VUQWRCZ05WSFE0RQpGZ1FVS3pGUExyWUNKMWgxVENOaFhTSjgxVEluKzVzd0h3WURWUjBqQkJnd0ZvQVVLekZQTHJZQ0oxaDFUQ05oClhTSjgxVEluKzVzd0R3WURWUjBUQVFIL0JBVXdBd0VCL3pBS0JnZ3Foa2pPUFFRREFnTklBREJGQWlBaFE0V1EKWUVaZGNXdGNnMzRxMFJSdXZ3cG5jeEJjRm5rTDZScmVpbHBHcGdJaEFNY1pjSUV5WTRqWWx2eHRrbWQ4R3dKOQpNSnhNdTRMcldWa1ZlTnFOUVI3LwotLS0tLUVORCBDRVJUSUZJQ0FURS0tLS0tCg==";

    fn record(ca: Option<&str>, insecure: bool) -> ClusterRecord {
        ClusterRecord {
            id: 1,
            name: "test".to_string(),
            server_url: "https://10.0.0.1:6443".to_string(),
            bearer_token: None,
            certificate_authority_data: ca.map(str::to_string),
            insecure_skip_tls_verify: insecure,
            created_at: String::new(),
        }
    }

    #[test]
    fn defaults_apply_without_ca_or_insecure_flag() {
        assert!(client_config(&record(None, false)).unwrap().is_none());
        assert!(client_config(&record(Some("  "), false)).unwrap().is_none());
    }

    #[test]
    fn stored_ca_becomes_the_only_root() {
        let roots = root_store(TEST_CA).unwrap();
        assert_eq!(roots.len(), 1);
        assert!(client_config(&record(Some(TEST_CA), false)).unwrap().is_some());
    }

    #[test]
    fn insecure_flag_installs_a_permissive_verifier() {
        assert!(client_config(&record(None, true)).unwrap().is_some());
        assert!(client_config(&record(Some(TEST_CA), true)).unwrap().is_some());

        let verifier = NoVerification {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        };
        let name = ServerName::try_from("kubernetes.default").unwrap();
        assert!(
            verifier
                .verify_server_cert(&CertificateDer::from(vec![0u8; 4]), &[], &name, &[], UnixTime::now())
                .is_ok()
        );
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[test]
    fn malformed_ca_data_is_rejected() {
        assert!(matches!(
            client_config(&record(Some("not base64!"), false)),
            Err(ClusterError::ConfigInvalid(_))
        ));
        let no_pem = STANDARD.encode("hello");
        assert!(matches!(
            client_config(&record(Some(&no_pem), false)),
            Err(ClusterError::ConfigInvalid(_))
        ));
    }
}
