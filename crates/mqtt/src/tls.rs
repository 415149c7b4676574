//! TLS upgrade of an established transport.
//!
//! rustls is configured with a custom [`ServerCertVerifier`] that hands chain
//! verification to the connection attempt's [`CertificateVerifier`] and skips the
//! built-in hostname check. The hostname is verified by the session once the
//! handshake has completed, using the certificate returned by [`start_tls`].

use std::sync::{Arc, Mutex, PoisonError};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, warn};

use crate::{error::ConnectionError, transport::BoxedStream, verifier::CertificateVerifier};

/// Records what the peer presented and why it was rejected, if it was.
#[derive(Debug)]
struct PinnedCertVerifier {
    verifier: Arc<CertificateVerifier>,
    rejection: Mutex<Option<ConnectionError>>,
}

impl PinnedCertVerifier {
    fn new(verifier: Arc<CertificateVerifier>) -> Self {
        Self {
            verifier,
            rejection: Mutex::new(None),
        }
    }

    fn take_rejection(&self) -> Option<ConnectionError> {
        self.rejection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.verifier.verify_chain(end_entity, intermediates, now) {
            Ok(()) => Ok(ServerCertVerified::assertion()),
            Err(err) => {
                warn!("Rejecting peer certificate: {err}");
                *self
                    .rejection
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(err);
                Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::UnknownIssuer,
                ))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.verifier.provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.verifier.provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.verifier
            .provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Performs the client handshake over `stream`.
///
/// # Returns
/// The encrypted stream and the end-entity certificate the peer presented
/// (`None` only if the peer somehow completed without one).
///
/// # Errors
/// - `ConnectionError::Certificate` when the chain was rejected
/// - `ConnectionError::Transport` for any other handshake failure
pub async fn start_tls(
    stream: BoxedStream,
    verifier: Arc<CertificateVerifier>,
) -> Result<(TlsStream<BoxedStream>, Option<CertificateDer<'static>>), ConnectionError> {
    let host = verifier.host().to_string();
    let pinned = Arc::new(PinnedCertVerifier::new(verifier.clone()));

    let config = ClientConfig::builder_with_provider(verifier.provider().clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectionError::Transport {
            kind: std::io::ErrorKind::Other,
            message: e.to_string(),
        })?
        .dangerous()
        .with_custom_certificate_verifier(pinned.clone())
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.clone()).map_err(|_| {
        ConnectionError::Certificate(format!("The hostname {host} is not a valid server name"))
    })?;

    match TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
    {
        Ok(tls) => {
            let peer = tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.clone().into_owned());
            debug!("TLS handshake with {host} completed");
            Ok((tls, peer))
        }
        Err(e) => Err(pinned.take_rejection().unwrap_or_else(|| e.into())),
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::test_server::acceptor;
    use super::*;
    use crate::verifier::{fixtures::*, verify_hostname, TrustStore};

    fn verifier(host: &str) -> Arc<CertificateVerifier> {
        Arc::new(CertificateVerifier::new(
            TrustStore::new(&test_anchors()).unwrap(),
            host,
        ))
    }

    #[tokio::test]
    async fn test_start_tls_with_trusted_broker() {
        let (client, server) = duplex(16 * 1024);
        let acceptor = acceptor(&[SERVER_CERT], SERVER_KEY);
        let broker = tokio::spawn(async move {
            let mut tls = acceptor.accept(server).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            buf
        });

        let verifier = verifier("broker.test.local");
        let (mut tls, peer) = start_tls(Box::new(client), verifier.clone())
            .await
            .unwrap();
        let peer = peer.unwrap();
        assert_eq!(peer, cert(SERVER_CERT));
        assert!(verify_hostname(&peer, "broker.test.local").is_ok());
        assert_eq!(verifier.trusted_count(), 2);

        tls.write_all(b"ping").await.unwrap();
        tls.flush().await.unwrap();
        assert_eq!(&broker.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_start_tls_with_intermediate_chain() {
        let (client, server) = duplex(16 * 1024);
        let acceptor = acceptor(&[CHAINED_SERVER_CERT, INTERMEDIATE_CA], CHAINED_SERVER_KEY);
        tokio::spawn(async move {
            let _ = acceptor.accept(server).await;
        });

        let verifier = verifier("broker.test.local");
        let (_tls, peer) = start_tls(Box::new(client), verifier.clone())
            .await
            .unwrap();
        assert_eq!(peer.unwrap(), cert(CHAINED_SERVER_CERT));
        assert_eq!(verifier.trusted_count(), 3);
    }

    #[tokio::test]
    async fn test_start_tls_rejects_untrusted_chain() {
        let (client, server) = duplex(16 * 1024);
        let acceptor = acceptor(&[ROGUE_SERVER_CERT], ROGUE_SERVER_KEY);
        tokio::spawn(async move {
            let _ = acceptor.accept(server).await;
        });

        let Err(err) = start_tls(Box::new(client), verifier("broker.test.local")).await else {
            panic!("untrusted chain must be rejected");
        };
        assert_eq!(
            err,
            ConnectionError::Certificate(
                "Unable to verify the certificate for broker.test.local".into()
            )
        );
    }
}
