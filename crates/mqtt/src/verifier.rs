//! Pinned-certificate verification.
//!
//! Brokers are authenticated against a small, explicit trust set instead of the
//! platform store:
//!
//! - [`TrustAnchors`]: the process-wide root certificates. By default the CA bundled
//!   with the crate (`certs/RootCA.crt`, parsed once on first use); deployments may
//!   point `ca_file` at their own PEM bundle instead.
//! - [`TrustStore`]: one per connection attempt, seeded from the anchors. Every
//!   certificate of a chain that verifies is added to it, so the trust set expands
//!   for the rest of that attempt. Re-adding a known certificate is not an error.
//! - [`CertificateVerifier`]: runs chain verification during the TLS handshake.
//!
//! Hostname identity is a separate step ([`verify_hostname`]). It runs only after
//! the handshake has completed, against the certificate the peer actually presented;
//! a verified chain alone never authorizes the connection.

use std::{
    collections::HashSet,
    fs,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use once_cell::sync::Lazy;
use rustls::{
    client::{verify_server_cert_signed_by_trust_anchor, verify_server_name},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
    server::ParsedCertificate,
    RootCertStore,
};
use tracing::{debug, trace};

use crate::error::{ConnectionError, TrustStoreError};

const BUNDLED_ROOT_CA: &[u8] = include_bytes!("../certs/RootCA.crt");

static BUNDLED_ANCHORS: Lazy<Result<TrustAnchors, TrustStoreError>> =
    Lazy::new(|| TrustAnchors::from_pem(BUNDLED_ROOT_CA, "bundled RootCA.crt"));

/// Root certificates every connection attempt starts from.
///
/// Cheap to clone; the DER blobs are shared.
#[derive(Debug, Clone)]
pub struct TrustAnchors {
    certs: Arc<Vec<CertificateDer<'static>>>,
}

impl TrustAnchors {
    /// The CA shipped with the crate. Parsed on first call, then cached.
    pub fn bundled() -> Result<Self, TrustStoreError> {
        BUNDLED_ANCHORS.clone()
    }

    /// Parses every certificate block of a PEM document.
    ///
    /// `source` only names the input in error messages.
    ///
    /// # Errors
    /// - `NoCertificates` if the document has no `CERTIFICATE` block
    /// - `InvalidCertificate` if a block is not a usable trust anchor
    pub fn from_pem(pem: &[u8], source: &str) -> Result<Self, TrustStoreError> {
        let mut reader = pem;
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TrustStoreError::InvalidCertificate(format!("{source}: {e}")))?;

        if certs.is_empty() {
            return Err(TrustStoreError::NoCertificates(source.to_string()));
        }

        let mut parsed = RootCertStore::empty();
        for cert in &certs {
            parsed
                .add(cert.clone())
                .map_err(|e| TrustStoreError::InvalidCertificate(format!("{source}: {e}")))?;
        }

        Ok(Self {
            certs: Arc::new(certs),
        })
    }

    /// Reads a PEM bundle from disk.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, TrustStoreError> {
        let path = path.as_ref();
        let pem = fs::read(path).map_err(|e| TrustStoreError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_pem(&pem, &path.display().to_string())
    }

    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }
}

/// Outcome of [`TrustStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// The exact certificate was already in the store.
    AlreadyTrusted,
}

/// Trust set for one connection attempt.
#[derive(Debug)]
pub struct TrustStore {
    roots: RootCertStore,
    known: HashSet<Vec<u8>>,
}

impl TrustStore {
    pub fn new(anchors: &TrustAnchors) -> Result<Self, TrustStoreError> {
        let mut store = Self {
            roots: RootCertStore::empty(),
            known: HashSet::new(),
        };
        for cert in anchors.certificates() {
            store.add(cert)?;
        }
        Ok(store)
    }

    pub fn add(&mut self, cert: &CertificateDer<'_>) -> Result<AddOutcome, TrustStoreError> {
        if self.known.contains(cert.as_ref()) {
            return Ok(AddOutcome::AlreadyTrusted);
        }
        self.roots
            .add(cert.clone())
            .map_err(|e| TrustStoreError::InvalidCertificate(e.to_string()))?;
        self.known.insert(cert.to_vec());
        Ok(AddOutcome::Added)
    }

    pub fn contains(&self, cert: &CertificateDer<'_>) -> bool {
        self.known.contains(cert.as_ref())
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn roots(&self) -> &RootCertStore {
        &self.roots
    }
}

/// Verifies peer chains for one connection attempt to `host`.
///
/// Shared with the TLS layer, which calls [`verify_chain`](Self::verify_chain)
/// from inside the handshake; the store is behind a mutex for that reason.
#[derive(Debug)]
pub struct CertificateVerifier {
    host: String,
    store: Mutex<TrustStore>,
    provider: Arc<CryptoProvider>,
}

impl CertificateVerifier {
    pub fn new(store: TrustStore, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            store: Mutex::new(store),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }

    /// Verifies `end_entity` (helped by any presented `intermediates`) against
    /// the trust store, then adds every presented certificate to the store.
    ///
    /// Does not look at the hostname.
    ///
    /// # Errors
    /// `ConnectionError::Certificate` with
    /// `"Unable to verify the certificate for {host}"` when no path to a trusted
    /// certificate exists, or when a verified certificate cannot be stored.
    pub fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), ConnectionError> {
        let parsed = ParsedCertificate::try_from(end_entity).map_err(|e| {
            debug!("Peer certificate for {} is unparseable: {e}", self.host);
            self.untrusted()
        })?;

        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        verify_server_cert_signed_by_trust_anchor(
            &parsed,
            store.roots(),
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )
        .map_err(|e| {
            debug!("Chain verification for {} failed: {e}", self.host);
            self.untrusted()
        })?;

        for cert in std::iter::once(end_entity).chain(intermediates) {
            match store.add(cert) {
                Ok(AddOutcome::Added) => trace!("Trusting presented certificate"),
                Ok(AddOutcome::AlreadyTrusted) => trace!("Presented certificate already trusted"),
                Err(e) => return Err(ConnectionError::Certificate(e.to_string())),
            }
        }
        Ok(())
    }

    /// Number of certificates currently trusted, anchors included.
    pub fn trusted_count(&self) -> usize {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn untrusted(&self) -> ConnectionError {
        ConnectionError::Certificate(format!(
            "Unable to verify the certificate for {}",
            self.host
        ))
    }
}

/// Checks that `cert` names `host` (DNS SAN or IP address).
pub fn verify_hostname(cert: &CertificateDer<'_>, host: &str) -> Result<(), ConnectionError> {
    let mismatch = || {
        ConnectionError::Certificate(format!(
            "The hostname {host} does not match the server certificate"
        ))
    };

    let parsed = ParsedCertificate::try_from(cert).map_err(|_| mismatch())?;
    let name = ServerName::try_from(host).map_err(|_| mismatch())?;
    verify_server_name(&parsed, &name).map_err(|e| {
        debug!("Hostname verification for {host} failed: {e}");
        mismatch()
    })
}
