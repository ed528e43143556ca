//! TLS configuration of R66 servers and clients.
//!
//! Certificates come from the credential store:
//! - a server presents its agent's `tls_certificate` and requests (without
//!   requiring) a client certificate, trusted when it is registered on one of
//!   the agent's accounts or signed by a known authority
//! - a client presents its account's `tls_certificate`, if any, and trusts the
//!   partner's `trusted_tls_certificate`s and the known authorities
//!
//! Old R66 installations all ship the same legacy certificate. It is only
//! accepted when [`LegacyCertCompat`] is enabled, in which case the
//! `r66_legacy_certificate` credential marks the agents and accounts allowed to use it.

use common::model::{CredentialType, LocalAgent, Owner, RemoteAccount, RemoteAgent};
use common::store::{DbError, Store};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{VerifierBuilderError, WebPkiServerVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig,
    SignatureScheme,
};
use std::sync::Arc;

/// Environment variable enabling the legacy certificate (`1` to enable).
pub const LEGACY_CERT_ENV: &str = "MFTGW_R66_LEGACY_CERT";

const SHA1_SIGNATURES: [&str; 3] = [
    "1.2.840.113549.1.1.5", // sha1WithRSAEncryption
    "1.2.840.10045.4.1",    // ecdsa-with-SHA1
    "1.2.840.10040.4.3",    // dsa-with-sha1
];

#[derive(Debug, thiserror::Error)]
pub enum TlsSetupError {
    #[error("failed to load credentials: {0}")]
    Db(#[from] DbError),
    #[error("invalid certificate {name:?}: {reason}")]
    InvalidCertificate { name: String, reason: String },
    #[error("no TLS certificate configured for {0:?}")]
    NoCertificates(String),
    #[error("no trusted certificate configured for partner {0:?}")]
    NoTrustedCertificates(String),
    #[error("legacy certificate compatibility is enabled but no legacy certificate is configured")]
    MissingLegacyIdentity,
    #[error("invalid certificate verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

fn invalid(name: &str, reason: impl std::fmt::Display) -> TlsSetupError {
    TlsSetupError::InvalidCertificate {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Parses a PEM certificate chain.
pub fn parse_certs(name: &str, pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| invalid(name, err))?;
    if certs.is_empty() {
        return Err(invalid(name, "no certificate found in PEM data"));
    }
    Ok(certs)
}

/// Parses a PEM private key.
pub fn parse_key(name: &str, pem: &str) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|err| invalid(name, err))?
        .ok_or_else(|| invalid(name, "no private key found in PEM data"))
}

fn signature_of(der: &[u8]) -> Option<Vec<u8>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    Some(cert.signature_value.data.to_vec())
}

/// Subject common name of a DER certificate.
pub fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

/// Logs a deprecation warning for SHA-1 signed certificates. Never fails.
pub fn warn_if_sha1(der: &[u8]) {
    let Ok((_, cert)) = x509_parser::parse_x509_certificate(der) else {
        return;
    };
    let oid = cert.signature_algorithm.algorithm.to_id_string();
    if SHA1_SIGNATURES.contains(&oid.as_str()) {
        tracing::warn!(
            "peer certificate {:?} is signed with SHA-1, which is deprecated and will be refused in a future version",
            cert.subject().to_string()
        );
    }
}

/// The legacy certificate and its key.
#[derive(Debug)]
pub struct LegacyIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    signature: Vec<u8>,
}

impl LegacyIdentity {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TlsSetupError> {
        let certs = parse_certs("legacy certificate", cert_pem)?;
        let key = parse_key("legacy certificate", key_pem)?;
        let signature = signature_of(certs[0].as_ref())
            .ok_or_else(|| invalid("legacy certificate", "malformed X.509 certificate"))?;
        Ok(Self { certs, key, signature })
    }
}

/// Whether the legacy certificate is accepted, and which one it is.
#[derive(Debug, Clone, Default)]
pub struct LegacyCertCompat {
    enabled: bool,
    identity: Option<Arc<LegacyIdentity>>,
}

impl LegacyCertCompat {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(enabled: bool, identity: Option<LegacyIdentity>) -> Self {
        Self {
            enabled,
            identity: identity.map(Arc::new),
        }
    }

    /// Reads [`LEGACY_CERT_ENV`]. Meant to be called once at start-up.
    pub fn enabled_by_env() -> bool {
        std::env::var(LEGACY_CERT_ENV).is_ok_and(|value| value == "1")
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn identity(&self) -> Result<&LegacyIdentity, TlsSetupError> {
        self.identity.as_deref().ok_or(TlsSetupError::MissingLegacyIdentity)
    }

    /// Whether `cert` is the legacy certificate, compared by signature bytes.
    /// Always `false` while compatibility is disabled.
    pub fn is_legacy(&self, cert: &CertificateDer<'_>) -> bool {
        if !self.enabled {
            return false;
        }
        match (&self.identity, signature_of(cert.as_ref())) {
            (Some(identity), Some(signature)) => identity.signature == signature,
            _ => false,
        }
    }
}

fn algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

fn roots(certs: &[CertificateDer<'static>]) -> Result<RootCertStore, TlsSetupError> {
    let mut store = RootCertStore::empty();
    for cert in certs {
        store.add(cert.clone())?;
    }
    Ok(store)
}

fn authorities(store: &dyn Store, host: Option<&str>) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let mut certs = Vec::new();
    for authority in store.authorities()? {
        let vouches = authority.valid_hosts.is_empty()
            || host.is_some_and(|host| authority.valid_hosts.iter().any(|h| h == host));
        if vouches {
            certs.extend(parse_certs(&authority.name, &authority.public_identity)?);
        }
    }
    Ok(certs)
}

fn owned_identity(
    store: &dyn Store,
    owner: Owner,
    owner_name: &str,
    compat: &LegacyCertCompat,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, TlsSetupError> {
    let creds = store.credentials(owner)?;
    if creds.iter().any(|c| c.kind == CredentialType::R66LegacyCertificate) {
        if compat.is_enabled() {
            let identity = compat.identity()?;
            return Ok(Some((identity.certs.clone(), identity.key.clone_key())));
        }
        tracing::warn!(
            "{owner_name:?} is configured to use the legacy certificate, but legacy certificate compatibility is disabled"
        );
    }
    let Some(cred) = creds
        .iter()
        .find(|c| c.kind == CredentialType::TlsCertificate && !c.value2.is_empty())
    else {
        return Ok(None);
    };
    Ok(Some((parse_certs(&cred.name, &cred.value)?, parse_key(&cred.name, &cred.value2)?)))
}

/// Builds the TLS configuration of a local agent. Fails when the agent has no certificate.
pub fn server_config(
    store: &dyn Store,
    agent: &LocalAgent,
    compat: &LegacyCertCompat,
) -> Result<Arc<ServerConfig>, TlsSetupError> {
    let (certs, key) = owned_identity(store, Owner::LocalAgent(agent.id), &agent.name, compat)?
        .ok_or_else(|| TlsSetupError::NoCertificates(agent.name.clone()))?;

    let mut trusted = Vec::new();
    for cred in store.credentials(Owner::LocalAgent(agent.id))? {
        if cred.kind == CredentialType::TrustedTlsCertificate {
            trusted.extend(parse_certs(&cred.name, &cred.value)?);
        }
    }
    let accounts = account_certificates(store, agent)?;
    trusted.extend(accounts.iter().cloned());
    let authorities = authorities(store, None)?;
    let inner = if authorities.is_empty() {
        None
    } else {
        Some(
            WebPkiClientVerifier::builder(Arc::new(roots(&authorities)?))
                .allow_unauthenticated()
                .build()?,
        )
    };
    let verifier = Arc::new(AccountCertVerifier {
        pinned: trusted,
        inner,
        compat: compat.clone(),
        algorithms: algorithms(),
    });
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Certificates registered on the accounts of `agent`.
fn account_certificates(store: &dyn Store, agent: &LocalAgent) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let mut certs = Vec::new();
    for account in store.local_accounts(agent.id)? {
        for cred in store.credentials(Owner::LocalAccount(account.id))? {
            if matches!(cred.kind, CredentialType::TrustedTlsCertificate | CredentialType::TlsCertificate) {
                certs.extend(parse_certs(&cred.name, &cred.value)?);
            }
        }
    }
    Ok(certs)
}

/// Builds the TLS configuration used to reach `partner` as `account`.
pub fn client_config(
    store: &dyn Store,
    partner: &RemoteAgent,
    account: &RemoteAccount,
    compat: &LegacyCertCompat,
) -> Result<Arc<ClientConfig>, TlsSetupError> {
    let identity = owned_identity(store, Owner::RemoteAccount(account.id), &account.login, compat)?;
    let partner_creds = store.credentials(Owner::RemoteAgent(partner.id))?;

    let legacy = partner_creds
        .iter()
        .any(|c| c.kind == CredentialType::R66LegacyCertificate);
    if legacy && !compat.is_enabled() {
        tracing::warn!(
            "partner {:?} is configured to use the legacy certificate, but legacy certificate compatibility is disabled",
            partner.name
        );
    }
    let verifier: Arc<dyn ServerCertVerifier> = if legacy && compat.is_enabled() {
        compat.identity()?;
        Arc::new(LegacyServerVerifier {
            compat: compat.clone(),
            algorithms: algorithms(),
        })
    } else {
        let mut pinned = Vec::new();
        for cred in &partner_creds {
            if cred.kind == CredentialType::TrustedTlsCertificate {
                pinned.extend(parse_certs(&cred.name, &cred.value)?);
            }
        }
        let host = crate::pool::host_of(&partner.address);
        let authorities = authorities(store, Some(host))?;
        if pinned.is_empty() && authorities.is_empty() {
            return Err(TlsSetupError::NoTrustedCertificates(partner.name.clone()));
        }
        let inner = if authorities.is_empty() {
            None
        } else {
            Some(WebPkiServerVerifier::builder(Arc::new(roots(&authorities)?)).build()?)
        };
        Arc::new(PartnerCertVerifier {
            pinned,
            inner,
            algorithms: algorithms(),
        })
    };

    let builder = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier);
    let config = match identity {
        Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

fn bad_certificate() -> rustls::Error {
    rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer)
}

/// Trusts the partner's registered certificates, or a chain to a known authority.
#[derive(Debug)]
struct PartnerCertVerifier {
    pinned: Vec<CertificateDer<'static>>,
    inner: Option<Arc<WebPkiServerVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PartnerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        warn_if_sha1(end_entity.as_ref());
        if self.pinned.iter().any(|cert| cert.as_ref() == end_entity.as_ref()) {
            return Ok(ServerCertVerified::assertion());
        }
        match &self.inner {
            Some(inner) => inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now),
            None => {
                tracing::error!("partner certificate is not trusted");
                Err(bad_certificate())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Accepts only the legacy certificate, whatever the server name.
#[derive(Debug)]
struct LegacyServerVerifier {
    compat: LegacyCertCompat,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for LegacyServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.compat.is_legacy(end_entity) {
            return Ok(ServerCertVerified::assertion());
        }
        tracing::error!("partner did not present the legacy certificate");
        Err(rustls::Error::InvalidCertificate(rustls::CertificateError::BadSignature))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Requests a client certificate; a presented one must be registered on an
/// account, chain to an authority, or be the legacy certificate.
#[derive(Debug)]
struct AccountCertVerifier {
    pinned: Vec<CertificateDer<'static>>,
    inner: Option<Arc<dyn ClientCertVerifier>>,
    compat: LegacyCertCompat,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AccountCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        match &self.inner {
            Some(inner) => inner.root_hint_subjects(),
            None => &[],
        }
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        warn_if_sha1(end_entity.as_ref());
        if self.compat.is_legacy(end_entity) || self.pinned.iter().any(|cert| cert.as_ref() == end_entity.as_ref()) {
            return Ok(ClientCertVerified::assertion());
        }
        match &self.inner {
            Some(inner) => inner.verify_client_cert(end_entity, intermediates, now),
            None => {
                tracing::warn!("client certificate is not trusted");
                Err(bad_certificate())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }
}
