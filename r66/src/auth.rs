//! Authentication of incoming R66 sessions.

use common::Gateway;
use common::model::{CredentialType, LocalAccount, LocalAgent, Owner};
use common::secrets::verify_password;
use std::sync::Arc;

use crate::config::R66ServerConfig;
use crate::hash::HashAlgo;
use crate::protocol::server::{AuthHandler, Authenticated};
use crate::protocol::{Authent, PeerInfo, WireError, WireErrorCode};
use crate::session_handler::R66SessionHandler;
use crate::tls::{self, LegacyCertCompat};

/// Everything a server's handlers share.
#[derive(Debug)]
pub struct ServerEnv {
    pub gateway: Gateway,
    pub agent: LocalAgent,
    pub conf: R66ServerConfig,
}

/// Options agreed on during authentication, valid for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub filesize: bool,
    /// Digest of the final hash, `None` when no final hash is exchanged.
    pub digest: Option<HashAlgo>,
}

fn bad_authent(message: &str) -> WireError {
    WireError::new(WireErrorCode::BadAuthent, message)
}

fn database_error() -> WireError {
    WireError::internal("database error")
}

pub struct R66AuthHandler {
    env: Arc<ServerEnv>,
    server_login: String,
    /// Already transformed, see [`crate::hash::crypt_pass`].
    server_password: String,
    compat: LegacyCertCompat,
}

impl std::fmt::Debug for R66AuthHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("R66AuthHandler")
            .field("agent", &self.env.agent.name)
            .field("server_login", &self.server_login)
            .finish_non_exhaustive()
    }
}

impl R66AuthHandler {
    pub fn new(env: Arc<ServerEnv>, server_login: String, server_password: String, compat: LegacyCertCompat) -> Self {
        Self {
            env,
            server_login,
            server_password,
            compat,
        }
    }

    /// Looks the account up. An unknown login is not refused here: every
    /// check below fails on `None`.
    fn account(&self, login: &str) -> Result<Option<LocalAccount>, WireError> {
        match self.env.gateway.store.local_account(self.env.agent.id, login) {
            Ok(account) => Ok(Some(account)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => {
                tracing::error!("failed to retrieve client account: {err}");
                Err(database_error())
            }
        }
    }

    fn has_credential(&self, account: &LocalAccount, kind: CredentialType) -> Result<bool, WireError> {
        match self.env.gateway.store.credentials(Owner::LocalAccount(account.id)) {
            Ok(creds) => Ok(creds.iter().any(|cred| cred.kind == kind)),
            Err(err) => {
                tracing::error!("failed to retrieve the credentials of {:?}: {err}", account.login);
                Err(database_error())
            }
        }
    }

    fn cert_auth(&self, account: Option<&LocalAccount>, peer: &PeerInfo, login: &str) -> Result<bool, WireError> {
        let Some(cert) = peer.certificates.first() else {
            return Ok(false);
        };
        let Some(account) = account else {
            tracing::warn!("certificate presented for unknown account {login:?}");
            return Err(bad_authent("authentication failed"));
        };
        if self.compat.is_legacy(cert) {
            if !self.has_credential(account, CredentialType::R66LegacyCertificate)? {
                tracing::warn!("account {login:?} is not allowed to use the legacy certificate");
                return Err(bad_authent("authentication failed"));
            }
            return Ok(true);
        }
        match tls::common_name(cert.as_ref()) {
            Some(cn) if cn == account.login => Ok(true),
            cn => {
                tracing::warn!("the certificate's Common Name {cn:?} does not match the R66 login {login:?}");
                Err(bad_authent("authentication failed"))
            }
        }
    }

    fn password_auth(&self, account: Option<&LocalAccount>, auth: &Authent) -> Result<bool, WireError> {
        if auth.password.is_empty() {
            return Ok(false);
        }
        let stored = match account {
            Some(account) => match self.env.gateway.store.credentials(Owner::LocalAccount(account.id)) {
                Ok(creds) => creds
                    .into_iter()
                    .find(|cred| cred.kind == CredentialType::PasswordHash),
                Err(err) => {
                    tracing::error!("failed to retrieve the credentials of {:?}: {err}", account.login);
                    return Err(database_error());
                }
            },
            None => None,
        };
        let Some(stored) = stored else {
            tracing::warn!("authentication failed for unknown account {:?}", auth.login);
            return Err(bad_authent("authentication failed"));
        };
        match verify_password(auth.password.as_bytes(), &stored.value) {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::warn!("account {:?} authenticated with a wrong password", auth.login);
                Err(bad_authent("authentication failed"))
            }
            Err(err) => {
                tracing::error!("failed to authenticate account {:?}: {err}", auth.login);
                Err(WireError::internal("internal authentication error"))
            }
        }
    }

    fn negotiate(&self, auth: &Authent) -> Result<Negotiated, WireError> {
        if !auth.final_hash || self.env.conf.no_final_hash {
            return Ok(Negotiated {
                filesize: true,
                digest: None,
            });
        }
        let digest: HashAlgo = auth
            .digest
            .parse()
            .map_err(|_| bad_authent("unsuported hash algorithm"))?;
        if !self.env.conf.allows_digest(digest) {
            return Err(bad_authent("unauthorized hash algorithm"));
        }
        Ok(Negotiated {
            filesize: true,
            digest: Some(digest),
        })
    }
}

impl AuthHandler for R66AuthHandler {
    fn valid_auth(&self, auth: &Authent, peer: &PeerInfo) -> Result<Authenticated, WireError> {
        if auth.login.is_empty() {
            return Err(bad_authent("missing credentials"));
        }
        tracing::debug!("connection received from {:?}", auth.login);

        let account = self.account(&auth.login)?;
        if account.as_ref().is_some_and(|account| !account.allows_ip(peer.addr.ip())) {
            tracing::warn!("account {:?} connected from unauthorized address {}", auth.login, peer.addr);
            return Err(bad_authent("unauthorized IP address"));
        }

        let by_cert = self.cert_auth(account.as_ref(), peer, &auth.login)?;
        let by_password = self.password_auth(account.as_ref(), auth)?;
        let account = match account {
            Some(account) if by_cert || by_password => account,
            _ => {
                tracing::warn!("authentication failed for account {:?}", auth.login);
                return Err(bad_authent("authentication failed"));
            }
        };

        let negotiated = self.negotiate(auth)?;
        let reply = Authent {
            login: self.server_login.clone(),
            password: self.server_password.clone(),
            filesize: negotiated.filesize,
            final_hash: negotiated.digest.is_some(),
            digest: negotiated
                .digest
                .map(|algo| algo.name().to_string())
                .unwrap_or_default(),
        };
        Ok(Authenticated {
            handler: Box::new(R66SessionHandler::new(Arc::clone(&self.env), account, negotiated)),
            reply,
        })
    }
}
