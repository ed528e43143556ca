//! The two protocol variants, `r66` and `r66-tls`.

use common::config::parse_proto_config;
use common::model::{Client, LocalAgent, ProtoConfig};
use common::service::ServiceError;
use common::Gateway;

use crate::client::R66Client;
use crate::config::{R66ClientConfig, R66PartnerConfig, R66ServerConfig};
use crate::service::R66Server;
use crate::tls::LegacyCertCompat;

pub const R66: &str = "r66";
pub const R66_TLS: &str = "r66-tls";

/// What a protocol variant provides to the gateway.
pub trait Module: Send + Sync {
    fn protocol(&self) -> &'static str;

    fn make_server(&self, gateway: &Gateway, agent: &LocalAgent) -> R66Server;

    fn make_client(&self, gateway: &Gateway, client: &Client) -> R66Client;

    /// Parses and validates the configuration of a local server.
    fn make_server_config(&self, conf: &ProtoConfig) -> Result<R66ServerConfig, ServiceError> {
        let server: R66ServerConfig = parse_proto_config(conf).map_err(ServiceError::config)?;
        server.check().map_err(ServiceError::config)?;
        Ok(server)
    }

    fn make_client_config(&self, conf: &ProtoConfig) -> Result<R66ClientConfig, ServiceError> {
        let client: R66ClientConfig = parse_proto_config(conf).map_err(ServiceError::config)?;
        client.check().map_err(ServiceError::config)?;
        Ok(client)
    }

    fn make_partner_config(&self, conf: &ProtoConfig) -> Result<R66PartnerConfig, ServiceError> {
        let partner: R66PartnerConfig = parse_proto_config(conf).map_err(ServiceError::config)?;
        partner.check().map_err(ServiceError::config)?;
        if let Some(algo) = &partner.final_hash_algo {
            algo.parse::<crate::hash::HashAlgo>().map_err(ServiceError::config)?;
        }
        Ok(partner)
    }
}

#[derive(Debug, Clone, Default)]
pub struct R66Module {
    compat: LegacyCertCompat,
}

impl R66Module {
    pub fn new(compat: LegacyCertCompat) -> Self {
        Self { compat }
    }

    fn server(&self, gateway: &Gateway, agent: &LocalAgent, tls: bool) -> R66Server {
        R66Server::new(gateway.clone(), agent.clone(), tls, self.compat.clone())
    }

    fn client(&self, gateway: &Gateway, client: &Client, tls: bool) -> R66Client {
        R66Client::new(gateway.clone(), client.clone(), tls, self.compat.clone())
    }
}

impl Module for R66Module {
    fn protocol(&self) -> &'static str {
        R66
    }

    fn make_server(&self, gateway: &Gateway, agent: &LocalAgent) -> R66Server {
        self.server(gateway, agent, false)
    }

    fn make_client(&self, gateway: &Gateway, client: &Client) -> R66Client {
        self.client(gateway, client, false)
    }
}

/// The TLS variant: same configuration and logic, TLS transport.
#[derive(Debug, Clone, Default)]
pub struct R66TlsModule {
    plain: R66Module,
}

impl R66TlsModule {
    pub fn new(compat: LegacyCertCompat) -> Self {
        Self {
            plain: R66Module::new(compat),
        }
    }
}

impl Module for R66TlsModule {
    fn protocol(&self) -> &'static str {
        R66_TLS
    }

    fn make_server(&self, gateway: &Gateway, agent: &LocalAgent) -> R66Server {
        self.plain.server(gateway, agent, true)
    }

    fn make_client(&self, gateway: &Gateway, client: &Client) -> R66Client {
        self.plain.client(gateway, client, true)
    }
}

/// The variant implementing `protocol`, if any.
pub fn module_for(protocol: &str, compat: LegacyCertCompat) -> Option<Box<dyn Module>> {
    match protocol {
        R66 => Some(Box::new(R66Module::new(compat))),
        R66_TLS => Some(Box::new(R66TlsModule::new(compat))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto(json: &str) -> ProtoConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn variants() {
        let plain = module_for("r66", LegacyCertCompat::disabled()).unwrap();
        let tls = module_for("r66-tls", LegacyCertCompat::disabled()).unwrap();
        assert_eq!(plain.protocol(), R66);
        assert_eq!(tls.protocol(), R66_TLS);
        assert!(module_for("sftp", LegacyCertCompat::disabled()).is_none());
    }

    #[test]
    fn configurations_are_checked() {
        let module = R66TlsModule::default();
        let conf = module.make_server_config(&proto(r#"{"blockSize": 512}"#)).unwrap();
        assert_eq!(conf.block_size, 512);
        assert!(module.make_client_config(&proto(r#"{"nope": 1}"#)).is_err());
        assert!(module.make_partner_config(&proto(r#"{"finalHashAlgo": "MD5"}"#)).is_err());
        let partner = module
            .make_partner_config(&proto(r#"{"serverLogin": "waarp", "finalHashAlgo": "SHA-512"}"#))
            .unwrap();
        assert_eq!(partner.server_login, "waarp");

        let err = module
            .make_server_config(&proto(r#"{"blockSize": 4294967295}"#))
            .unwrap_err();
        assert!(err.to_string().contains("exceeds the limit"), "{err}");
        assert!(module.make_client_config(&proto(r#"{"blockSize": 4294967295}"#)).is_err());
        assert!(module.make_partner_config(&proto(r#"{"blockSize": 4294967295}"#)).is_err());
    }
}
