//! Gateway configuration.

use anyhow::Context;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::model::ProtoConfig;
use crate::secrets::SecretKey;
use crate::store::Seed;

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Only report errors
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
}

impl OutputConfig {
    pub fn level(&self) -> tracing::Level {
        if self.quiet {
            return tracing::Level::ERROR;
        }
        match self.verbose {
            0 => tracing::Level::ERROR,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

/// Directories used to resolve transfer file paths.
///
/// Relative directories are resolved under `gateway_home`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathsConfig {
    pub gateway_home: String,
    pub default_in_dir: String,
    pub default_out_dir: String,
    pub default_tmp_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            gateway_home: ".".to_string(),
            default_in_dir: "in".to_string(),
            default_out_dir: "out".to_string(),
            default_tmp_dir: "tmp".to_string(),
        }
    }
}

/// The gateway configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub name: String,
    pub paths: PathsConfig,
    /// Hex encoded key used to decrypt secrets stored with the `$ENC$` prefix.
    pub secret_key: Option<String>,
    pub output: OutputConfig,
    /// PEM file of the certificate presented by legacy R66 partners.
    pub legacy_certificate: Option<std::path::PathBuf>,
    /// PEM file of the private key matching `legacy_certificate`.
    pub legacy_private_key: Option<std::path::PathBuf>,
    /// Local agents to start; empty means every agent with a known protocol.
    pub servers: Vec<String>,
    /// Initial content of the store.
    pub data: Seed,
}

impl GatewayConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {path:?}"))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse configuration file {path:?}"))
    }

    pub fn secret_key(&self) -> anyhow::Result<Option<SecretKey>> {
        self.secret_key
            .as_deref()
            .map(SecretKey::from_hex)
            .transpose()
            .context("invalid gateway secret key")
    }
}

/// Parses a protocol configuration object into its typed form.
pub fn parse_proto_config<T: DeserializeOwned>(conf: &ProtoConfig) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::Value::Object(conf.clone()))
}
