//! Shared building blocks of the file transfer gateway.
//!
//! This crate holds everything the protocol modules need but do not own:
//!
//! - [`model`]: agents, accounts, credentials, rules and transfer records
//! - [`store`]: the persistence capability and an in-memory implementation
//! - [`fs`]: the filesystem capability, resolved by URL scheme
//! - [`pipeline`]: transfer orchestration, interruption signals and the registry of running transfers
//! - [`error`]: the [`TransferErrorCode`] taxonomy every module reports with
//! - [`secrets`]: password hashing and at-rest secret encryption
//! - [`config`] and [`service`]: gateway configuration and service state
//!
//! A [`Gateway`] bundles the shared capabilities and is handed to every
//! service at construction time.

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod fs;
pub mod model;
pub mod pipeline;
pub mod secrets;
pub mod service;
pub mod store;

pub use error::{TransferError, TransferErrorCode};

/// Capabilities shared by every service of a gateway process.
#[derive(Clone)]
pub struct Gateway {
    pub name: String,
    pub store: Arc<dyn store::Store>,
    pub resolver: Arc<dyn fs::FsResolver>,
    pub tasks: Arc<dyn pipeline::TaskRunner>,
    pub registry: Arc<pipeline::TransferRegistry>,
    pub paths: config::PathsConfig,
    pub secret_key: Option<secrets::SecretKey>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("name", &self.name)
            .field("paths", &self.paths)
            .field("running", &self.registry.list())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(store: Arc<dyn store::Store>) -> Self {
        Self {
            name: "gateway".to_string(),
            store,
            resolver: Arc::new(fs::DefaultResolver::new()),
            tasks: Arc::new(pipeline::NoopTaskRunner),
            registry: Arc::new(pipeline::TransferRegistry::new()),
            paths: config::PathsConfig::default(),
            secret_key: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_paths(mut self, paths: config::PathsConfig) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn fs::FsResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_tasks(mut self, tasks: Arc<dyn pipeline::TaskRunner>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_secret_key(mut self, key: Option<secrets::SecretKey>) -> Self {
        self.secret_key = key;
        self
    }

    /// Returns the plain value of a possibly encrypted secret.
    pub fn reveal(&self, value: &str) -> Result<String, secrets::SecretError> {
        secrets::reveal(value, self.secret_key.as_ref())
    }
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured verbosity. Calling this
/// more than once keeps the first subscriber.
pub fn init_tracing(output: &config::OutputConfig) {
    let level = output.level();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_str()));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
}
