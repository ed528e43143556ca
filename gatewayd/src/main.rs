use anyhow::{Context, anyhow};
use clap::Parser;
use common::Gateway;
use common::config::{GatewayConfig, OutputConfig};
use common::service::{Service, StateCode};
use common::store::MemoryStore;
use r66::tls::{LegacyCertCompat, LegacyIdentity};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "gatewayd",
    version,
    about = "File transfer gateway daemon - serves and runs R66 transfers",
    long_about = "`gatewayd` starts the R66 servers and clients declared in the gateway configuration file and runs them until interrupted.

On Ctrl-C every running transfer is interrupted (resumable), then the services are stopped."
)]
struct Args {
    /// Gateway configuration file (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Only validate the configuration and exit
    #[arg(long)]
    check: bool,

    // Service options
    /// How long running transfers get to be interrupted on shutdown
    ///
    /// Accepts human-readable durations like "500ms", "10s", "1min".
    #[arg(
        long,
        default_value = "10s",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Service options"
    )]
    stop_timeout: Duration,

    /// Accept the legacy R66 certificate from partners that are allowed to use it
    ///
    /// Can also be enabled with MFTGW_R66_LEGACY_CERT=1.
    #[arg(long, help_heading = "Service options")]
    legacy_cert: bool,

    // Progress & output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, only errors are reported
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Runtime options
    /// Number of worker threads, 0 means number of cores
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Runtime options")]
    max_workers: usize,
}

struct Running {
    name: String,
    service: Box<dyn Service>,
}

fn legacy_compat(args: &Args, config: &GatewayConfig) -> anyhow::Result<LegacyCertCompat> {
    let enabled = args.legacy_cert || LegacyCertCompat::enabled_by_env();
    let identity = match (&config.legacy_certificate, &config.legacy_private_key) {
        (Some(cert), Some(key)) => {
            let cert_pem = std::fs::read_to_string(cert)
                .with_context(|| format!("failed to read legacy certificate {cert:?}"))?;
            let key_pem = std::fs::read_to_string(key)
                .with_context(|| format!("failed to read legacy private key {key:?}"))?;
            Some(LegacyIdentity::from_pem(&cert_pem, &key_pem).context("invalid legacy certificate")?)
        }
        (None, None) => None,
        _ => return Err(anyhow!("legacyCertificate and legacyPrivateKey must be configured together")),
    };
    if enabled && identity.is_none() {
        tracing::warn!("legacy certificate compatibility is enabled but no legacy certificate is configured");
    }
    Ok(LegacyCertCompat::new(enabled, identity))
}

/// Builds the services declared in `config`, checking their configuration.
fn build_services(
    config: &GatewayConfig,
    gateway: &Gateway,
    compat: &LegacyCertCompat,
) -> anyhow::Result<Vec<Running>> {
    let mut services = Vec::new();
    let explicit = !config.servers.is_empty();
    let names: Vec<&str> = if explicit {
        config.servers.iter().map(String::as_str).collect()
    } else {
        config.data.local_agents.iter().map(|agent| agent.name.as_str()).collect()
    };
    for name in names {
        let agent = gateway
            .store
            .local_agent_by_name(name)
            .with_context(|| format!("unknown server {name:?}"))?;
        let Some(module) = r66::module_for(&agent.protocol, compat.clone()) else {
            if explicit {
                return Err(anyhow!("server {name:?} uses unsupported protocol {:?}", agent.protocol));
            }
            tracing::warn!("skipping server {name:?}: unsupported protocol {:?}", agent.protocol);
            continue;
        };
        module
            .make_server_config(&agent.proto_config)
            .with_context(|| format!("invalid configuration for server {name:?}"))?;
        services.push(Running {
            name: format!("server {name}"),
            service: Box::new(module.make_server(gateway, &agent)),
        });
    }
    for client in &config.data.clients {
        let client = gateway
            .store
            .client_by_name(&client.name)
            .with_context(|| format!("unknown client {:?}", client.name))?;
        let Some(module) = r66::module_for(&client.protocol, compat.clone()) else {
            tracing::warn!("skipping client {:?}: unsupported protocol {:?}", client.name, client.protocol);
            continue;
        };
        module
            .make_client_config(&client.proto_config)
            .with_context(|| format!("invalid configuration for client {:?}", client.name))?;
        services.push(Running {
            name: format!("client {}", client.name),
            service: Box::new(module.make_client(gateway, &client)),
        });
    }
    for partner in &config.data.remote_agents {
        if let Some(module) = r66::module_for(&partner.protocol, compat.clone()) {
            module
                .make_partner_config(&partner.proto_config)
                .with_context(|| format!("invalid configuration for partner {:?}", partner.name))?;
        }
    }
    Ok(services)
}

async fn async_main(args: Args, config: GatewayConfig) -> anyhow::Result<()> {
    let compat = legacy_compat(&args, &config)?;
    let store = Arc::new(MemoryStore::with_seed(config.data.clone()));
    let mut gateway = Gateway::new(store)
        .with_paths(config.paths.clone())
        .with_secret_key(config.secret_key()?);
    if !config.name.is_empty() {
        gateway = gateway.with_name(config.name.clone());
    }
    let services = build_services(&config, &gateway, &compat)?;
    if args.check {
        println!("configuration OK: {} service(s)", services.len());
        return Ok(());
    }
    if services.is_empty() {
        return Err(anyhow!("nothing to run: no R66 server or client is configured"));
    }

    let mut started = 0;
    for running in &services {
        match running.service.start().await {
            Ok(()) => {
                tracing::info!("{} started", running.name);
                started += 1;
            }
            Err(err) => tracing::error!("failed to start {}: {err}", running.name),
        }
    }
    if started == 0 {
        return Err(anyhow!("none of the {} service(s) could be started", services.len()));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    tracing::info!("shutting down, stop timeout {}", humantime::format_duration(args.stop_timeout));

    let mut failed = false;
    for running in &services {
        if running.service.state().0 != StateCode::Running {
            continue;
        }
        if let Err(err) = running.service.stop(args.stop_timeout).await {
            tracing::error!("failed to stop {} cleanly: {err}", running.name);
            failed = true;
        }
    }
    for running in &services {
        let (code, reason) = running.service.state();
        tracing::info!("{}: {code} {reason}", running.name);
    }
    if failed {
        return Err(anyhow!("some services did not stop cleanly"));
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = GatewayConfig::load(&args.config)?;
    let output = OutputConfig {
        quiet: args.quiet || config.output.quiet,
        verbose: args.verbose.max(config.output.verbose),
    };
    common::init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if args.max_workers > 0 {
        builder.worker_threads(args.max_workers);
    }
    let runtime = builder.build().context("failed to create the tokio runtime")?;
    let res = runtime.block_on(async_main(args, config));
    if let Err(err) = &res {
        tracing::error!("{err:#}");
    }
    res
}
