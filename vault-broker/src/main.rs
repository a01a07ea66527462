use std::net::SocketAddr;
use std::process;

use anyhow::Context;
use clap::Parser;
use vault_broker::config::BrokerConfig;

#[derive(Parser)]
#[command(name = "vault-broker", about = "Open Service Broker for HashiCorp Vault")]
struct BrokerArgs {
    /// Override the listen address (defaults to PORT)
    #[arg(long)]
    bind: Option<String>,
    /// Override the secrets backend (`vault` or `dev`)
    #[arg(long)]
    backend: Option<String>,
    /// Verbose output
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("broker exited with error: {err:#}");
        process::exit(1);
    }
}

async fn real_main() -> anyhow::Result<()> {
    let args = BrokerArgs::parse();
    vault_broker::telemetry::init(args.verbose)?;

    let mut config = BrokerConfig::from_env().context("failed to read configuration")?;
    if let Some(backend) = &args.backend {
        config.backend = backend.clone();
    }
    let config = config.validate().context("invalid configuration")?;

    let http_addr = match &args.bind {
        Some(bind) => bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid --bind address `{bind}`"))?,
        None => config.listen_addr()?,
    };
    if args.verbose {
        eprintln!("config loaded: {config:?}");
    }

    vault_broker::run(vault_broker::BrokerRuntimeConfig {
        http_addr,
        broker: config,
    })
    .await
}
