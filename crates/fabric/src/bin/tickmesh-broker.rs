//! tickmesh-broker — standalone per-tick barrier dispatcher.
//!
//! Binds the data ROUTER that modules dial and dials the manager's control
//! endpoint. The routing table comes from a TOML config file with
//! `[[routing]]` entries; without one, the broker serves an empty table and
//! drops every tick frame.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: data on tcp://127.0.0.1:5000, control on tcp://127.0.0.1:5001
//! tickmesh-broker --config mesh.toml
//!
//! # Override endpoints
//! tickmesh-broker --config mesh.toml --data tcp://0.0.0.0:6000 --control tcp://127.0.0.1:6001
//! ```

use clap::Parser;

use tickmesh_fabric::broker::Broker;
use tickmesh_fabric::config::FabricConfig;

/// Standalone barrier broker for a tickmesh deployment.
#[derive(Parser, Debug)]
#[command(name = "tickmesh-broker", version, about)]
struct Cli {
    /// TOML config file carrying endpoints and `[[routing]]` edges.
    #[arg(long, env = "TICKMESH_CONFIG")]
    config: Option<String>,

    /// Data endpoint to bind (overrides the config file).
    #[arg(long, env = "TICKMESH_DATA")]
    data: Option<String>,

    /// Control endpoint to dial (overrides the config file).
    #[arg(long, env = "TICKMESH_CONTROL")]
    control: Option<String>,

    /// Broker ID announced on the control channel.
    #[arg(long, default_value = "broker-0")]
    id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting tickmesh-broker");

    let mut config = match &cli.config {
        Some(path) => FabricConfig::from_file(path)?,
        None => FabricConfig::default(),
    };
    if let Some(data) = cli.data {
        config.data = data;
    }
    if let Some(control) = cli.control {
        config.control = control;
    }
    config.validate()?;

    let routing = config.routing_table()?;
    if routing.is_empty() {
        tracing::warn!("routing table is empty, all tick frames will be dropped");
    }

    let broker = Broker::with_id(cli.id.as_str(), routing);
    broker
        .run(config.data_transport()?, config.control_transport()?)
        .await?;

    tracing::info!("tickmesh-broker exited cleanly");
    Ok(())
}
