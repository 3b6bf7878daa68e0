//! tickmesh-demo — two modules exchanging vectors through the barrier.
//!
//! Wires a manager, a broker, and two 3-port modules connected by identity
//! adjacency in both directions. Each module emits a fresh vector every tick
//! and logs what it received from its peer. Runs briefly, then performs a
//! graceful stop.

use std::collections::HashMap;

use clap::Parser;

use tickmesh_fabric::config::FabricConfig;
use tickmesh_fabric::manager::Manager;
use tickmesh_fabric::message::PortArray;
use tickmesh_fabric::module::Module;
use tickmesh_fabric::{Connectivity, ModuleId};

/// Two-module identity-exchange demo.
#[derive(Parser, Debug)]
#[command(name = "tickmesh-demo", version, about)]
struct Cli {
    /// Host for both endpoints.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Data port (broker binds).
    #[arg(long, default_value_t = tickmesh_fabric::PORT_DATA)]
    data_port: u16,

    /// Control port (manager binds).
    #[arg(long, default_value_t = tickmesh_fabric::PORT_CTRL)]
    ctrl_port: u16,

    /// How long to let the emulation run, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    run_ms: u64,
}

/// Emits `base + tick` across all ports and logs whatever arrived.
struct CountingBody {
    name: &'static str,
    base: f64,
    tick: u64,
}

impl tickmesh_fabric::TickBody for CountingBody {
    fn run_step(&mut self, inputs: &HashMap<ModuleId, PortArray>, out: &mut [f64]) {
        for (src, arr) in inputs {
            tracing::info!(module = self.name, src = %src, data = ?arr.as_f64(), "recv");
        }
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.base + self.tick as f64 + i as f64;
        }
        self.tick += 1;
    }
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
    let config = FabricConfig::tcp(&cli.host, cli.data_port, cli.ctrl_port);

    let mut man = Manager::bind(config).await?;
    man.add_broker()?;

    let m1 = man.add_module(Module::new(
        "m1",
        3,
        CountingBody {
            name: "m1",
            base: 100.0,
            tick: 0,
        },
    ))?;
    let m2 = man.add_module(Module::new(
        "m2",
        3,
        CountingBody {
            name: "m2",
            base: 200.0,
            tick: 0,
        },
    ))?;

    let mut conn = Connectivity::new(3, 3, m1.as_str(), m2.as_str())?;
    for i in 0..3 {
        conn.set(&m1, i, &m2, i)?;
        conn.set(&m2, i, &m1, i)?;
    }
    man.connect(&m1, &m2, conn)?;

    man.start().await?;
    tokio::time::sleep(std::time::Duration::from_millis(cli.run_ms)).await;
    man.stop().await?;

    tracing::info!("all done");
    Ok(())
}
