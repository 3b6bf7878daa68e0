//! Runtime configuration.
//!
//! Parsed from TOML with `TICKMESH_*` environment variable overrides and a
//! validation pass. The data and control endpoints must differ; a standalone
//! broker can receive its routing table from `[[routing]]` entries.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tickmesh_core::{ModuleId, RoutingTable};

use crate::error::FabricError;
use crate::transport::Transport;

/// Default TCP port for the data channel (broker binds).
pub const PORT_DATA: u16 = 5000;
/// Default TCP port for the control channel (manager binds).
pub const PORT_CTRL: u16 = 5001;

fn default_data_endpoint() -> String {
    format!("tcp://127.0.0.1:{PORT_DATA}")
}

fn default_control_endpoint() -> String {
    format!("tcp://127.0.0.1:{PORT_CTRL}")
}

fn default_linger_ms() -> u64 {
    100
}

fn default_ready_timeout_secs() -> u64 {
    10
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

/// One declared routing edge, for standalone broker deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub src: String,
    pub dst: String,
}

/// Full configuration for a tickmesh deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Endpoint the broker binds for per-tick data; modules dial it.
    #[serde(default = "default_data_endpoint")]
    pub data: String,

    /// Endpoint the manager binds for control; every worker dials it.
    #[serde(default = "default_control_endpoint")]
    pub control: String,

    /// Bound on shutdown-path waits so unsent frames never hang an exit.
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,

    /// How long `start()` waits for every worker to report ready.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// How long `stop()` waits for each worker's acknowledgment.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Routing edges for a broker started outside a manager process.
    #[serde(default)]
    pub routing: Vec<RouteConfig>,
}

impl FabricConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, FabricError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FabricError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Single-host deployment over IPC sockets.
    pub fn local() -> Self {
        Self {
            data: "ipc:///tmp/tickmesh/data.sock".to_string(),
            control: "ipc:///tmp/tickmesh/control.sock".to_string(),
            linger_ms: default_linger_ms(),
            ready_timeout_secs: default_ready_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            routing: Vec::new(),
        }
    }

    /// TCP deployment on the given host and ports.
    pub fn tcp(host: &str, data_port: u16, ctrl_port: u16) -> Self {
        Self {
            data: format!("tcp://{host}:{data_port}"),
            control: format!("tcp://{host}:{ctrl_port}"),
            linger_ms: default_linger_ms(),
            ready_timeout_secs: default_ready_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            routing: Vec::new(),
        }
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `TICKMESH_KEY` overrides the matching field.
    /// - `TICKMESH_DATA` → `data`
    /// - `TICKMESH_CONTROL` → `control`
    /// - `TICKMESH_LINGER_MS` → `linger_ms`
    /// - `TICKMESH_READY_TIMEOUT_SECS` → `ready_timeout_secs`
    /// - `TICKMESH_SHUTDOWN_TIMEOUT_SECS` → `shutdown_timeout_secs`
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TICKMESH_DATA") {
            self.data = v;
        }
        if let Ok(v) = std::env::var("TICKMESH_CONTROL") {
            self.control = v;
        }
        if let Ok(v) = std::env::var("TICKMESH_LINGER_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.linger_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("TICKMESH_READY_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.ready_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("TICKMESH_SHUTDOWN_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.shutdown_timeout_secs = secs;
            }
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Validate the config: endpoints must parse and must not collide.
    pub fn validate(&self) -> Result<(), FabricError> {
        let data = self.data_transport()?;
        let control = self.control_transport()?;
        if data == control {
            return Err(FabricError::PortConflict(self.data.clone()));
        }
        if let (Some(dp), Some(cp)) = (data.port(), control.port()) {
            if dp == cp {
                return Err(FabricError::PortConflict(format!("port {dp}")));
            }
        }
        for route in &self.routing {
            if route.src == route.dst {
                return Err(FabricError::Config(format!(
                    "routing edge endpoints must differ, got '{}' twice",
                    route.src
                )));
            }
        }
        Ok(())
    }

    /// Resolve the data endpoint to a [`Transport`].
    pub fn data_transport(&self) -> Result<Transport, FabricError> {
        parse_endpoint(&self.data)
    }

    /// Resolve the control endpoint to a [`Transport`].
    pub fn control_transport(&self) -> Result<Transport, FabricError> {
        parse_endpoint(&self.control)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Build a routing table from the `[[routing]]` entries.
    pub fn routing_table(&self) -> Result<RoutingTable, FabricError> {
        let mut table = RoutingTable::new();
        for route in &self.routing {
            table.add(
                ModuleId::new(route.src.as_str()),
                ModuleId::new(route.dst.as_str()),
            )?;
        }
        Ok(table)
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self::tcp("127.0.0.1", PORT_DATA, PORT_CTRL)
    }
}

/// Parse an endpoint string like "ipc:///tmp/tickmesh/data.sock" or
/// "tcp://host:port" into a Transport.
fn parse_endpoint(endpoint: &str) -> Result<Transport, FabricError> {
    if let Some(path) = endpoint.strip_prefix("ipc://") {
        let name = Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                FabricError::Config(format!("invalid ipc endpoint '{endpoint}'"))
            })?;
        Ok(Transport::ipc(name))
    } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
        let (host, port_str) = addr.rsplit_once(':').ok_or_else(|| {
            FabricError::Config(format!("tcp endpoint '{endpoint}' is missing a port"))
        })?;
        let port = port_str.parse().map_err(|_| {
            FabricError::Config(format!("invalid port in tcp endpoint '{endpoint}'"))
        })?;
        Ok(Transport::tcp(host, port))
    } else {
        Err(FabricError::Config(format!(
            "endpoint '{endpoint}' must start with tcp:// or ipc://"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_the_well_known_ports() {
        let cfg = FabricConfig::default();
        assert_eq!(cfg.data, "tcp://127.0.0.1:5000");
        assert_eq!(cfg.control, "tcp://127.0.0.1:5001");
        cfg.validate().unwrap();
    }

    #[test]
    fn parse_minimal_toml() {
        let cfg = FabricConfig::from_toml("").unwrap();
        assert_eq!(cfg.data_transport().unwrap(), Transport::tcp("127.0.0.1", 5000));
        assert_eq!(cfg.linger_ms, 100);
        assert!(cfg.routing.is_empty());
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
data = "tcp://10.0.0.1:6000"
control = "tcp://10.0.0.1:6001"
linger_ms = 250

[[routing]]
src = "m1"
dst = "m2"

[[routing]]
src = "m2"
dst = "m1"
"#;
        let cfg = FabricConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.data_transport().unwrap(), Transport::tcp("10.0.0.1", 6000));
        assert_eq!(cfg.linger(), Duration::from_millis(250));

        let table = cfg.routing_table().unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.contains(&ModuleId::new("m1"), &ModuleId::new("m2")));
    }

    #[test]
    fn identical_endpoints_are_a_port_conflict() {
        let toml = r#"
data = "tcp://127.0.0.1:7000"
control = "tcp://127.0.0.1:7000"
"#;
        let err = FabricConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, FabricError::PortConflict(_)));
    }

    #[test]
    fn same_port_on_different_hosts_still_conflicts() {
        let toml = r#"
data = "tcp://0.0.0.0:7000"
control = "tcp://127.0.0.1:7000"
"#;
        let err = FabricConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, FabricError::PortConflict(_)));
    }

    #[test]
    fn self_routing_edge_is_rejected() {
        let toml = r#"
[[routing]]
src = "m1"
dst = "m1"
"#;
        let err = FabricConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, FabricError::Config(_)));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let toml = r#"data = "udp://127.0.0.1:7000""#;
        let err = FabricConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("udp"));
    }

    #[test]
    fn env_override_control_endpoint() {
        // SAFETY: test-only, nextest runs each test in its own process
        unsafe {
            std::env::set_var("TICKMESH_CONTROL", "tcp://override:9001");
        }
        let cfg = FabricConfig::from_toml("data = \"tcp://127.0.0.1:9000\"\n").unwrap();
        assert_eq!(cfg.control, "tcp://override:9001");
        unsafe {
            std::env::remove_var("TICKMESH_CONTROL");
        }
    }

    #[test]
    fn local_config_uses_distinct_ipc_sockets() {
        let cfg = FabricConfig::local();
        cfg.validate().unwrap();
        assert!(matches!(cfg.data_transport().unwrap(), Transport::Ipc(_)));
    }
}
