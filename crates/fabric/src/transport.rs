//! Endpoint addressing for the data and control channels.
//!
//! Same-host deployments use Unix domain sockets under `/tmp/tickmesh/`;
//! distributed deployments use TCP. Binding an IPC endpoint requires the
//! socket directory to exist and any socket file left behind by a previous
//! run to be cleared first, so both concerns live here next to the address
//! formatting.

use std::path::PathBuf;

/// Directory holding IPC sockets for same-host deployments.
const IPC_DIR: &str = "/tmp/tickmesh";

/// Where a channel endpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Unix domain socket named under the tickmesh IPC directory.
    Ipc(String),

    /// TCP host and port.
    Tcp { host: String, port: u16 },
}

impl Transport {
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// The ZeroMQ endpoint address string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(_) => format!("ipc://{}", self.socket_path().display()),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    /// The TCP port, when this is a TCP transport. The manager compares the
    /// data and control ports through this when checking for conflicts.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Ipc(_) => None,
            Self::Tcp { port, .. } => Some(*port),
        }
    }

    /// Filesystem path of the socket file (IPC only).
    fn socket_path(&self) -> PathBuf {
        match self {
            Self::Ipc(name) => PathBuf::from(IPC_DIR).join(format!("{name}.sock")),
            Self::Tcp { .. } => PathBuf::new(),
        }
    }

    /// Create the IPC socket directory if this transport needs one.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if matches!(self, Self::Ipc(_)) {
            std::fs::create_dir_all(IPC_DIR)?;
        }
        Ok(())
    }

    /// Remove a leftover socket file from a previous run before binding.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        if matches!(self, Self::Ipc(_)) {
            match std::fs::remove_file(self.socket_path()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_sockets_live_under_the_tickmesh_dir() {
        let t = Transport::ipc("data");
        assert_eq!(t.endpoint(), "ipc:///tmp/tickmesh/data.sock");
        assert_eq!(t.to_string(), t.endpoint());
    }

    #[test]
    fn only_tcp_has_a_port() {
        assert_eq!(Transport::tcp("127.0.0.1", 5000).port(), Some(5000));
        assert_eq!(Transport::ipc("data").port(), None);
    }

    #[test]
    fn ensure_ipc_dir_creates_the_socket_dir() {
        let t = Transport::ipc("dir-probe");
        t.ensure_ipc_dir().unwrap();
        assert!(std::path::Path::new(IPC_DIR).is_dir());
        // idempotent
        t.ensure_ipc_dir().unwrap();
    }

    #[test]
    fn ensure_ipc_dir_is_a_noop_for_tcp() {
        Transport::tcp("127.0.0.1", 5000).ensure_ipc_dir().unwrap();
    }

    #[test]
    fn remove_stale_socket_clears_leftovers() {
        let t = Transport::ipc("stale-probe");
        t.ensure_ipc_dir().unwrap();
        let path = PathBuf::from(IPC_DIR).join("stale-probe.sock");
        std::fs::write(&path, b"").unwrap();

        t.remove_stale_socket().unwrap();
        assert!(!path.exists());
        // absent socket files are not an error
        t.remove_stale_socket().unwrap();
    }
}
