use std::time::Duration;

use thiserror::Error;

use tickmesh_core::CoreError;

/// Errors that can occur in the tickmesh runtime layer.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("data and control endpoints must differ: {0}")]
    PortConflict(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("control channel lost: {0}")]
    ControlChannelLost(String),

    #[error("worker fault: {0}")]
    WorkerFault(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}
