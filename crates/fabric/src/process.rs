//! Control-channel plumbing shared by every controlled worker.
//!
//! Each worker (module or broker) dials the manager's control ROUTER with a
//! DEALER, announces itself with `ready`, and then listens for commands for
//! the rest of its life. `quit` obliges the worker to flush, stop its
//! reactor, acknowledge, and terminate; any other verb is acknowledged and
//! otherwise ignored. Losing this channel is fatal to the worker.

use tracing::{debug, info};
use zeromq::prelude::*;
use zeromq::DealerSocket;

use tickmesh_core::ModuleId;

use crate::error::FabricError;
use crate::message::{self, verbs};
use crate::transport::Transport;

/// A command decoded from the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Quit,
    Unknown(String),
}

/// Worker-side handle on the manager's control socket.
pub struct ControlChannel {
    id: ModuleId,
    socket: DealerSocket,
}

impl ControlChannel {
    /// Dial the manager's control endpoint.
    pub async fn connect(id: &ModuleId, transport: &Transport) -> Result<Self, FabricError> {
        let mut socket = DealerSocket::new();
        let endpoint = transport.endpoint();
        socket.connect(&endpoint).await?;
        info!(id = %id, endpoint = %endpoint, "control channel connected");
        Ok(Self {
            id: id.clone(),
            socket,
        })
    }

    /// Tell the manager this worker's sockets are up.
    pub async fn announce_ready(&mut self) -> Result<(), FabricError> {
        self.socket
            .send(message::ctrl_frame(&self.id, verbs::READY))
            .await
            .map_err(|e| FabricError::ControlChannelLost(e.to_string()))?;
        debug!(id = %self.id, "sent ready");
        Ok(())
    }

    /// Wait for the next control command.
    ///
    /// Unparseable frames decode to `Unknown` so the caller can acknowledge
    /// and move on; only a transport failure is an error.
    pub async fn recv(&mut self) -> Result<ControlCommand, FabricError> {
        let msg = self
            .socket
            .recv()
            .await
            .map_err(|e| FabricError::ControlChannelLost(e.to_string()))?;
        let verb = message::parse_ctrl_verb(&msg).unwrap_or_default();
        debug!(id = %self.id, verb = %verb, "recv ctrl message");
        match verb.as_str() {
            verbs::QUIT => Ok(ControlCommand::Quit),
            _ => Ok(ControlCommand::Unknown(verb)),
        }
    }

    /// Acknowledge the last command.
    pub async fn ack(&mut self) -> Result<(), FabricError> {
        self.socket
            .send(message::ctrl_frame(&self.id, verbs::ACK))
            .await
            .map_err(|e| FabricError::ControlChannelLost(e.to_string()))?;
        debug!(id = %self.id, "sent ack");
        Ok(())
    }
}
