//! The broker: a star-topology dispatcher enforcing the per-tick barrier.
//!
//! The broker has no compute loop of its own. It is a single-task reactor
//! over two sockets: the data ROUTER every module dials, and the control
//! DEALER to the manager. Frames accumulate until every edge in the routing
//! table has reported exactly once, then fan out to their destinations.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info, warn};
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::{RouterSocket, ZmqMessage};

use tickmesh_core::{ModuleId, RoutingTable};

use crate::error::FabricError;
use crate::message::{self, DataMessage, Delivery, TickPayload};
use crate::process::{ControlChannel, ControlCommand};
use crate::transport::Transport;

// ── Barrier bookkeeping ──────────────────────────────────────────────

/// Tracks which edges still owe a frame this tick and the payloads waiting
/// for the barrier to complete.
pub(crate) struct BarrierState {
    routing: RoutingTable,
    expected: HashSet<(ModuleId, ModuleId)>,
    data_to_route: Vec<(ModuleId, ModuleId, TickPayload)>,
}

impl BarrierState {
    pub(crate) fn new(routing: RoutingTable) -> Self {
        let expected = routing.coords().into_iter().collect();
        Self {
            routing,
            expected,
            data_to_route: Vec::new(),
        }
    }

    /// Record one frame. Returns true when the barrier just completed.
    ///
    /// Frames for edges not currently expected (duplicates, undeclared
    /// edges, late arrivals) are dropped without an error surface.
    pub(crate) fn observe(
        &mut self,
        src: ModuleId,
        dst: ModuleId,
        payload: TickPayload,
    ) -> bool {
        if !self.expected.remove(&(src.clone(), dst.clone())) {
            debug!(%src, %dst, "dropping frame for unexpected edge");
            return false;
        }
        self.data_to_route.push((src, dst, payload));
        self.expected.is_empty()
    }

    /// Take the collected tick for dispatch and re-arm the barrier.
    pub(crate) fn drain(&mut self) -> Vec<(ModuleId, Delivery)> {
        let out = self
            .data_to_route
            .drain(..)
            .map(|(src, dst, payload)| (dst, Delivery { src, payload }))
            .collect();
        self.expected = self.routing.coords().into_iter().collect();
        out
    }

    #[cfg(test)]
    fn remaining(&self) -> usize {
        self.expected.len()
    }
}

// ── Peer addressing ──────────────────────────────────────────────────

/// Learned `ModuleId -> ZeroMQ identity` map, with a per-destination queue
/// for deliveries that arrive before the destination has said hello.
#[derive(Default)]
pub(crate) struct PeerTable {
    identities: HashMap<ModuleId, Vec<u8>>,
    parked: HashMap<ModuleId, VecDeque<Delivery>>,
}

impl PeerTable {
    /// Record a peer's identity, returning any deliveries parked for it.
    pub(crate) fn register(&mut self, id: ModuleId, identity: Vec<u8>) -> Vec<Delivery> {
        self.identities.insert(id.clone(), identity);
        self.parked
            .remove(&id)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    pub(crate) fn identity_of(&self, id: &ModuleId) -> Option<&Vec<u8>> {
        self.identities.get(id)
    }

    pub(crate) fn park(&mut self, dst: ModuleId, delivery: Delivery) {
        self.parked.entry(dst).or_default().push_back(delivery);
    }
}

// ── Broker ───────────────────────────────────────────────────────────

/// Star-topology data dispatcher for a set of modules.
pub struct Broker {
    id: ModuleId,
    uid: Uuid,
    routing: RoutingTable,
}

impl Broker {
    /// Create a broker with a generated ID.
    pub fn new(routing: RoutingTable) -> Self {
        let uid = Uuid::new_v4();
        let short = uid.simple().to_string();
        Self {
            id: ModuleId::new(format!("broker-{}", &short[..8])),
            uid,
            routing,
        }
    }

    /// Create a broker with a caller-assigned ID.
    pub fn with_id(id: impl Into<ModuleId>, routing: RoutingTable) -> Self {
        Self {
            id: id.into(),
            uid: Uuid::new_v4(),
            routing,
        }
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    /// Instance identity, used by manager registries.
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    /// Run the broker reactor.
    ///
    /// Binds the data ROUTER, dials the manager's control endpoint, and
    /// loops until `quit`. Returns when shutdown completes or an
    /// unrecoverable control-channel error occurs.
    pub async fn run(self, data: Transport, control: Transport) -> Result<(), FabricError> {
        let mut ctrl = ControlChannel::connect(&self.id, &control).await?;

        data.ensure_ipc_dir()
            .map_err(|e| FabricError::Transport(e.to_string()))?;
        data.remove_stale_socket()
            .map_err(|e| FabricError::Transport(e.to_string()))?;
        let mut sock = RouterSocket::new();
        let endpoint = data.endpoint();
        sock.bind(&endpoint).await?;
        info!(id = %self.id, endpoint = %endpoint, edges = self.routing.len(),
            "broker data (ROUTER) bound");

        ctrl.announce_ready().await?;

        let mut barrier = BarrierState::new(self.routing.clone());
        let mut peers = PeerTable::default();

        loop {
            tokio::select! {
                cmd = ctrl.recv() => match cmd? {
                    ControlCommand::Quit => {
                        ctrl.ack().await?;
                        info!(id = %self.id, "broker shutting down");
                        break;
                    }
                    ControlCommand::Unknown(verb) => {
                        debug!(id = %self.id, verb = %verb, "ignoring control verb");
                        ctrl.ack().await?;
                    }
                },
                msg = sock.recv() => match msg {
                    Ok(msg) => {
                        Self::handle_frame(&mut sock, &mut barrier, &mut peers, msg).await;
                    }
                    Err(e) => {
                        warn!(id = %self.id, error = %e, "data recv error");
                    }
                },
            }
        }
        Ok(())
    }

    async fn handle_frame(
        sock: &mut RouterSocket,
        barrier: &mut BarrierState,
        peers: &mut PeerTable,
        msg: ZmqMessage,
    ) {
        let (identity, src, data) = match message::parse_data_frame(&msg) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "skipping malformed message");
                return;
            }
        };
        match data {
            DataMessage::Hello => {
                debug!(id = %src, "peer registered");
                for delivery in peers.register(src.clone(), identity) {
                    Self::deliver(sock, peers, &src, delivery).await;
                }
            }
            DataMessage::Tick { dst, payload } => {
                // a tick also refreshes the sender's identity
                for delivery in peers.register(src.clone(), identity) {
                    Self::deliver(sock, peers, &src, delivery).await;
                }
                debug!(%src, %dst, sentinel = payload.is_sentinel(), "recv tick data");
                if barrier.observe(src, dst, payload) {
                    debug!("recv from all expected edges, dispatching");
                    for (dst, delivery) in barrier.drain() {
                        if peers.identity_of(&dst).is_some() {
                            Self::deliver(sock, peers, &dst, delivery).await;
                        } else {
                            debug!(%dst, "destination not yet registered, parking");
                            peers.park(dst, delivery);
                        }
                    }
                }
            }
        }
    }

    async fn deliver(sock: &mut RouterSocket, peers: &PeerTable, dst: &ModuleId, delivery: Delivery) {
        let Some(identity) = peers.identity_of(dst) else {
            warn!(%dst, "no identity for destination, dropping delivery");
            return;
        };
        match message::delivery_frame(identity, &delivery) {
            Ok(frame) => {
                if let Err(e) = sock.send(frame).await {
                    warn!(%dst, error = %e, "delivery send error");
                }
            }
            Err(e) => {
                warn!(%dst, error = %e, "failed to encode delivery");
            }
        }
    }
}
