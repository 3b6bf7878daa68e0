//! Module runtime: the per-tick worker loop.
//!
//! A module repeatedly ingests the previous tick's inputs, runs its compute
//! body, projects the output vector onto each declared outbound peer, and
//! synchronizes with the broker. The broker's barrier guarantees that no
//! module observes tick `t` inputs until every module has sent its tick `t`
//! outputs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::DealerSocket;

use tickmesh_core::{Connectivity, ModuleId};

use crate::error::FabricError;
use crate::message::{self, DataMessage, Delivery, PortArray, TickPayload};
use crate::process::{ControlChannel, ControlCommand};
use crate::transport::Transport;

/// How long an idle sync phase waits on the control channel before the next
/// tick. Modules with inbound edges are paced by the barrier instead.
const CTRL_POLL: Duration = Duration::from_millis(10);

// ── Net mode ─────────────────────────────────────────────────────────

/// A module's network participation level.
///
/// Upgrades monotonically over the module's lifetime:
/// `none < ctrl < {in, out} < full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetMode {
    None,
    Ctrl,
    In,
    Out,
    Full,
}

impl NetMode {
    /// Position in the upgrade order.
    pub fn rank(self) -> u8 {
        match self {
            NetMode::None => 0,
            NetMode::Ctrl => 1,
            NetMode::In | NetMode::Out => 2,
            NetMode::Full => 3,
        }
    }

    fn with_outbound(self) -> NetMode {
        match self {
            NetMode::Ctrl => NetMode::Out,
            NetMode::In => NetMode::Full,
            other => other,
        }
    }

    fn with_inbound(self) -> NetMode {
        match self {
            NetMode::Ctrl => NetMode::In,
            NetMode::Out => NetMode::Full,
            other => other,
        }
    }

    fn sends(self) -> bool {
        matches!(self, NetMode::Out | NetMode::Full)
    }

    fn receives(self) -> bool {
        matches!(self, NetMode::In | NetMode::Full)
    }

    fn exchanges_data(self) -> bool {
        self.sends() || self.receives()
    }
}

impl std::fmt::Display for NetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetMode::None => "none",
            NetMode::Ctrl => "ctrl",
            NetMode::In => "in",
            NetMode::Out => "out",
            NetMode::Full => "full",
        };
        f.write_str(s)
    }
}

// ── Compute body ─────────────────────────────────────────────────────

/// A module's compute step.
///
/// `inputs` maps each peer that delivered real data this tick to its
/// payload; peers that sent the absence sentinel have no entry. `out` is the
/// module's output vector, sized to its port count; the runtime projects it
/// onto each outbound peer after the call returns.
pub trait TickBody: Send + 'static {
    fn run_step(&mut self, inputs: &HashMap<ModuleId, PortArray>, out: &mut [f64]);
}

impl<F> TickBody for F
where
    F: FnMut(&HashMap<ModuleId, PortArray>, &mut [f64]) + Send + 'static,
{
    fn run_step(&mut self, inputs: &HashMap<ModuleId, PortArray>, out: &mut [f64]) {
        self(inputs, out)
    }
}

// ── Module ───────────────────────────────────────────────────────────

enum Flow {
    Continue,
    Quit,
}

/// A compute worker with a fixed port count.
pub struct Module {
    id: ModuleId,
    uid: Uuid,
    ports: usize,
    net: NetMode,
    conns: IndexMap<ModuleId, Arc<Connectivity>>,
    in_ids: Vec<ModuleId>,
    out_ids: Vec<ModuleId>,
    in_buf: Vec<(ModuleId, PortArray)>,
    out_buf: Vec<(ModuleId, TickPayload)>,
    body: Box<dyn TickBody>,
}

impl Module {
    pub fn new(id: impl Into<ModuleId>, ports: usize, body: impl TickBody) -> Self {
        Self {
            id: id.into(),
            uid: Uuid::new_v4(),
            ports,
            net: NetMode::None,
            conns: IndexMap::new(),
            in_ids: Vec::new(),
            out_ids: Vec::new(),
            in_buf: Vec::new(),
            out_buf: Vec::new(),
            body: Box::new(body),
        }
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    /// Instance identity, used by manager registries.
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    pub fn ports(&self) -> usize {
        self.ports
    }

    pub fn net(&self) -> NetMode {
        self.net
    }

    /// Peers that send data to this module.
    pub fn in_ids(&self) -> &[ModuleId] {
        &self.in_ids
    }

    /// Peers that receive data from this module.
    pub fn out_ids(&self) -> &[ModuleId] {
        &self.out_ids
    }

    /// All peers this module shares a connectivity object with.
    pub fn all_ids(&self) -> Vec<ModuleId> {
        self.conns.keys().cloned().collect()
    }

    /// Attach a connectivity object relating this module to a peer.
    ///
    /// The module's ID must be one of the object's two sides and the port
    /// counts must agree. The net mode upgrades according to the edges the
    /// object declares.
    pub fn add_conn(&mut self, conn: Arc<Connectivity>) -> Result<(), FabricError> {
        let peer = conn.other_mod(&self.id)?.clone();
        let n = conn.n(&self.id)?;
        if n != self.ports {
            return Err(FabricError::Core(tickmesh_core::CoreError::InvalidShape(
                format!(
                    "connectivity declares {n} ports for '{}' but the module has {}",
                    self.id, self.ports
                ),
            )));
        }
        info!(id = %self.id, peer = %peer, "connecting to peer");

        let outbound = conn.is_connected(&self.id, &peer).unwrap_or(false);
        let inbound = conn.is_connected(&peer, &self.id).unwrap_or(false);
        self.conns.insert(peer, conn);

        if self.net == NetMode::None {
            self.set_net(NetMode::Ctrl);
        }
        if outbound {
            self.set_net(self.net.with_outbound());
        }
        if inbound {
            self.set_net(self.net.with_inbound());
        }
        self.rebuild_peer_ids();
        Ok(())
    }

    fn set_net(&mut self, to: NetMode) {
        if to != self.net {
            info!(id = %self.id, from = %self.net, to = %to, "net status changed");
            self.net = to;
        }
    }

    fn rebuild_peer_ids(&mut self) {
        self.in_ids.clear();
        self.out_ids.clear();
        for (peer, conn) in &self.conns {
            if conn.is_connected(peer, &self.id).unwrap_or(false) {
                self.in_ids.push(peer.clone());
            }
            if conn.is_connected(&self.id, peer).unwrap_or(false) {
                self.out_ids.push(peer.clone());
            }
        }
    }

    // ── Tick phases ──────────────────────────────────────────────────

    /// Move the incoming buffer into the tick's input map.
    fn ingest(&mut self, inputs: &mut HashMap<ModuleId, PortArray>) {
        inputs.clear();
        for (src, arr) in self.in_buf.drain(..) {
            inputs.insert(src, arr);
        }
    }

    /// Stage one payload per declared outbound peer.
    ///
    /// A peer whose projection selects no ports gets the absence sentinel so
    /// the broker's barrier still sees the edge.
    fn project(&mut self, out: &[f64]) {
        self.out_buf.clear();
        for dst in &self.out_ids {
            let idx = match self.conns.get(dst) {
                Some(conn) => conn.src_idx(&self.id, dst, None).unwrap_or_default(),
                None => Vec::new(),
            };
            let payload = if idx.is_empty() {
                TickPayload::Empty
            } else {
                let values: Vec<f64> = idx.iter().map(|&i| out[i]).collect();
                TickPayload::Data(PortArray::from_f64(values))
            };
            self.out_buf.push((dst.clone(), payload));
        }
    }

    /// Send one frame per outbound edge, then receive one per inbound edge.
    async fn sync(
        &mut self,
        ctrl: &mut ControlChannel,
        link: Option<&mut DataLink>,
    ) -> Result<Flow, FabricError> {
        if !self.net.exchanges_data() {
            return self.idle_poll(ctrl).await;
        }
        let link = link.ok_or_else(|| {
            FabricError::Transport("data link not initialized for a networked module".to_string())
        })?;

        if self.net.sends() {
            self.flush_out(link).await?;
        }
        if self.net.receives() {
            return self.collect_in(ctrl, link).await;
        }
        // outbound-only: no barrier paces this module, so give the control
        // channel a bounded window instead
        self.idle_poll(ctrl).await
    }

    async fn idle_poll(&mut self, ctrl: &mut ControlChannel) -> Result<Flow, FabricError> {
        match timeout(CTRL_POLL, ctrl.recv()).await {
            Ok(Ok(ControlCommand::Quit)) => {
                ctrl.ack().await?;
                Ok(Flow::Quit)
            }
            Ok(Ok(ControlCommand::Unknown(verb))) => {
                debug!(id = %self.id, verb = %verb, "ignoring control verb");
                ctrl.ack().await?;
                Ok(Flow::Continue)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(Flow::Continue),
        }
    }

    async fn flush_out(&mut self, link: &mut DataLink) -> Result<(), FabricError> {
        let mut staged: HashMap<ModuleId, TickPayload> = self.out_buf.drain(..).collect();
        for dst in &self.out_ids {
            let payload = staged.remove(dst).unwrap_or(TickPayload::Empty);
            debug!(id = %self.id, dst = %dst, sentinel = payload.is_sentinel(), "sending tick data");
            link.send_tick(dst, payload).await?;
        }
        Ok(())
    }

    async fn collect_in(
        &mut self,
        ctrl: &mut ControlChannel,
        link: &mut DataLink,
    ) -> Result<Flow, FabricError> {
        let mut pending: HashSet<ModuleId> = self.in_ids.iter().cloned().collect();
        self.in_buf.clear();
        while !pending.is_empty() {
            tokio::select! {
                cmd = ctrl.recv() => match cmd? {
                    ControlCommand::Quit => {
                        ctrl.ack().await?;
                        return Ok(Flow::Quit);
                    }
                    ControlCommand::Unknown(verb) => {
                        debug!(id = %self.id, verb = %verb, "ignoring control verb");
                        ctrl.ack().await?;
                    }
                },
                delivery = link.recv_delivery() => match delivery {
                    Ok(Delivery { src, payload }) => {
                        if !pending.remove(&src) {
                            warn!(id = %self.id, src = %src, "dropping frame from unexpected source");
                            continue;
                        }
                        debug!(id = %self.id, src = %src, sentinel = payload.is_sentinel(), "recv tick data");
                        if let TickPayload::Data(arr) = payload {
                            self.in_buf.push((src, arr));
                        }
                    }
                    Err(FabricError::InvalidMessage(e)) => {
                        warn!(id = %self.id, error = %e, "skipping malformed message");
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(Flow::Continue)
    }

    /// Run the module to completion.
    ///
    /// Connects the control channel (and, for networked modules, the data
    /// link), announces readiness, then loops over ticks until `quit`.
    pub async fn run(
        mut self,
        data: Transport,
        control: Transport,
    ) -> Result<(), FabricError> {
        let mut ctrl = ControlChannel::connect(&self.id, &control).await?;
        let mut link = if self.net.exchanges_data() {
            let mut link = DataLink::connect(&self.id, &data).await?;
            link.hello().await?;
            Some(link)
        } else {
            None
        };
        ctrl.announce_ready().await?;
        info!(id = %self.id, net = %self.net, "module started");

        let mut inputs = HashMap::new();
        let mut out = vec![0.0f64; self.ports];
        loop {
            self.ingest(&mut inputs);
            self.body.run_step(&inputs, &mut out);
            self.project(&out);
            match self.sync(&mut ctrl, link.as_mut()).await? {
                Flow::Continue => {}
                Flow::Quit => break,
            }
        }
        info!(id = %self.id, "module exiting");
        Ok(())
    }
}

// ── Data link ────────────────────────────────────────────────────────

/// A module's DEALER connection to the broker's data ROUTER.
struct DataLink {
    id: ModuleId,
    socket: DealerSocket,
}

impl DataLink {
    async fn connect(id: &ModuleId, transport: &Transport) -> Result<Self, FabricError> {
        let mut socket = DealerSocket::new();
        let endpoint = transport.endpoint();
        socket.connect(&endpoint).await?;
        info!(id = %id, endpoint = %endpoint, "data link connected");
        Ok(Self {
            id: id.clone(),
            socket,
        })
    }

    /// Register this module's identity with the broker.
    async fn hello(&mut self) -> Result<(), FabricError> {
        self.socket
            .send(message::data_frame(&self.id, &DataMessage::Hello)?)
            .await?;
        Ok(())
    }

    async fn send_tick(&mut self, dst: &ModuleId, payload: TickPayload) -> Result<(), FabricError> {
        let msg = DataMessage::Tick {
            dst: dst.clone(),
            payload,
        };
        self.socket
            .send(message::data_frame(&self.id, &msg)?)
            .await?;
        Ok(())
    }

    async fn recv_delivery(&mut self) -> Result<Delivery, FabricError> {
        let msg = self.socket.recv().await?;
        message::parse_delivery_frame(&msg)
    }
}
