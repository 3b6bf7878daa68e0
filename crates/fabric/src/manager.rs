//! The manager: topology owner and control plane.
//!
//! The manager assigns the routing table before any worker starts, spawns
//! the broker first and then every module, and owns the control ROUTER that
//! all workers dial. Stopping sends `quit` to every module, awaits each
//! acknowledgment, then quits the broker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::RouterSocket;

use tickmesh_core::{Connectivity, CoreError, ModuleId, RoutingTable};

use crate::broker::Broker;
use crate::config::FabricConfig;
use crate::error::FabricError;
use crate::message::{self, verbs};
use crate::module::Module;
use crate::registry::Registry;

enum ModuleSlot {
    Idle(Module),
    Running(JoinHandle<Result<(), FabricError>>),
    Done,
}

enum BrokerSlot {
    Idle,
    Running(JoinHandle<Result<(), FabricError>>),
    Done,
}

/// Owner of the emulation topology and the control channel.
pub struct Manager {
    id: String,
    config: FabricConfig,
    sock_ctrl: RouterSocket,
    modules: Registry<ModuleId, ModuleSlot>,
    brokers: Registry<ModuleId, BrokerSlot>,
    conns: Registry<Uuid, Arc<Connectivity>>,
    routing: RoutingTable,
    identities: HashMap<ModuleId, Vec<u8>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Manager {
    /// Validate the config and bind the control ROUTER.
    pub async fn bind(config: FabricConfig) -> Result<Self, FabricError> {
        config.validate()?;
        let control = config.control_transport()?;
        control
            .ensure_ipc_dir()
            .map_err(|e| FabricError::Transport(e.to_string()))?;
        control
            .remove_stale_socket()
            .map_err(|e| FabricError::Transport(e.to_string()))?;
        let mut sock_ctrl = RouterSocket::new();
        let endpoint = control.endpoint();
        sock_ctrl.bind(&endpoint).await?;

        let id = format!("manager-{}", &Uuid::new_v4().simple().to_string()[..8]);
        info!(id = %id, endpoint = %endpoint, "manager control (ROUTER) bound");
        Ok(Self {
            id,
            config,
            sock_ctrl,
            modules: Registry::new(),
            brokers: Registry::new(),
            conns: Registry::new(),
            routing: RoutingTable::new(),
            identities: HashMap::new(),
        })
    }

    // ── Topology assembly ────────────────────────────────────────────

    /// Register a module for this emulation.
    pub fn add_module(&mut self, module: Module) -> Result<ModuleId, FabricError> {
        let id = module.id().clone();
        let uid = module.uid();
        self.modules.insert(id.clone(), uid, ModuleSlot::Idle(module))?;
        info!(manager = %self.id, module = %id, "added module");
        Ok(id)
    }

    /// Register the broker. At most one broker is supported.
    pub fn add_broker(&mut self) -> Result<ModuleId, FabricError> {
        if !self.brokers.is_empty() {
            return Err(FabricError::Config("only one broker allowed".to_string()));
        }
        let uid = Uuid::new_v4();
        let id = ModuleId::new(format!("broker-{}", &uid.simple().to_string()[..8]));
        self.brokers.insert(id.clone(), uid, BrokerSlot::Idle)?;
        info!(manager = %self.id, broker = %id, "added broker");
        Ok(id)
    }

    /// Connect two registered modules with a connectivity object.
    ///
    /// Both modules learn the object, and the routing table gains an edge
    /// for each direction the object actually connects.
    pub fn connect(
        &mut self,
        a: &ModuleId,
        b: &ModuleId,
        conn: Connectivity,
    ) -> Result<Arc<Connectivity>, FabricError> {
        if conn.other_mod(a)? != b {
            return Err(FabricError::Core(CoreError::UnknownModule(b.to_string())));
        }
        let conn = Arc::new(conn);
        if !self.conns.contains_uid(&conn.uid()) {
            self.conns.insert(conn.uid(), conn.uid(), conn.clone())?;
            info!(manager = %self.id, conn = %conn.uid(), "added connectivity");
        }

        for id in [a, b] {
            match self.modules.get_mut(id) {
                Some(ModuleSlot::Idle(module)) => module.add_conn(conn.clone())?,
                Some(_) => {
                    return Err(FabricError::Config(format!(
                        "module '{id}' is already running"
                    )))
                }
                None => {
                    return Err(FabricError::Core(CoreError::UnknownModule(id.to_string())))
                }
            }
        }

        if conn.is_connected(a, b)? {
            self.routing.add(a.clone(), b.clone())?;
        }
        if conn.is_connected(b, a)? {
            self.routing.add(b.clone(), a.clone())?;
        }
        Ok(conn)
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// Reverse membership: has this connectivity instance been registered?
    pub fn has_connectivity(&self, conn: &Connectivity) -> bool {
        self.conns.contains_uid(&conn.uid())
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start the broker, wait for it, then start every module and wait for
    /// each to report ready.
    pub async fn start(&mut self) -> Result<(), FabricError> {
        let data = self.config.data_transport()?;
        let control = self.config.control_transport()?;

        let mut broker_ids = HashSet::new();
        for (id, slot) in self.brokers.iter_mut() {
            if matches!(slot, BrokerSlot::Idle) {
                let broker = Broker::with_id(id.clone(), self.routing.clone());
                let (d, c) = (data.clone(), control.clone());
                *slot = BrokerSlot::Running(tokio::spawn(async move { broker.run(d, c).await }));
                broker_ids.insert(id.clone());
            }
        }
        self.await_ready(broker_ids).await?;

        let mut module_ids = HashSet::new();
        let ids: Vec<ModuleId> = self.modules.keys().cloned().collect();
        for id in ids {
            if let Some(slot) = self.modules.get_mut(&id) {
                match std::mem::replace(slot, ModuleSlot::Done) {
                    ModuleSlot::Idle(module) => {
                        let (d, c) = (data.clone(), control.clone());
                        *slot =
                            ModuleSlot::Running(tokio::spawn(
                                async move { module.run(d, c).await },
                            ));
                        module_ids.insert(id);
                    }
                    other => *slot = other,
                }
            }
        }
        self.await_ready(module_ids).await?;
        info!(manager = %self.id, "all workers ready");
        Ok(())
    }

    async fn await_ready(&mut self, mut expected: HashSet<ModuleId>) -> Result<(), FabricError> {
        if expected.is_empty() {
            return Ok(());
        }
        let window = self.config.ready_timeout();
        let sock = &mut self.sock_ctrl;
        let identities = &mut self.identities;
        let wait = async {
            while !expected.is_empty() {
                let msg = sock.recv().await?;
                match message::parse_ctrl_frame(&msg) {
                    Ok((identity, id, verb)) if verb == verbs::READY => {
                        if expected.remove(&id) {
                            debug!(worker = %id, "worker ready");
                            identities.insert(id, identity);
                        }
                    }
                    Ok((_, id, verb)) => {
                        debug!(worker = %id, verb = %verb, "ignoring control message");
                    }
                    Err(e) => warn!(error = %e, "skipping malformed message"),
                }
            }
            Ok::<(), FabricError>(())
        };
        timeout(window, wait)
            .await
            .map_err(|_| FabricError::Timeout(window))?
    }

    /// Send a control verb to a worker and wait for its acknowledgment.
    pub async fn send_ctrl(&mut self, id: &ModuleId, verb: &str) -> Result<(), FabricError> {
        let identity = self
            .identities
            .get(id)
            .cloned()
            .ok_or_else(|| FabricError::Core(CoreError::UnknownModule(id.to_string())))?;
        self.sock_ctrl
            .send(message::ctrl_reply(identity, verb))
            .await?;
        debug!(manager = %self.id, worker = %id, verb = %verb, "sent control message");
        self.await_ack(id).await
    }

    async fn await_ack(&mut self, id: &ModuleId) -> Result<(), FabricError> {
        let window = self.config.shutdown_timeout();
        let sock = &mut self.sock_ctrl;
        let wait = async {
            loop {
                let msg = sock.recv().await?;
                match message::parse_ctrl_frame(&msg) {
                    Ok((_, from, verb)) if verb == verbs::ACK && from == *id => {
                        debug!(worker = %from, "recv ack");
                        return Ok::<(), FabricError>(());
                    }
                    Ok((_, from, verb)) => {
                        debug!(worker = %from, verb = %verb, "ignoring control message");
                    }
                    Err(e) => warn!(error = %e, "skipping malformed message"),
                }
            }
        };
        timeout(window, wait)
            .await
            .map_err(|_| FabricError::Timeout(window))?
    }

    /// Stop every module, then the broker.
    ///
    /// A worker that fails to acknowledge within the shutdown window is
    /// reported as a fault but does not block stopping the rest.
    pub async fn stop(&mut self) -> Result<(), FabricError> {
        info!(manager = %self.id, "stopping all workers");
        let linger = self.config.linger();
        let mut faulted: Vec<ModuleId> = Vec::new();

        let module_ids: Vec<ModuleId> = self.modules.keys().cloned().collect();
        for id in &module_ids {
            if let Err(e) = self.send_ctrl(id, verbs::QUIT).await {
                warn!(worker = %id, error = %e, "no acknowledgment for quit");
                faulted.push(id.clone());
            }
            if let Some(slot) = self.modules.get_mut(id) {
                if let ModuleSlot::Running(handle) = std::mem::replace(slot, ModuleSlot::Done) {
                    join_worker(id, linger, handle).await;
                }
            }
        }
        info!(manager = %self.id, "all modules stopped");

        let broker_ids: Vec<ModuleId> = self.brokers.keys().cloned().collect();
        for id in &broker_ids {
            if let Err(e) = self.send_ctrl(id, verbs::QUIT).await {
                warn!(broker = %id, error = %e, "no acknowledgment for quit");
                faulted.push(id.clone());
            }
            if let Some(slot) = self.brokers.get_mut(id) {
                if let BrokerSlot::Running(handle) = std::mem::replace(slot, BrokerSlot::Done) {
                    join_worker(id, linger, handle).await;
                }
            }
        }
        info!(manager = %self.id, "all brokers stopped");

        if faulted.is_empty() {
            Ok(())
        } else {
            let list = faulted
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            Err(FabricError::WorkerFault(list))
        }
    }
}

/// Join a worker task, bounding the wait so shutdown never hangs.
async fn join_worker(
    id: &ModuleId,
    linger: Duration,
    mut handle: JoinHandle<Result<(), FabricError>>,
) {
    match timeout(linger, &mut handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(worker = %id, error = %e, "worker exited with error"),
        Ok(Err(e)) => warn!(worker = %id, error = %e, "worker task panicked"),
        Err(_) => {
            handle.abort();
            warn!(worker = %id, "worker did not exit within the linger window");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PortArray;
    use std::collections::HashMap as StdHashMap;

    fn noop_module(id: &str) -> Module {
        Module::new(
            id,
            3,
            |_inputs: &StdHashMap<ModuleId, PortArray>, _out: &mut [f64]| {},
        )
    }

    fn identity_conn(a: &ModuleId, b: &ModuleId) -> Connectivity {
        let mut c = Connectivity::new(3, 3, a.as_str(), b.as_str()).unwrap();
        for i in 0..3 {
            c.set(a, i, b, i).unwrap();
        }
        c
    }

    #[tokio::test]
    async fn connect_updates_the_routing_table() {
        let mut man = Manager::bind(FabricConfig::tcp("127.0.0.1", 18500, 18501))
            .await
            .unwrap();
        let m1 = man.add_module(noop_module("m1")).unwrap();
        let m2 = man.add_module(noop_module("m2")).unwrap();

        let conn = identity_conn(&m1, &m2);
        let arc = man.connect(&m1, &m2, conn).unwrap();

        assert!(man.routing().contains(&m1, &m2));
        assert!(!man.routing().contains(&m2, &m1));
        assert!(man.has_connectivity(&arc));
        assert_eq!(man.conn_count(), 1);
    }

    #[tokio::test]
    async fn connect_requires_registered_modules() {
        let mut man = Manager::bind(FabricConfig::tcp("127.0.0.1", 18510, 18511))
            .await
            .unwrap();
        let m1 = man.add_module(noop_module("m1")).unwrap();
        let ghost = ModuleId::new("ghost");

        let conn = identity_conn(&m1, &ghost);
        let err = man.connect(&m1, &ghost, conn).unwrap_err();
        assert!(matches!(
            err,
            FabricError::Core(CoreError::UnknownModule(_))
        ));
    }

    #[tokio::test]
    async fn connect_rejects_a_mismatched_pair() {
        let mut man = Manager::bind(FabricConfig::tcp("127.0.0.1", 18520, 18521))
            .await
            .unwrap();
        let m1 = man.add_module(noop_module("m1")).unwrap();
        let m2 = man.add_module(noop_module("m2")).unwrap();
        let m3 = man.add_module(noop_module("m3")).unwrap();

        let conn = identity_conn(&m1, &m3);
        assert!(man.connect(&m1, &m2, conn).is_err());
    }

    #[tokio::test]
    async fn duplicate_module_ids_are_rejected() {
        let mut man = Manager::bind(FabricConfig::tcp("127.0.0.1", 18530, 18531))
            .await
            .unwrap();
        man.add_module(noop_module("m1")).unwrap();
        assert!(man.add_module(noop_module("m1")).is_err());
    }

    #[tokio::test]
    async fn only_one_broker_is_allowed() {
        let mut man = Manager::bind(FabricConfig::tcp("127.0.0.1", 18540, 18541))
            .await
            .unwrap();
        man.add_broker().unwrap();
        assert!(man.add_broker().is_err());
        assert_eq!(man.broker_count(), 1);
    }

    #[tokio::test]
    async fn port_conflict_fails_at_bind() {
        let err = Manager::bind(FabricConfig::tcp("127.0.0.1", 18550, 18550))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::PortConflict(_)));
    }
}
