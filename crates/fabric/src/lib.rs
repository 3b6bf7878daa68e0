pub mod broker;
pub mod config;
pub mod error;
pub mod manager;
pub mod message;
pub mod module;
pub mod process;
pub mod registry;
pub mod transport;

pub use broker::Broker;
pub use config::{FabricConfig, RouteConfig, PORT_CTRL, PORT_DATA};
pub use error::FabricError;
pub use manager::Manager;
pub use message::{verbs, ArrayData, DataMessage, Delivery, PortArray, TickPayload};
pub use module::{Module, NetMode, TickBody};
pub use process::{ControlChannel, ControlCommand};
pub use transport::Transport;

pub use tickmesh_core::{Connectivity, CoreError, ModuleId, ParamValue, RoutingTable};
