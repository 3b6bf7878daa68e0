pub mod connectivity;
pub mod error;
pub mod id;
pub mod matrix;
pub mod routing;

pub use connectivity::{Connectivity, PARAM_CONN};
pub use error::CoreError;
pub use id::ModuleId;
pub use matrix::{ParamType, ParamValue, SparseMatrix};
pub use routing::RoutingTable;
