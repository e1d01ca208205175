//! Control plane state for tunnel routing

pub mod registry;

pub use registry::{ClosedConnection, ConnId, SessionEnd, Target, TunnelRegistry};
