//! Monitor: registry of nodes, decision engine and HTTP API

pub mod engine;
pub mod events;
pub mod http;
pub mod model;
pub mod quorum;
pub mod registry;
pub mod server;
pub mod service;
pub mod store;

pub use engine::{Engine, EngineConfig};
pub use events::Event;
pub use model::{Group, GroupKey, Node};
pub use registry::{Registry, DEFAULT_FORMATION};
pub use server::Monitor;
pub use service::MonitorService;
