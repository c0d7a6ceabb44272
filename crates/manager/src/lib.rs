//! Node server manager.
//!
//! Supervises worker processes ("node servers"): launches them over stdio
//! or MQTT, hands them their persisted config, watches them with
//! ping/pong heartbeats, restarts them when they crash, and relays traffic
//! between them and the home-automation controller with node addresses
//! rewritten at the boundary.

pub mod backoff;
pub mod controller;
pub mod heartbeat;
pub mod manager;
pub mod session;
pub mod store;
pub mod transport;

pub use controller::{Controller, ControllerError, Delivery};
pub use manager::{Manager, ManagerBuilder, ManagerError, ManagerHandle, RuntimeInfo};
pub use session::{CrashReason, RequestOutcome, RequestTicket, SessionInfo, SessionState};
pub use store::{ConfigStore, FileConfigStore, StoreError};
pub use transport::{
    EventSink, EventSource, InboundEvent, InboundKind, LaunchSpec, Launcher, SystemLauncher, TransportError,
    WorkerTransport,
};
