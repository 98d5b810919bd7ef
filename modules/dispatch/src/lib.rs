//! # dispatch-rs
//!
//! The dispatch and execution core of the River automation engine. Events
//! arrive on the River, the routing table maps their subject to bindings,
//! and each binding runs either a deterministic script (TreeHouse) or an
//! inference-backed decision (Nim). Derived events go back onto the River.

pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod dlq;
pub mod executors;
pub mod inflight;
pub mod metrics;
pub mod outcome;
pub mod routes;
pub mod routing;
pub mod template;

pub use dispatcher::{DispatchError, Dispatcher, DispatcherConfig};
pub use outcome::Outcome;
pub use routing::{
    BindingConfig, ConfigError, ConfigSnapshot, HandlerConfig, HandlerDefaults, HandlerEnv,
    RoutingHandle, RoutingTable,
};
