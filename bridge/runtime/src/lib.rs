//! Process bootstrap for the registry bridge: CLI parsing, the kubert
//! runtime, leader election, the broadcast listener, and the connector
//! controller that owns the sync engines.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
mod broker;
mod controller;
mod lease;
mod machine;
mod status;

pub use self::args::Args;
pub use self::broker::{Broker, BroadcastListener, Event, EventOp, Topic};
pub use self::controller::{
    AdapterFactory, AdapterSeams, BuiltinAdapters, Contexts, Controller, ReconcileError,
};
pub use self::machine::MachineDiscovery;
