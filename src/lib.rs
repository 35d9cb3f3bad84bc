//! `rina-core`: a process-wide registry and lifecycle manager for RINA
//! (Recursive InterNetwork Architecture) IPC processes (IPCPs), flows and
//! registered applications.
//!
//! This crate owns the control-plane bookkeeping a RINA implementation
//! needs — IPCP/flow/port-id tables, the flow-allocation and
//! application-registration state machines, per-connection upstream
//! queues, and the update broadcaster — and leaves datapath behavior
//! (PDU encoding, DTP/DTCP, scheduling) to pluggable [`factory::Factory`]
//! implementations. See `SPEC_FULL.md` in the repository root for the
//! full functional specification this crate implements.
//!
//! [`server::Server`] wires the control-plane core to a Unix Domain
//! Socket transport for the `rina-core` demo binary; embedders that want
//! a different transport can drive [`dispatcher::Dispatcher`] directly.

pub mod app_registry;
pub mod broadcaster;
pub mod cli;
pub mod config;
pub mod control_device;
pub mod dif;
pub mod dispatcher;
pub mod dm;
pub mod error;
pub mod factory;
pub mod fetch;
pub mod flow;
pub mod flow_alloc;
pub mod ids;
pub mod ipcp;
pub mod lifecycle;
pub mod logging;
pub mod message;
pub mod namespace;
pub mod queue;
pub mod server;

pub use error::{Error, Result};
