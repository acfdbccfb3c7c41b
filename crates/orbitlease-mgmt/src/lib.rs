//! Orbitlease management: admin HTTP API, telemetry ingest, lifecycle sweeps and CLI

pub mod api;
pub mod cli;
pub mod config;
pub mod ingest;
pub mod inventory;
pub mod server;

pub use api::{AdminApi, ApiError};
pub use config::{LogFormat, MgmtConfig};
pub use ingest::{run_lifecycle_sweeps, run_telemetry_ingest, sweep_once};
pub use inventory::Inventory;
pub use server::serve;
