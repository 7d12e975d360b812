//! Marcus server binary support: configuration loading, telemetry, the
//! stdio transport, and the background workers. The binary in `main.rs`
//! wires these together.

pub mod config;
pub mod stdio;
pub mod telemetry;
pub mod workers;
