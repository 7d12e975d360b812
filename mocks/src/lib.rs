//! Test doubles for the coordination core.
//!
//! Fault-injecting wrappers with call-history assertions, a scripted oracle,
//! and builders/fixtures for common board shapes. Everything here is
//! deterministic; tests drive every failure explicitly.

mod builders;
mod fixtures;
mod oracle;
mod provider;
mod store;

pub use builders::TaskBuilder;
pub use fixtures::{linear_chain, parallel_tasks, parent_with_children};
pub use oracle::ScriptedOracle;
pub use provider::RecordingProvider;
pub use store::FlakyStore;
