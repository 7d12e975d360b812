//! The request/response tool surface over the coordination core.
//!
//! Transport and authentication live outside; this crate consumes
//! already-authenticated calls tagged with a client role, gates them by the
//! role table, and wraps every outcome in the
//! `{ok, error_kind, message, retryable}` envelope. Panics inside handlers
//! are caught here and converted to an error envelope, never propagated.

mod envelope;
mod handler;
mod params;
mod roles;

pub use envelope::Envelope;
pub use handler::ToolHandler;
pub use params::*;
pub use roles::{required_access, Access};
