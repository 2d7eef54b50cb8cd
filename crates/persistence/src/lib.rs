//! NLQ Persistence - durable session storage.
//!
//! Backends:
//! - JSON file storage (one file per session, atomic writes)
//!
//! Every externally observable session mutation is checkpointed through
//! this layer; a complete snapshot round-trips losslessly.

pub mod json;
pub mod store;

pub use json::JsonSessionStore;
pub use store::{RetentionPolicy, SessionStore, SessionSummary, StoreError};
