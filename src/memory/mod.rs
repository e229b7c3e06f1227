//! Memory store: durable, explicit, model-agnostic record of conversation
//! turns and pinned facts, kept in its own database file.

pub mod service;
pub mod store;
pub mod types;

pub use service::MemoryService;
pub use types::{ForgetTarget, MemoryLogEntry, MemoryRecord, ReadOptions, Role, SessionSummary};
