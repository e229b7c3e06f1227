//! Context assembly: the only place retrieval results and memory meet.
//! Runs on explicit request only.

pub mod assembler;
pub mod inference;

pub use assembler::{ContextAssembler, ContextBundle};
pub use inference::InferenceRequest;
