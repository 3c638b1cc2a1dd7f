//! Local memory engine for AI agents.
//!
//! Memories are classified into cognitive sectors, embedded once per sector
//! and persisted in SQLite. Retrieval ranks by cosine similarity damped by an
//! activation score that decays exponentially over time and is reinforced
//! whenever a memory is returned. Optional background passes compress long
//! content and synthesize reflective memories from clusters of related ones.
//!
//! Callers use [`MemoryEngine`]; the modules below are exposed for custom
//! gateways, summarizers and ranking policies.

pub mod classifier;
pub mod compression;
pub mod decay;
pub mod embedding;
pub mod migration;
pub mod reflection;
pub mod retrieval;
pub mod scheduler;
pub mod store;
pub mod summarizer;
pub mod text;
pub mod vector;

mod engine;
pub use engine::{EngineBuilder, MemoryEngine};
