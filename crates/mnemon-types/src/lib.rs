//! Core types for the Mnemon memory engine.
//!
//! This crate defines the shared data structures used by the memory engine:
//! records, sectors, retrieval options, maintenance reports, configuration
//! and the error taxonomy. It contains no business logic.

pub mod config;
pub mod error;
pub mod memory;
