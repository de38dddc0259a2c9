//! Sediment Core
//!
//! Core domain types, traits, and error handling for Sediment.
//! This crate defines the shared vocabulary of versioned repos, commits,
//! pipelines, jobs and datums used across all other crates.

pub mod config;
pub mod datum;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod pipeline;
pub mod ports;
pub mod repo;
pub mod retry;

pub use error::{Error, Result};
pub use ids::*;
