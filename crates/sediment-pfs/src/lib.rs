//! Versioned file system for Sediment.
//!
//! Repos hold commits of file trees. Commits record the commits they were
//! computed from, forming an append-only provenance graph that the
//! scheduler and flush callers query.

pub mod blob;
pub mod bus;
pub mod flush;
pub mod graph;
pub mod tree;

pub use blob::MemoryBlobStore;
pub use bus::MemoryEventBus;
pub use flush::CommitInfoStream;
pub use graph::{CommitGraph, StartCommitOptions};
pub use tree::FileTree;
