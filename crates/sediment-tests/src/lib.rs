//! Integration test infrastructure for Sediment.
//!
//! This crate wires a commit graph, one or more schedulers and scripted
//! stand-ins for workers and the orchestrator into a [`TestCluster`], so
//! scenarios can run end to end in process.
//!
//! # Usage
//!
//! ```ignore
//! use sediment_tests::TestCluster;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let cluster = TestCluster::new().await.unwrap();
//!     cluster.graph.create_repo("images").await.unwrap();
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::{TestCluster, TestClusterBuilder};
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,sediment_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
