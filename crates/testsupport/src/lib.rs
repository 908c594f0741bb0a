//! Test support utilities for the state machine workspace.
//!
//! This crate provides:
//! - Isolated nodes with temporary storage and every key/value machine registered
//! - Entry and batch fixtures
//! - Snapshot transfer helpers (streamed, or through a snapshot store)
//! - Command script execution for readable end-to-end tests
//! - Property-based test generators
//! - Custom assertion helpers
//!
//! # Example Usage
//!
//! ```no_run
//! use testsupport::prelude::*;
//!
//! # async fn example() {
//! let node = TestNode::new().unwrap();
//! let host = node.host(kv::MEM_KV, 1).await.unwrap();
//! let output = run_script(&host, "x=1\nx=2\nget x").await.unwrap();
//! assert!(output.contains("x = 2"));
//! # }
//! ```

pub mod assertions;
pub mod context;
pub mod fixtures;
pub mod proptest_generators;
pub mod runner;

/// Convenient re-exports for common testing patterns.
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::context::*;
    pub use crate::fixtures::*;
    pub use crate::runner::*;
}
