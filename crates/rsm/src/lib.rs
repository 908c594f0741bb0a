//! Replicated state machine host.
//!
//! A [`Host`] receives committed log entries for one replica and applies them
//! to a user [`StateMachine`] in strict log order. It also answers queries,
//! computes state hashes, and drives snapshot save and recovery over the
//! streams provided by the `snapshot` crate.
//!
//! Three machine kinds share the one trait:
//!
//! | Kind          | Updates vs. reads      | Snapshot                     |
//! |---------------|------------------------|------------------------------|
//! | `Sequential`  | one call at a time     | stops the world              |
//! | `Concurrent`  | reads overlap updates  | prepare, then save the view  |
//! | `SelfManaged` | reads overlap updates  | prepare, save file manifest  |
//!
//! Client sessions deduplicate retried proposals: see [`ClientSession`] for
//! the proposing side and [`SessionRegistry`] for the host side.


pub mod client_session;
pub mod context;
pub mod host;
pub mod hosts;
pub mod lookup;
pub mod machine;
pub mod sessions;

pub use client_session::ClientSession;
pub use context::SnapshotContext;
pub use host::{ApplyResult, Host, SavedSnapshot, SnapshotHeader, SNAPSHOT_FORMAT_VERSION};
pub use hosts::{FactoryRegistry, Hosts, MachineFactory};
pub use lookup::LookupResult;
pub use machine::{view_as, MachineKind, SnapshotState, StateMachine};
pub use sessions::{Outcome, RejectReason, SessionCheck, SessionRegistry};
