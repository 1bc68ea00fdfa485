//! Multigranularity locking for the Granite engine.
//!
//! Layered bottom-up:
//!
//! - [`LockType`]: the six-element lattice {NL, IS, IX, S, SIX, X} and its
//!   compatibility / parent / substitutability relations.
//! - [`ResourceName`]: hierarchical resource paths (database, partition,
//!   page).
//! - [`LockManager`]: per-resource granted sets and strict-FIFO wait
//!   queues; the only component that blocks.
//! - [`LockContext`]: the hierarchy node enforcing multigranularity
//!   discipline over the lock manager.
//! - [`LockUtil`]: the declarative "ensure this transaction can do X here"
//!   facade used by the executor and by restart recovery.

mod context;
mod lock_type;
mod manager;
mod resource;
mod util;

pub use context::{release_all_locks, LockContext};
pub use lock_type::LockType;
pub use manager::{Lock, LockManager};
pub use resource::{ResourceLevel, ResourceName};
pub use util::LockUtil;
