//! SR orchestration for LVHD
//!
//! Ties the leaf components together into the storage operations the
//! dispatcher invokes:
//! - [`CloneEngine`]: the snapshot/clone state machine, crash-recoverable
//!   through a write-ahead journal
//! - [`ThinProvisionEngine`]: grows/shrinks a VHD-backing LV to track real
//!   VHD allocation, also journaled
//! - [`Sr`]: per-SR handle carrying the engines, the SR-wide lock and the
//!   mandatory recovery pass that runs at attach before anything else
//!
//! Everything here is synchronous; concurrency exists only across
//! processes and hosts, mediated by the advisory SR lock, the journal and
//! the persisted refcounts.

pub mod clone;
pub mod fault;
pub mod index;
pub mod lock;
pub mod sizing;
pub mod sr;
pub mod testing;
pub mod thin;
mod vdi;

pub use clone::{CloneEngine, SnapshotMode, SnapshotParams, SnapshotResult};
pub use fault::FaultPoints;
pub use index::ParentChildIndex;
pub use lock::{SrLock, SrLockGuard};
pub use sizing::{calc_size_lv, calc_size_vhd_lv, thin_leaf_size};
pub use sr::Sr;
pub use thin::ThinProvisionEngine;

use lvhd_common::Result;

/// Journal entry type for clone/snapshot operations
pub const JRN_CLONE: &str = "clone";

/// Journal entry type for inflate operations
pub const JRN_INFLATE: &str = "inflate";

/// Journal entry type owned by the coalescing collector; only detected
/// here, never interpreted
pub const JRN_LEAF: &str = "leaf";

/// Opaque interface to the out-of-process coalescing collector
pub trait GcControl: Send + Sync {
    /// Schedule a collector run for this SR
    fn kick(&self);
    /// Abort any collector run in progress
    fn abort(&self);
}

/// Out-of-band notification to other pool hosts that an LV changed under
/// them (rename during snapshot of a VDI they have attached)
pub trait RemoteRefresher: Send + Sync {
    fn refresh(&self, lv_name: &str) -> Result<()>;
}
