//! Coordinator module for vm-storage-coordinator.
//!
//! Contains the resize watcher, snapshot manager, restore orchestrator and
//! clone validation, plus the shared plumbing they sit on: bounded polling,
//! scoped objects, per-VM restore locks, the restore state machine, error
//! handling and leader election.

pub mod capacity;
pub mod clone;
pub mod context;
pub mod error;
pub mod leader;
pub mod lock;
pub mod poll;
pub mod reconciler;
pub mod resize;
pub mod restore;
pub mod scoped;
pub mod snapshot;
pub mod state_machine;

pub use capacity::{add_bytes, format_bytes, grow_delta, parse_quantity};
pub use clone::validate_clone_size;
pub use context::{Context, FIELD_MANAGER};
pub use error::{Error, Result};
pub use poll::{WaitResult, poll_until};
pub use resize::{
    ExpandOutcome, ResizeBaseline, ResizeCounterScope, ResizeWatcher, await_resize_count,
    within_tolerance,
};
pub use restore::RestoreOrchestrator;
pub use snapshot::{SnapshotManager, snapshot_object};
