//! Persistent exiftool session.
//!
//! One exiftool process runs in `-stay_open` mode for the whole run:
//!
//! - [`ProcessSupervisor`]: starts, stops and restarts the process
//! - `reader`: background task draining stdout into a queue
//! - [`CommandBatcher`]: turns update items into execute-delimited units
//! - [`ExecutionCoordinator`]: the only writer to stdin; sends a batch and
//!   waits for exactly one ready sentinel per unit, bounded by a
//!   size-scaled timeout

mod batch;
mod coordinator;
pub mod query;
mod reader;
mod supervisor;

pub use batch::{
    CommandBatcher, EXECUTE_MARKER, IN_PROGRESS_SUFFIX, Overwrite, ScratchFiles, Unit,
    in_progress_artifact, remove_stale_artifacts,
};
pub use coordinator::{ExecutionCoordinator, TimeoutPolicy, UnitOutput};
pub use supervisor::{ProcessHandle, ProcessSupervisor};
