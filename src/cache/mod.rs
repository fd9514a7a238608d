//! Serving-side cache of marimo exports.
//!
//! - **Artifacts**: the exported HTML and session snapshot beside each document
//! - **Snapshot memo**: fresh notebook snapshots keyed by path and mtime
//! - **Interception**: the hybrid patch layer and the autoswitch layer

pub mod artifact;
pub mod autoswitch;
mod lock;
pub mod middleware;
pub mod store;

pub use artifact::{ArtifactError, write_artifact};
pub use autoswitch::{AutoswitchScript, LIVE_SKIP_PARAM};
pub use middleware::{
    Served, ServingState, autoswitch_layer, cached_snapshot_layer, html_response,
};
pub use store::MemoizedNotebookSource;
