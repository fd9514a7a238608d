//! Collaborator traits describing the notebook execution backend.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::cells::{CellSource, CellStatus, KernelState, NotebookSnapshot, SessionView};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("`{program}` did not finish within {seconds}s")]
    Timeout { program: String, seconds: u64 },
    #[error("backend output could not be decoded: {message}")]
    Decode { message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

/// Answers whether a file defines a notebook application.
///
/// Implementations execute the document's top-level code in isolation; any
/// failure there must be reported as `false`.
#[async_trait]
pub trait ApplicationProbe: Send + Sync {
    async fn is_application(&self, path: &Path) -> bool;
}

/// Produces a fresh notebook snapshot (code included) for an application file.
#[async_trait]
pub trait NotebookSource: Send + Sync {
    async fn notebook_snapshot(&self, path: &Path) -> Option<NotebookSnapshot>;
}

/// Runs an application and renders it to a static HTML export.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export_html(&self, path: &Path, include_code: bool) -> Result<String, BackendError>;
}

/// External ignore decision, typically backed by a version-control tool.
pub trait IgnoreOracle: Send + Sync {
    fn is_ignored(&self, path: &Path) -> bool;
}

/// Kernel state and per-cell statuses of one live session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub kernel: KernelState,
    pub cells: BTreeMap<String, Option<CellStatus>>,
}

/// Read access to the live backend's sessions.
pub trait SessionRegistry: Send + Sync {
    fn session_by_id(&self, session_id: &str) -> Option<SessionStatus>;
    fn session_by_file(&self, path: &Path) -> Option<SessionStatus>;
}

/// A session as seen by creation hooks.
pub trait LiveSession {
    fn file_path(&self) -> &Path;
    fn view(&self) -> &SessionView;
    /// Cells currently loaded from the document, in notebook order.
    fn cells(&self) -> Vec<CellSource>;
    fn replace_view(&mut self, view: SessionView);
}

/// Strategy invoked by the backend right after it creates a session.
pub trait SessionHook: Send + Sync {
    fn on_session_created(&self, session: &mut dyn LiveSession);
}
