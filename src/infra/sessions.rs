//! In-process record of live sessions, with creation hooks.
//!
//! The registry is fed from the messages the live server pushes to each
//! session's browser, as seen by the WebSocket tunnel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::application::backend::{LiveSession, SessionHook, SessionRegistry, SessionStatus};
use crate::domain::cells::{CellSource, CellStatus, CellView, KernelState, SessionView};

/// One live session's document, cells and current view.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    file_path: PathBuf,
    kernel: KernelState,
    cells: Vec<CellSource>,
    view: SessionView,
}

impl SessionRecord {
    fn status(&self) -> SessionStatus {
        SessionStatus {
            kernel: self.kernel,
            cells: self
                .cells
                .iter()
                .map(|cell| {
                    let status = self.view.cells.get(&cell.id).and_then(|view| view.status);
                    (cell.id.clone(), status)
                })
                .collect(),
        }
    }
}

impl LiveSession for SessionRecord {
    fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn view(&self) -> &SessionView {
        &self.view
    }

    fn cells(&self) -> Vec<CellSource> {
        self.cells.clone()
    }

    fn replace_view(&mut self, view: SessionView) {
        self.view = view;
    }
}

/// Session registry kept in memory; hooks run once per created session.
#[derive(Default)]
pub struct InMemorySessions {
    sessions: DashMap<String, SessionRecord>,
    by_file: DashMap<PathBuf, String>,
    hooks: Vec<Arc<dyn SessionHook>>,
}

impl InMemorySessions {
    pub fn new(hooks: Vec<Arc<dyn SessionHook>>) -> Self {
        Self {
            sessions: DashMap::new(),
            by_file: DashMap::new(),
            hooks,
        }
    }

    /// Register a new session and run every hook against it before it becomes visible.
    pub fn create_session(
        &self,
        session_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        cells: Vec<CellSource>,
    ) -> SessionStatus {
        let session_id = session_id.into();
        let mut record = SessionRecord {
            file_path: file_path.into(),
            kernel: KernelState::Starting,
            cells,
            view: SessionView::default(),
        };
        for hook in &self.hooks {
            hook.on_session_created(&mut record);
        }

        debug!(
            target = "marimo_gateway::sessions",
            session_id = %session_id,
            path = %record.file_path.display(),
            seeded = !record.view.is_empty(),
            "Session created"
        );
        let status = record.status();
        self.by_file
            .insert(record.file_path.clone(), session_id.clone());
        self.sessions.insert(session_id, record);
        status
    }

    pub fn set_kernel_state(&self, session_id: &str, kernel: KernelState) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut record) => {
                record.kernel = kernel;
                true
            }
            None => false,
        }
    }

    pub fn update_cell(&self, session_id: &str, cell_id: &str, status: CellStatus) -> bool {
        let Some(mut record) = self.sessions.get_mut(session_id) else {
            return false;
        };
        record
            .view
            .cells
            .entry(cell_id.to_string())
            .or_insert_with(CellView::default)
            .status = Some(status);
        true
    }

    pub fn close_session(&self, session_id: &str) -> bool {
        let Some((_, record)) = self.sessions.remove(session_id) else {
            return false;
        };
        self.by_file
            .remove_if(&record.file_path, |_, owner| owner == session_id);
        true
    }

    /// Apply one message the live server sent to the client of `session_id`.
    ///
    /// `kernel-ready` registers the session (running the hooks) and `cell-op`
    /// records cell statuses; anything else is ignored.
    pub fn observe(&self, session_id: &str, file_path: &Path, message: &str) {
        let Ok(message) = serde_json::from_str::<LiveMessage>(message) else {
            return;
        };
        match message.op.as_str() {
            "kernel-ready" => {
                if self.sessions.contains_key(session_id) {
                    return;
                }
                let Ok(ready) = serde_json::from_value::<KernelReady>(message.data) else {
                    return;
                };
                let cells = ready
                    .cell_ids
                    .into_iter()
                    .zip(ready.codes)
                    .map(|(id, code)| CellSource::new(id, code))
                    .collect();
                self.create_session(session_id, file_path, cells);
            }
            "cell-op" => {
                let Ok(op) = serde_json::from_value::<CellOp>(message.data) else {
                    return;
                };
                let Some(status) = op
                    .status
                    .and_then(|status| serde_json::from_value::<CellStatus>(status).ok())
                else {
                    return;
                };
                // Cell first: a running kernel must not expose stale seeded statuses.
                if self.update_cell(session_id, &op.cell_id, status) {
                    self.set_kernel_state(session_id, KernelState::Running);
                }
            }
            _ => {}
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct LiveMessage {
    op: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KernelReady {
    cell_ids: Vec<String>,
    codes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CellOp {
    cell_id: String,
    #[serde(default)]
    status: Option<Value>,
}

impl SessionRegistry for InMemorySessions {
    fn session_by_id(&self, session_id: &str) -> Option<SessionStatus> {
        self.sessions.get(session_id).map(|record| record.status())
    }

    fn session_by_file(&self, path: &Path) -> Option<SessionStatus> {
        let session_id = self.by_file.get(path)?.value().clone();
        self.session_by_id(&session_id)
    }
}
