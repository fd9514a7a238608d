//! Seeding empty live sessions from the cached session snapshot.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::application::backend::{LiveSession, SessionHook};
use crate::cache::artifact::load_session_snapshot;
use crate::domain::cells::{
    CellSource, CellStatus, CellView, SessionSnapshot, SessionView, hash_code,
};

/// Map cached cell records onto the current cells by code hash.
///
/// Position and identity are irrelevant: a cell keeps its cached output as
/// long as its code is unchanged. Returns `None` when nothing matched.
pub fn correlate(snapshot: &SessionSnapshot, cells: &[CellSource]) -> Option<SessionView> {
    let by_hash: HashMap<String, &str> = cells
        .iter()
        .filter(|cell| !cell.code.is_empty())
        .map(|cell| (hash_code(&cell.code), cell.id.as_str()))
        .collect();

    let mut view = SessionView::default();
    for cached in &snapshot.cells {
        let Some(cell_id) = cached
            .code_hash
            .as_deref()
            .and_then(|hash| by_hash.get(hash))
        else {
            continue;
        };
        view.cells.insert(
            (*cell_id).to_string(),
            CellView {
                status: Some(CellStatus::Idle),
                outputs: cached.outputs.clone(),
                console: cached.console.clone(),
            },
        );
    }

    (!view.is_empty()).then_some(view)
}

/// Session hook that pre-populates empty sessions from the cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct CachedSessionSeeder;

impl CachedSessionSeeder {
    /// Seed `session` if it is empty and a matching snapshot exists.
    pub fn seed(&self, session: &mut dyn LiveSession) -> bool {
        if !session.view().is_empty() {
            return false;
        }

        let document = session.file_path().to_path_buf();
        if !document.is_file() {
            return false;
        }

        let cells = session.cells();
        if cells.is_empty() {
            return false;
        }

        let Some(snapshot) = load_session_snapshot(&document) else {
            return false;
        };

        match correlate(&snapshot, &cells) {
            Some(view) => {
                info!(
                    target = "marimo_gateway::seeding",
                    path = %document.display(),
                    seeded = view.cells.len(),
                    cells = cells.len(),
                    "Seeded session from cached snapshot"
                );
                session.replace_view(view);
                true
            }
            None => {
                debug!(
                    target = "marimo_gateway::seeding",
                    path = %document.display(),
                    "Cached snapshot shares no cells with the current document"
                );
                false
            }
        }
    }
}

impl SessionHook for CachedSessionSeeder {
    fn on_session_created(&self, session: &mut dyn LiveSession) {
        self.seed(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::{Path, PathBuf};

    use serde_json::json;
    use tempfile::TempDir;

    use crate::domain::cells::{SessionCellSnapshot, SnapshotMetadata};
    use crate::domain::document::artifact_paths;

    fn cached_cell(id: &str, code: &str, output: &str) -> SessionCellSnapshot {
        SessionCellSnapshot {
            id: id.to_string(),
            code_hash: Some(hash_code(code)),
            outputs: vec![json!({"type": "data", "data": {"text/plain": output}})],
            console: Vec::new(),
        }
    }

    fn snapshot(cells: Vec<SessionCellSnapshot>) -> SessionSnapshot {
        SessionSnapshot {
            version: "1".to_string(),
            metadata: SnapshotMetadata::default(),
            cells,
        }
    }

    #[test]
    fn correlation_follows_code_not_position() {
        let cached = snapshot(vec![cached_cell("A", "x", "from-x"), cached_cell("B", "y", "from-y")]);
        let current = [CellSource::new("1", "y"), CellSource::new("2", "x")];

        let view = correlate(&cached, &current).unwrap();
        assert_eq!(view.cells.len(), 2);
        assert_eq!(view.cells["1"].outputs, cached.cells[1].outputs);
        assert_eq!(view.cells["2"].outputs, cached.cells[0].outputs);
        assert_eq!(view.cells["1"].status, Some(CellStatus::Idle));
    }

    #[test]
    fn changed_or_empty_cells_are_not_seeded() {
        let cached = snapshot(vec![cached_cell("A", "x", "from-x"), cached_cell("B", "", "none")]);
        let current = [
            CellSource::new("1", "x"),
            CellSource::new("2", "x = 2"),
            CellSource::new("3", ""),
        ];

        let view = correlate(&cached, &current).unwrap();
        assert_eq!(view.cells.keys().collect::<Vec<_>>(), vec!["1"]);
    }

    #[test]
    fn nothing_in_common_yields_none() {
        let cached = snapshot(vec![cached_cell("A", "x", "from-x")]);
        assert!(correlate(&cached, &[CellSource::new("1", "z")]).is_none());
    }

    struct FakeSession {
        path: PathBuf,
        cells: Vec<CellSource>,
        view: SessionView,
    }

    impl LiveSession for FakeSession {
        fn file_path(&self) -> &Path {
            &self.path
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

    fn seeded_document() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let document = dir.path().join("app.py");
        fs::write(&document, "import marimo").unwrap();
        let paths = artifact_paths(&document);
        fs::create_dir_all(paths.session.parent().unwrap()).unwrap();
        let cached = snapshot(vec![cached_cell("A", "x", "from-x")]);
        fs::write(&paths.session, serde_json::to_string(&cached).unwrap()).unwrap();
        (dir, document)
    }

    #[test]
    fn hook_seeds_only_empty_sessions() {
        let (_dir, document) = seeded_document();

        let mut fresh = FakeSession {
            path: document.clone(),
            cells: vec![CellSource::new("1", "x")],
            view: SessionView::default(),
        };
        CachedSessionSeeder.on_session_created(&mut fresh);
        assert!(fresh.view.cells.contains_key("1"));

        let mut busy_view = SessionView::default();
        busy_view.cells.insert("1".to_string(), CellView::default());
        let mut busy = FakeSession {
            path: document,
            cells: vec![CellSource::new("1", "x")],
            view: busy_view.clone(),
        };
        assert!(!CachedSessionSeeder.seed(&mut busy));
        assert_eq!(busy.view, busy_view);
    }

    #[test]
    fn missing_snapshot_leaves_session_untouched() {
        let dir = TempDir::new().unwrap();
        let document = dir.path().join("app.py");
        fs::write(&document, "").unwrap();

        let mut session = FakeSession {
            path: document,
            cells: vec![CellSource::new("1", "x")],
            view: SessionView::default(),
        };
        assert!(!CachedSessionSeeder.seed(&mut session));
        assert!(session.view.is_empty());
    }
}
