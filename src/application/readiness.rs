//! Readiness of a live session, polled by the autoswitch script.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::application::backend::SessionRegistry;
use crate::domain::cells::{CellStatus, KernelState, run_complete};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub cell_statuses: BTreeMap<String, Option<CellStatus>>,
}

impl Readiness {
    pub fn not_ready() -> Self {
        Self {
            ready: false,
            cell_statuses: BTreeMap::new(),
        }
    }
}

/// Look the session up by id, falling back to the document it serves.
///
/// Ready means the session exists, its kernel is running and every cell
/// reached a terminal status.
pub fn readiness(
    registry: &dyn SessionRegistry,
    session_id: Option<&str>,
    document: Option<&Path>,
) -> Readiness {
    let status = session_id
        .filter(|id| !id.is_empty())
        .and_then(|id| registry.session_by_id(id))
        .or_else(|| document.and_then(|path| registry.session_by_file(path)));

    let Some(status) = status else {
        return Readiness::not_ready();
    };

    let ready = status.kernel == KernelState::Running
        && run_complete(status.cells.values().copied());

    Readiness {
        ready,
        cell_statuses: status.cells,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use crate::application::backend::SessionStatus;

    struct OneSession {
        id: &'static str,
        file: PathBuf,
        status: SessionStatus,
    }

    impl SessionRegistry for OneSession {
        fn session_by_id(&self, session_id: &str) -> Option<SessionStatus> {
            (session_id == self.id).then(|| self.status.clone())
        }

        fn session_by_file(&self, path: &Path) -> Option<SessionStatus> {
            (path == self.file).then(|| self.status.clone())
        }
    }

    fn registry(kernel: KernelState, cells: &[(&str, Option<CellStatus>)]) -> OneSession {
        OneSession {
            id: "s-1",
            file: PathBuf::from("/srv/app.py"),
            status: SessionStatus {
                kernel,
                cells: cells
                    .iter()
                    .map(|(id, status)| (id.to_string(), *status))
                    .collect(),
            },
        }
    }

    #[test]
    fn missing_session_is_not_ready() {
        let registry = registry(KernelState::Running, &[]);
        assert_eq!(
            readiness(&registry, Some("other"), None),
            Readiness::not_ready()
        );
    }

    #[test]
    fn finished_running_session_is_ready() {
        let registry = registry(
            KernelState::Running,
            &[("a", Some(CellStatus::Idle)), ("b", Some(CellStatus::Errored))],
        );
        let result = readiness(&registry, Some("s-1"), None);
        assert!(result.ready);
        assert_eq!(result.cell_statuses.len(), 2);
    }

    #[test]
    fn pending_cells_or_starting_kernel_are_not_ready() {
        let pending = registry(
            KernelState::Running,
            &[("a", Some(CellStatus::Idle)), ("b", Some(CellStatus::Queued))],
        );
        assert!(!readiness(&pending, Some("s-1"), None).ready);

        let starting = registry(KernelState::Starting, &[("a", Some(CellStatus::Idle))]);
        assert!(!readiness(&starting, Some("s-1"), None).ready);
    }

    #[test]
    fn falls_back_to_the_document_session() {
        let registry = registry(KernelState::Running, &[("a", Some(CellStatus::Idle))]);
        let result = readiness(&registry, None, Some(Path::new("/srv/app.py")));
        assert!(result.ready);
    }

    #[test]
    fn statuses_serialize_for_the_poller() {
        let registry = registry(
            KernelState::Running,
            &[("a", Some(CellStatus::DisabledTransitively)), ("b", None)],
        );
        let body = serde_json::to_value(readiness(&registry, Some("s-1"), None)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "ready": false,
                "cell_statuses": {"a": "disabled-transitively", "b": null}
            })
        );
    }
}
