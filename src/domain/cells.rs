//! Cell, notebook and session snapshot types shared by the cache and the live backend.

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema version written into notebook and session snapshots.
pub const SNAPSHOT_VERSION: &str = "1";

/// Content hash of a cell's code text, hex-encoded MD5 as the live backend computes it.
pub fn hash_code(code: &str) -> String {
    hex::encode(Md5::digest(code.as_bytes()))
}

/// Per-cell runtime status as reported by the live backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CellStatus {
    Queued,
    Running,
    Idle,
    Errored,
    DisabledTransitively,
}

impl CellStatus {
    /// A terminal status means the cell finished, with a value or an error.
    pub fn is_terminal(self) -> bool {
        !matches!(self, CellStatus::Queued | CellStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelState {
    Starting,
    Running,
    Closed,
}

/// True iff every cell has a non-null, terminal status.
pub fn run_complete<I>(statuses: I) -> bool
where
    I: IntoIterator<Item = Option<CellStatus>>,
{
    statuses
        .into_iter()
        .all(|status| status.is_some_and(CellStatus::is_terminal))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marimo_version: Option<String>,
}

/// A freshly computed listing of a notebook's cells, code included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookSnapshot {
    pub version: String,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
    #[serde(default)]
    pub cells: Vec<NotebookCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookCell {
    pub id: String,
    #[serde(default)]
    pub code: String,
    /// `None` for cells without code.
    #[serde(default)]
    pub code_hash: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

impl NotebookCell {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        let code = code.into();
        let code_hash = (!code.is_empty()).then(|| hash_code(&code));
        Self {
            id: id.into(),
            code,
            code_hash,
            name: String::new(),
            config: BTreeMap::new(),
        }
    }
}

/// The persisted record of a past execution: outputs keyed by code hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: String,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
    #[serde(default)]
    pub cells: Vec<SessionCellSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCellSnapshot {
    pub id: String,
    #[serde(default)]
    pub code_hash: Option<String>,
    #[serde(default)]
    pub outputs: Vec<Value>,
    #[serde(default)]
    pub console: Vec<Value>,
}

/// The identity and code of a cell currently loaded in a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellSource {
    pub id: String,
    pub code: String,
}

impl CellSource {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CellView {
    pub status: Option<CellStatus>,
    pub outputs: Vec<Value>,
    pub console: Vec<Value>,
}

/// A live session's renderable state, keyed by cell identifier.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionView {
    pub cells: BTreeMap<String, CellView>,
}

impl SessionView {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn statuses(&self) -> BTreeMap<String, Option<CellStatus>> {
        self.cells
            .iter()
            .map(|(id, view)| (id.clone(), view.status))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_code_is_hex_md5() {
        assert_eq!(hash_code(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(hash_code("x = 1"), hash_code("x = 1"));
        assert_ne!(hash_code("x = 1"), hash_code("x = 2"));
        assert_eq!(hash_code("abc").len(), 32);
    }

    #[test]
    fn run_complete_requires_terminal_status_for_every_cell() {
        assert!(run_complete([Some(CellStatus::Idle), Some(CellStatus::Errored)]));
        assert!(run_complete([Some(CellStatus::DisabledTransitively)]));
        assert!(!run_complete([Some(CellStatus::Idle), None]));
        assert!(!run_complete([Some(CellStatus::Queued)]));
        assert!(!run_complete([Some(CellStatus::Running)]));
    }

    #[test]
    fn statuses_use_kebab_case_on_the_wire() {
        let encoded = serde_json::to_string(&CellStatus::DisabledTransitively).unwrap();
        assert_eq!(encoded, "\"disabled-transitively\"");
        let decoded: CellStatus = serde_json::from_str("\"idle\"").unwrap();
        assert_eq!(decoded, CellStatus::Idle);
    }

    #[test]
    fn notebook_cell_hashes_only_non_empty_code() {
        assert_eq!(NotebookCell::new("a", "").code_hash, None);
        assert_eq!(
            NotebookCell::new("b", "print(1)").code_hash,
            Some(hash_code("print(1)"))
        );
    }

    #[test]
    fn session_snapshot_tolerates_missing_fields() {
        let snapshot: SessionSnapshot =
            serde_json::from_str(r#"{"version":"1","cells":[{"id":"Hbol"}]}"#).unwrap();
        assert_eq!(snapshot.cells[0].code_hash, None);
        assert!(snapshot.cells[0].outputs.is_empty());
    }
}
