//! Application documents and the on-disk layout of their cache artifacts.

use std::path::{Path, PathBuf};

/// Directory, next to each document, that holds its cache artifacts.
pub const CACHE_DIR_NAME: &str = "__marimo__";
pub const SESSION_DIR_NAME: &str = "session";
pub const DOCUMENT_EXTENSION: &str = "py";

/// A source file recognised as defining a notebook application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath(PathBuf);

impl DocumentPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    pub fn artifacts(&self) -> ArtifactPaths {
        artifact_paths(&self.0)
    }
}

impl AsRef<Path> for DocumentPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Where the rendered export and the session snapshot of one document live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub html: PathBuf,
    pub session: PathBuf,
}

pub fn artifact_paths(document: &Path) -> ArtifactPaths {
    let parent = document.parent().unwrap_or_else(|| Path::new(""));
    let stem = document
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cache_dir = parent.join(CACHE_DIR_NAME);
    ArtifactPaths {
        html: cache_dir.join(format!("{stem}.html")),
        session: cache_dir.join(SESSION_DIR_NAME).join(format!("{stem}.json")),
    }
}

/// Names starting with `_` are private modules and never served.
pub fn is_private_name(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('_'))
}

pub fn has_document_extension(path: &Path) -> bool {
    path.extension()
        .is_some_and(|extension| extension == DOCUMENT_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_live_beside_the_document() {
        let paths = artifact_paths(Path::new("/srv/apps/sales/report.py"));
        assert_eq!(
            paths.html,
            PathBuf::from("/srv/apps/sales/__marimo__/report.html")
        );
        assert_eq!(
            paths.session,
            PathBuf::from("/srv/apps/sales/__marimo__/session/report.json")
        );
    }

    #[test]
    fn private_names_start_with_underscore() {
        assert!(is_private_name(Path::new("apps/_helpers.py")));
        assert!(!is_private_name(Path::new("_apps/helpers.py")));
    }

    #[test]
    fn document_extension_is_python() {
        assert!(has_document_extension(Path::new("a/b.py")));
        assert!(!has_document_extension(Path::new("a/b.pyc")));
        assert!(!has_document_extension(Path::new("a/py")));
    }
}
