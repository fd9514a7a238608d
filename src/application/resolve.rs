//! Mapping request paths onto application documents.

use std::fs;
use std::path::{Path, PathBuf};

use url::form_urlencoded;

use crate::domain::document::{DOCUMENT_EXTENSION, DocumentPath, is_private_name};

/// Query parameter that asks for the code view.
pub const SHOW_CODE_PARAM: &str = "show-code";

/// Resolves `<base_url>/<relative>` to `<root>/<relative>.py`.
#[derive(Debug, Clone)]
pub struct DocumentResolver {
    root: PathBuf,
    base_url: String,
}

impl DocumentResolver {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        let root = root.into();
        let root = fs::canonicalize(&root).unwrap_or(root);
        let base_url = base_url.into().trim_matches('/').to_string();
        Self { root, base_url }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a request path (still percent-encoded, base URL included).
    pub fn resolve(&self, request_path: &str) -> Option<DocumentPath> {
        let relative = self.strip_base(request_path)?;
        self.resolve_relative(relative)
    }

    /// Resolve a path already relative to the served root.
    pub fn resolve_relative(&self, relative: &str) -> Option<DocumentPath> {
        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            return None;
        }

        let mut path = self.root.clone();
        for raw in relative.split('/') {
            let segment = urlencoding::decode(raw).ok()?;
            if segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains(['/', '\\', '\0'])
            {
                return None;
            }
            path.push(&*segment);
        }

        let path = path.with_extension(DOCUMENT_EXTENSION);
        if is_private_name(&path) || !path.is_file() {
            return None;
        }

        // Symlinks may still point outside the served tree.
        let canonical = fs::canonicalize(&path).ok()?;
        if !canonical.starts_with(&self.root) {
            return None;
        }

        Some(DocumentPath::new(path))
    }

    fn strip_base<'p>(&self, request_path: &'p str) -> Option<&'p str> {
        let trimmed = request_path.trim_start_matches('/');
        if self.base_url.is_empty() {
            return Some(trimmed);
        }
        let rest = trimmed.strip_prefix(self.base_url.as_str())?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

/// First value of `name` in a raw query string.
pub fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

pub fn show_code_requested(query: Option<&str>) -> bool {
    query_param(query, SHOW_CODE_PARAM).as_deref() == Some("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sales")).unwrap();
        fs::write(dir.path().join("sales/report.py"), "").unwrap();
        fs::write(dir.path().join("_private.py"), "").unwrap();
        fs::write(dir.path().join("my app.py"), "").unwrap();
        dir
    }

    fn resolved_name(resolver: &DocumentResolver, path: &str) -> Option<String> {
        resolver.resolve(path).map(|doc| {
            doc.as_path()
                .strip_prefix(resolver.root())
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
    }

    #[test]
    fn resolves_paths_with_or_without_extension() {
        let dir = tree();
        let resolver = DocumentResolver::new(dir.path(), "/");
        assert_eq!(
            resolved_name(&resolver, "/sales/report").as_deref(),
            Some("sales/report.py")
        );
        assert_eq!(
            resolved_name(&resolver, "/sales/report.html").as_deref(),
            Some("sales/report.py")
        );
        assert_eq!(
            resolved_name(&resolver, "/my%20app").as_deref(),
            Some("my app.py")
        );
    }

    #[test]
    fn honours_the_base_url() {
        let dir = tree();
        let resolver = DocumentResolver::new(dir.path(), "/apps/");
        assert!(resolver.resolve("/apps/sales/report").is_some());
        assert!(resolver.resolve("/sales/report").is_none());
        assert!(resolver.resolve("/appsales/report").is_none());
    }

    #[test]
    fn rejects_private_missing_and_traversing_paths() {
        let dir = tree();
        let resolver = DocumentResolver::new(dir.path().join("sales"), "/");
        assert!(resolver.resolve("/_private").is_none());
        assert!(resolver.resolve("/missing").is_none());
        assert!(resolver.resolve("/../_private").is_none());
        assert!(resolver.resolve("/..%2Fmy%20app").is_none());
        assert!(resolver.resolve("/").is_none());
    }

    #[test]
    fn reads_query_parameters() {
        assert_eq!(
            query_param(Some("a=1&access_token=T%20x"), "access_token").as_deref(),
            Some("T x")
        );
        assert_eq!(query_param(None, "access_token"), None);
        assert!(show_code_requested(Some("show-code=true")));
        assert!(!show_code_requested(Some("show-code=false")));
        assert!(!show_code_requested(Some("other=true")));
    }
}
