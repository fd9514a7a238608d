//! Reading and writing cache artifacts on disk.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::mount::{MountConfig, parse_mount_config};
use crate::domain::cells::SessionSnapshot;
use crate::domain::document::{ArtifactPaths, artifact_paths};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to access `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode session snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArtifactError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write the export (and its session snapshot, if embedded) for `document`.
///
/// Each file is written to a temporary sibling first and renamed into place,
/// so readers see either the previous artifact or the new one. A stale
/// session file is removed when the new export carries no session.
pub fn write_artifact(document: &Path, html: &str) -> Result<ArtifactPaths, ArtifactError> {
    let paths = artifact_paths(document);
    write_atomically(&paths.html, html.as_bytes())?;

    let session = parse_mount_config(html)
        .and_then(|(mut config, _)| config.remove("session"))
        .filter(Value::is_object);

    match session {
        Some(session) => {
            let mut encoded = serde_json::to_string_pretty(&session)?;
            encoded.push('\n');
            write_atomically(&paths.session, encoded.as_bytes())?;
        }
        None => match fs::remove_file(&paths.session) {
            Ok(()) => debug!(
                target = "marimo_gateway::cache::artifact",
                path = %paths.session.display(),
                "Removed stale session snapshot"
            ),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(ArtifactError::io(&paths.session, err)),
        },
    }

    Ok(paths)
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), ArtifactError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|err| ArtifactError::io(dir, err))?;

    let mut file = NamedTempFile::new_in(dir).map_err(|err| ArtifactError::io(dir, err))?;
    file.write_all(contents)
        .and_then(|()| file.flush())
        .map_err(|err| ArtifactError::io(file.path(), err))?;
    file.persist(path)
        .map_err(|err| ArtifactError::io(path, err.error))?;
    Ok(())
}

/// Cached HTML of `document`, if an export exists.
pub async fn read_cached_html(document: &Path) -> Option<String> {
    let path = artifact_paths(document).html;
    match tokio::fs::read_to_string(&path).await {
        Ok(html) => Some(html),
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => {
            warn!(
                target = "marimo_gateway::cache::artifact",
                path = %path.display(),
                error = %err,
                "Failed to read cached export"
            );
            None
        }
    }
}

pub async fn has_cached_html(document: &Path) -> bool {
    tokio::fs::try_exists(artifact_paths(document).html)
        .await
        .unwrap_or(false)
}

/// Mount config embedded in the cached export of `document`.
pub async fn load_cached_config(document: &Path) -> Option<MountConfig> {
    let html = read_cached_html(document).await?;
    parse_mount_config(&html).map(|(config, _)| config)
}

/// Session snapshot for `document`: the session file first, then the
/// `session` object embedded in the cached export.
pub fn load_session_snapshot(document: &Path) -> Option<SessionSnapshot> {
    let paths = artifact_paths(document);

    match fs::read_to_string(&paths.session) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(snapshot) => return Some(snapshot),
            Err(err) => warn!(
                target = "marimo_gateway::cache::artifact",
                path = %paths.session.display(),
                error = %err,
                "Ignoring undecodable session snapshot"
            ),
        },
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            target = "marimo_gateway::cache::artifact",
            path = %paths.session.display(),
            error = %err,
            "Failed to read session snapshot"
        ),
    }

    let html = match fs::read_to_string(&paths.html) {
        Ok(html) => html,
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    target = "marimo_gateway::cache::artifact",
                    path = %paths.html.display(),
                    error = %err,
                    "Failed to read cached export"
                );
            }
            return None;
        }
    };

    let (mut config, _) = parse_mount_config(&html)?;
    let session = config.remove("session")?;
    serde_json::from_value(session)
        .map_err(|err| {
            warn!(
                target = "marimo_gateway::cache::artifact",
                path = %paths.html.display(),
                error = %err,
                "Ignoring undecodable embedded session"
            );
        })
        .ok()
}
