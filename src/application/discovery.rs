//! Discovery of application documents beneath a served directory.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{StreamExt, stream};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::application::backend::{ApplicationProbe, IgnoreOracle};
use crate::domain::document::{DocumentPath, has_document_extension};
use crate::domain::ignore::{self, IgnoreRuleSet};

pub const IGNORE_FILE_NAME: &str = ".gitignore";
const VCS_DIR_NAME: &str = ".git";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery root `{}` does not exist", path.display())]
    MissingRoot { path: PathBuf },
    #[error("discovery root `{}` is not a directory", path.display())]
    NotADirectory { path: PathBuf },
    #[error("directory walk was interrupted: {message}")]
    Interrupted { message: String },
}

/// How ignored paths are recognised during the walk.
#[derive(Clone, Default)]
pub enum IgnoreStrategy {
    /// Ask a collaborator about every directory and candidate file.
    External(Arc<dyn IgnoreOracle>),
    /// Compile `.gitignore` files found along the walk.
    #[default]
    LocalRules,
    /// Every document is eligible.
    None,
}

impl fmt::Debug for IgnoreStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreStrategy::External(_) => f.write_str("External"),
            IgnoreStrategy::LocalRules => f.write_str("LocalRules"),
            IgnoreStrategy::None => f.write_str("None"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub strategy: IgnoreStrategy,
    /// Upper bound on application probes running at once.
    pub concurrency: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            strategy: IgnoreStrategy::default(),
            concurrency: 4,
        }
    }
}

/// Walk `root` and return every non-ignored document file, in walk order.
///
/// Ignored directories are pruned as a whole. The one exception is a
/// directory that a negation rule spelled with a path reaches into: it is
/// entered with everything inside it still ignored unless a rule says
/// otherwise, and no rule files are read from it.
pub fn candidate_documents(
    root: &Path,
    strategy: &IgnoreStrategy,
) -> Result<Vec<PathBuf>, DiscoveryError> {
    let metadata = fs::metadata(root).map_err(|_| DiscoveryError::MissingRoot {
        path: root.to_path_buf(),
    })?;
    if !metadata.is_dir() {
        return Err(DiscoveryError::NotADirectory {
            path: root.to_path_buf(),
        });
    }

    let mut chain: Vec<IgnoreRuleSet> = Vec::new();
    let mut ignored: Vec<bool> = Vec::new();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| admit(root, entry, strategy, &mut chain, &mut ignored));

    let mut documents = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && has_document_extension(entry.path()) {
                    documents.push(entry.into_path());
                }
            }
            Err(err) => {
                let permission = err
                    .io_error()
                    .is_some_and(|io| io.kind() == io::ErrorKind::PermissionDenied);
                warn!(
                    target = "marimo_gateway::discovery",
                    path = ?err.path(),
                    permission_denied = permission,
                    error = %err,
                    "Skipping unreadable path"
                );
            }
        }
    }

    info!(
        target = "marimo_gateway::discovery",
        root = %root.display(),
        strategy = ?strategy,
        documents = documents.len(),
        "Found candidate documents"
    );
    Ok(documents)
}

/// Filter applied before walkdir yields or descends into an entry.
///
/// `chain[i]` and `ignored[i]` describe the directory at depth `i` on the
/// current walk path.
fn admit(
    root: &Path,
    entry: &DirEntry,
    strategy: &IgnoreStrategy,
    chain: &mut Vec<IgnoreRuleSet>,
    ignored: &mut Vec<bool>,
) -> bool {
    let depth = entry.depth();
    chain.truncate(depth);
    ignored.truncate(depth);
    let is_dir = entry.file_type().is_dir();

    if depth == 0 {
        if matches!(strategy, IgnoreStrategy::LocalRules) {
            chain.push(load_rules(entry.path(), PathBuf::new()));
        }
        ignored.push(false);
        return true;
    }

    if is_dir
        && entry.file_name() == VCS_DIR_NAME
        && !matches!(strategy, IgnoreStrategy::None)
    {
        return false;
    }

    let Ok(relative) = entry.path().strip_prefix(root) else {
        return false;
    };

    match strategy {
        IgnoreStrategy::None => {
            ignored.push(false);
            true
        }
        IgnoreStrategy::External(oracle) => {
            if !is_dir && !has_document_extension(relative) {
                return true;
            }
            if oracle.is_ignored(entry.path()) {
                debug!(
                    target = "marimo_gateway::discovery",
                    path = %relative.display(),
                    "Ignored by external oracle"
                );
                return false;
            }
            ignored.push(false);
            true
        }
        IgnoreStrategy::LocalRules => {
            let inherited = ignored.last().copied().unwrap_or(false);
            let is_ignored = ignore::evaluate(relative, is_dir, chain, inherited);

            if !is_dir {
                return !is_ignored;
            }

            if is_ignored {
                if !ignore::may_reinclude_within(relative, chain) {
                    debug!(
                        target = "marimo_gateway::discovery",
                        path = %relative.display(),
                        "Pruned ignored directory"
                    );
                    return false;
                }
                chain.push(IgnoreRuleSet::compile(relative, ""));
                ignored.push(true);
                return true;
            }

            chain.push(load_rules(entry.path(), relative.to_path_buf()));
            ignored.push(false);
            true
        }
    }
}

fn load_rules(dir: &Path, base: PathBuf) -> IgnoreRuleSet {
    let path = dir.join(IGNORE_FILE_NAME);
    match fs::read_to_string(&path) {
        Ok(contents) => IgnoreRuleSet::compile(base, &contents),
        Err(err) if err.kind() == io::ErrorKind::NotFound => IgnoreRuleSet::compile(base, ""),
        Err(err) => {
            warn!(
                target = "marimo_gateway::discovery",
                path = %path.display(),
                error = %err,
                "Ignoring unreadable rule file"
            );
            IgnoreRuleSet::compile(base, "")
        }
    }
}

/// Walk `root` and keep the documents the probe recognises as applications.
pub async fn discover(
    root: &Path,
    options: &DiscoveryOptions,
    probe: &dyn ApplicationProbe,
) -> Result<Vec<DocumentPath>, DiscoveryError> {
    let walk_root = root.to_path_buf();
    let strategy = options.strategy.clone();
    let candidates =
        tokio::task::spawn_blocking(move || candidate_documents(&walk_root, &strategy))
            .await
            .map_err(|err| DiscoveryError::Interrupted {
                message: err.to_string(),
            })??;

    let checked: Vec<(PathBuf, bool)> = stream::iter(candidates)
        .map(|path| async move {
            let recognised = probe.is_application(&path).await;
            (path, recognised)
        })
        .buffered(options.concurrency.max(1))
        .collect()
        .await;

    let documents = checked
        .into_iter()
        .filter_map(|(path, recognised)| {
            if !recognised {
                debug!(
                    target = "marimo_gateway::discovery",
                    path = %path.display(),
                    "Skipping file without an application"
                );
            }
            recognised.then(|| DocumentPath::new(path))
        })
        .collect();

    Ok(documents)
}
