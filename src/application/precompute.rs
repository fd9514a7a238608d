//! The precompute pass: export every application document into the cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use futures::{StreamExt, stream};
use metrics::counter;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::application::backend::{ApplicationProbe, BackendError, Exporter};
use crate::application::discovery::{DiscoveryError, IgnoreStrategy, candidate_documents};
use crate::cache::artifact::{ArtifactError, write_artifact};

pub(crate) const METRIC_PRECOMPUTE_DOCUMENTS: &str = "gateway_precompute_documents_total";

#[derive(Debug, Error)]
pub enum PrecomputeError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("export failed: {0}")]
    Export(#[from] BackendError),
    #[error("writing the cache artifact failed: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("artifact writer was interrupted: {0}")]
    Interrupted(String),
}

#[derive(Debug, Clone)]
pub struct PrecomputeOptions {
    pub strategy: IgnoreStrategy,
    pub include_code: bool,
    pub concurrency: usize,
}

/// The collaborators a precompute pass runs documents through.
#[derive(Clone)]
pub struct PrecomputeBackend {
    pub probe: Arc<dyn ApplicationProbe>,
    pub exporter: Arc<dyn Exporter>,
}

#[derive(Debug)]
pub enum DocumentOutcome {
    Cached,
    Skipped,
    Failed(PrecomputeError),
}

impl DocumentOutcome {
    fn label(&self) -> &'static str {
        match self {
            DocumentOutcome::Cached => "cached",
            DocumentOutcome::Skipped => "skipped",
            DocumentOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrecomputeSummary {
    pub cached: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PrecomputeSummary {
    pub fn total(&self) -> usize {
        self.cached + self.skipped + self.failed
    }

    pub fn failed_or_skipped(&self) -> usize {
        self.skipped + self.failed
    }
}

/// Probe and export every candidate beneath `root`.
///
/// Only an invalid root aborts the pass; every per-document failure is
/// logged with its path and counted.
pub async fn precompute(
    root: &Path,
    options: &PrecomputeOptions,
    backend: &PrecomputeBackend,
) -> Result<PrecomputeSummary, PrecomputeError> {
    let started_at = Instant::now();
    let walk_root = root.to_path_buf();
    let strategy = options.strategy.clone();
    let candidates =
        tokio::task::spawn_blocking(move || candidate_documents(&walk_root, &strategy))
            .await
            .map_err(|err| PrecomputeError::Interrupted(err.to_string()))??;

    let cached = Arc::new(AtomicUsize::new(0));
    let skipped = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    stream::iter(candidates)
        .for_each_concurrent(Some(options.concurrency.max(1)), |path| {
            let backend = backend.clone();
            let cached = cached.clone();
            let skipped = skipped.clone();
            let failed = failed.clone();
            let include_code = options.include_code;
            async move {
                let outcome = precompute_document(&backend, path.clone(), include_code).await;
                counter!(METRIC_PRECOMPUTE_DOCUMENTS, "outcome" => outcome.label()).increment(1);
                match outcome {
                    DocumentOutcome::Cached => {
                        info!(
                            target = "marimo_gateway::precompute",
                            path = %path.display(),
                            "Cached document"
                        );
                        cached.fetch_add(1, Ordering::Relaxed);
                    }
                    DocumentOutcome::Skipped => {
                        warn!(
                            target = "marimo_gateway::precompute",
                            path = %path.display(),
                            "Skipping document without an application"
                        );
                        skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    DocumentOutcome::Failed(err) => {
                        error!(
                            target = "marimo_gateway::precompute",
                            path = %path.display(),
                            error = %err,
                            "Failed to cache document"
                        );
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
        .await;

    let summary = PrecomputeSummary {
        cached: cached.load(Ordering::Relaxed),
        skipped: skipped.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
    };
    info!(
        target = "marimo_gateway::precompute",
        cached = summary.cached,
        failed_or_skipped = summary.failed_or_skipped(),
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "Caching complete: {} apps cached successfully, {} failed or skipped",
        summary.cached,
        summary.failed_or_skipped()
    );
    Ok(summary)
}

/// Probe, export and persist one document.
pub async fn precompute_document(
    backend: &PrecomputeBackend,
    path: PathBuf,
    include_code: bool,
) -> DocumentOutcome {
    if !backend.probe.is_application(&path).await {
        return DocumentOutcome::Skipped;
    }

    let html = match backend.exporter.export_html(&path, include_code).await {
        Ok(html) => html,
        Err(err) => return DocumentOutcome::Failed(err.into()),
    };

    match tokio::task::spawn_blocking(move || write_artifact(&path, &html)).await {
        Ok(Ok(_)) => DocumentOutcome::Cached,
        Ok(Err(err)) => DocumentOutcome::Failed(err.into()),
        Err(err) => DocumentOutcome::Failed(PrecomputeError::Interrupted(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::application::mount::MOUNT_CONFIG_MARKER;
    use crate::domain::document::artifact_paths;

    struct MarkerProbe;

    #[async_trait]
    impl ApplicationProbe for MarkerProbe {
        async fn is_application(&self, path: &Path) -> bool {
            fs::read_to_string(path).is_ok_and(|source| source.contains("marimo.App"))
        }
    }

    struct FakeExporter;

    #[async_trait]
    impl Exporter for FakeExporter {
        async fn export_html(&self, path: &Path, include_code: bool) -> Result<String, BackendError> {
            if path.ends_with("broken.py") {
                return Err(BackendError::decode("export crashed"));
            }
            Ok(format!(
                "<script>{MOUNT_CONFIG_MARKER} = {{\"include\": {include_code}, \"session\": {{\"version\": \"1\", \"cells\": []}}}};</script>"
            ))
        }
    }

    fn backend() -> PrecomputeBackend {
        PrecomputeBackend {
            probe: Arc::new(MarkerProbe),
            exporter: Arc::new(FakeExporter),
        }
    }

    fn options() -> PrecomputeOptions {
        PrecomputeOptions {
            strategy: IgnoreStrategy::LocalRules,
            include_code: false,
            concurrency: 2,
        }
    }

    #[tokio::test]
    async fn batch_completes_and_counts_every_outcome() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("good.py"), "app = marimo.App()").unwrap();
        fs::write(root.join("broken.py"), "app = marimo.App()").unwrap();
        fs::write(root.join("helper.py"), "def helper(): pass").unwrap();

        let summary = precompute(root, &options(), &backend()).await.unwrap();
        assert_eq!(
            summary,
            PrecomputeSummary {
                cached: 1,
                skipped: 1,
                failed: 1,
            }
        );
        assert_eq!(summary.total(), 3);

        let paths = artifact_paths(&root.join("good.py"));
        let html = fs::read_to_string(paths.html).unwrap();
        assert!(html.contains("\"include\": false"));
        assert!(paths.session.exists());
        assert!(!artifact_paths(&root.join("broken.py")).html.exists());
        assert!(!artifact_paths(&root.join("helper.py")).html.exists());
    }

    #[tokio::test]
    async fn invalid_root_aborts_the_pass() {
        let dir = TempDir::new().unwrap();
        let err = precompute(&dir.path().join("missing"), &options(), &backend())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PrecomputeError::Discovery(DiscoveryError::MissingRoot { .. })
        ));
    }
}
