//! The marimo toolchain driven through isolated child processes.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::application::backend::{ApplicationProbe, BackendError, Exporter, NotebookSource};
use crate::domain::cells::NotebookSnapshot;

const PROBE_SCRIPT: &str = r#"
import importlib.util, sys
try:
    import marimo
    spec = importlib.util.spec_from_file_location("__marimo_probe__", sys.argv[1])
    module = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(module)
    sys.exit(0 if isinstance(getattr(module, "app", None), marimo.App) else 3)
except BaseException:
    sys.exit(4)
"#;

const NOTEBOOK_SCRIPT: &str = r#"
import json, sys
from marimo._session.notebook import AppFileManager
from marimo._utils.code import hash_code
from marimo._version import __version__
manager = AppFileManager(sys.argv[1])
cells = []
for cell in manager.app.cell_manager.cell_data():
    code = cell.code or ""
    cells.append({
        "id": cell.cell_id,
        "code": code,
        "code_hash": hash_code(code) if code else None,
        "name": cell.name,
        "config": cell.config.asdict(),
    })
json.dump({"version": "1", "metadata": {"marimo_version": __version__}, "cells": cells}, sys.stdout)
"#;

/// Program names and limits for the marimo child processes.
#[derive(Debug, Clone)]
pub struct MarimoProcess {
    python: String,
    marimo: String,
    timeout: Duration,
}

impl MarimoProcess {
    pub fn new(python: impl Into<String>, marimo: impl Into<String>, timeout: Duration) -> Self {
        Self {
            python: python.into(),
            marimo: marimo.into(),
            timeout,
        }
    }

    async fn run<I, S>(&self, program: &str, args: I) -> Result<Output, BackendError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: program.to_string(),
                source,
            })?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(BackendError::Timeout {
                program: program.to_string(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    fn check_exit(program: &str, output: &Output) -> Result<(), BackendError> {
        if output.status.success() {
            return Ok(());
        }
        Err(BackendError::Exit {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn load_notebook(&self, path: &Path) -> Result<NotebookSnapshot, BackendError> {
        let args: [&OsStr; 3] = ["-c".as_ref(), NOTEBOOK_SCRIPT.as_ref(), path.as_os_str()];
        let output = self.run(&self.python, args).await?;
        Self::check_exit(&self.python, &output)?;
        serde_json::from_slice(&output.stdout).map_err(|err| BackendError::decode(err.to_string()))
    }
}

#[async_trait]
impl ApplicationProbe for MarimoProcess {
    async fn is_application(&self, path: &Path) -> bool {
        let args: [&OsStr; 3] = ["-c".as_ref(), PROBE_SCRIPT.as_ref(), path.as_os_str()];
        match self.run(&self.python, args).await {
            Ok(output) => {
                debug!(
                    target = "marimo_gateway::marimo",
                    op = "probe",
                    path = %path.display(),
                    exit = %output.status,
                    "Probed document"
                );
                output.status.success()
            }
            Err(err) => {
                warn!(
                    target = "marimo_gateway::marimo",
                    op = "probe",
                    path = %path.display(),
                    error = %err,
                    "Application probe failed"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Exporter for MarimoProcess {
    async fn export_html(&self, path: &Path, include_code: bool) -> Result<String, BackendError> {
        let started_at = Instant::now();
        let workdir = tempfile::Builder::new()
            .prefix("marimo-export")
            .tempdir()?;
        let output_path = workdir.path().join("export.html");
        let code_flag = if include_code {
            "--include-code"
        } else {
            "--no-include-code"
        };

        let args: [&OsStr; 6] = [
            "export".as_ref(),
            "html".as_ref(),
            path.as_os_str(),
            "-o".as_ref(),
            output_path.as_os_str(),
            code_flag.as_ref(),
        ];
        let output = self.run(&self.marimo, args).await?;
        Self::check_exit(&self.marimo, &output)?;

        let html = tokio::fs::read_to_string(&output_path).await?;
        info!(
            target = "marimo_gateway::marimo",
            op = "export",
            path = %path.display(),
            include_code,
            html_bytes = html.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Exported document"
        );
        Ok(html)
    }
}

#[async_trait]
impl NotebookSource for MarimoProcess {
    async fn notebook_snapshot(&self, path: &Path) -> Option<NotebookSnapshot> {
        match self.load_notebook(path).await {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(
                    target = "marimo_gateway::marimo",
                    op = "notebook_snapshot",
                    path = %path.display(),
                    error = %err,
                    "Failed to load notebook"
                );
                None
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn missing_interpreter_is_not_an_application() {
        let backend = MarimoProcess::new(
            "/nonexistent/python",
            "/nonexistent/marimo",
            Duration::from_secs(5),
        );
        assert!(!backend.is_application(Path::new("app.py")).await);
        assert!(backend.notebook_snapshot(Path::new("app.py")).await.is_none());
    }

    #[tokio::test]
    async fn exporter_reads_the_written_file() {
        let dir = TempDir::new().unwrap();
        // Arguments: export html <file> -o <out> <flag>
        let marimo = script(&dir, "marimo", r#"printf '<html>%s</html>' "$6" > "$5""#);
        let backend = MarimoProcess::new("python3", marimo, Duration::from_secs(5));

        let html = backend
            .export_html(Path::new("app.py"), false)
            .await
            .unwrap();
        assert_eq!(html, "<html>--no-include-code</html>");
    }

    #[tokio::test]
    async fn failing_export_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let marimo = script(&dir, "marimo", "echo boom >&2; exit 2");
        let backend = MarimoProcess::new("python3", marimo, Duration::from_secs(5));

        let err = backend
            .export_html(Path::new("app.py"), true)
            .await
            .unwrap_err();
        match err {
            BackendError::Exit { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_children_time_out() {
        let dir = TempDir::new().unwrap();
        let python = script(&dir, "python", "sleep 5");
        let backend = MarimoProcess::new(python, "marimo", Duration::from_millis(100));

        let err = backend.load_notebook(Path::new("app.py")).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
    }

    #[tokio::test]
    async fn notebook_snapshot_is_decoded_from_stdout() {
        let dir = TempDir::new().unwrap();
        let python = script(
            &dir,
            "python",
            r#"echo '{"version":"1","metadata":{},"cells":[{"id":"Hbol","code":"x = 1","code_hash":"h","name":"_","config":{}}]}'"#,
        );
        let backend = MarimoProcess::new(python, "marimo", Duration::from_secs(5));

        let snapshot = backend
            .notebook_snapshot(Path::new("app.py"))
            .await
            .unwrap();
        assert_eq!(snapshot.cells[0].id, "Hbol");
        assert_eq!(snapshot.cells[0].code, "x = 1");
    }
}
