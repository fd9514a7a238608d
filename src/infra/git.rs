//! Ignore decisions delegated to `git check-ignore`.
//!
//! Locating the repository runs on the async runtime; individual checks are
//! blocking and happen inside the discovery walk, which already runs on a
//! blocking thread.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tokio::process::Command as AsyncCommand;
use tracing::warn;

use crate::application::backend::IgnoreOracle;

#[derive(Debug, Clone)]
pub struct GitCheckIgnore {
    program: String,
    repository: PathBuf,
}

impl GitCheckIgnore {
    /// Find the repository containing `root`; `None` when `root` is not inside one.
    pub async fn locate(program: impl Into<String>, root: &Path) -> Option<Self> {
        let program = program.into();
        let output = AsyncCommand::new(&program)
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(root)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let top = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if top.is_empty() {
                    return None;
                }
                Some(Self {
                    program,
                    repository: PathBuf::from(top),
                })
            }
            Ok(_) => None,
            Err(err) => {
                warn!(
                    target = "marimo_gateway::discovery",
                    program = %program,
                    error = %err,
                    "Failed to run git"
                );
                None
            }
        }
    }

    pub fn repository(&self) -> &Path {
        &self.repository
    }
}

impl IgnoreOracle for GitCheckIgnore {
    fn is_ignored(&self, path: &Path) -> bool {
        // Exit status 0 means ignored, 1 means not ignored.
        Command::new(&self.program)
            .args(["check-ignore", "--quiet"])
            .arg(path)
            .current_dir(&self.repository)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) -> bool {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    #[tokio::test]
    async fn outside_a_repository_there_is_no_oracle() {
        let dir = TempDir::new().unwrap();
        assert!(
            GitCheckIgnore::locate("/nonexistent/git", dir.path())
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn check_ignore_follows_the_repository_rules() {
        let dir = TempDir::new().unwrap();
        if !git(dir.path(), &["init", "--quiet"]) {
            return;
        }
        fs::write(dir.path().join(".gitignore"), "build/\n").unwrap();
        fs::create_dir(dir.path().join("build")).unwrap();
        fs::write(dir.path().join("build/out.py"), "").unwrap();
        fs::write(dir.path().join("app.py"), "").unwrap();

        let oracle = GitCheckIgnore::locate("git", dir.path()).await.unwrap();
        assert!(oracle.is_ignored(&dir.path().join("build/out.py")));
        assert!(!oracle.is_ignored(&dir.path().join("app.py")));
    }
}
