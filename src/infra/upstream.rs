//! A `marimo run` child process serving the live notebooks.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use reqwest::{Client, Url};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::infra::error::InfraError;

/// How to launch the live server.
#[derive(Debug, Clone)]
pub struct UpstreamLaunch {
    pub program: String,
    pub directory: PathBuf,
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub include_code: bool,
    pub token: Option<String>,
}

impl UpstreamLaunch {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            self.directory.display().to_string(),
            "--headless".to_string(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--base-url".to_string(),
            self.base_url.clone(),
        ];
        if self.include_code {
            args.push("--include-code".to_string());
        }
        match &self.token {
            Some(token) => {
                args.push("--token-password".to_string());
                args.push(token.clone());
            }
            None => args.push("--no-token".to_string()),
        }
        args
    }
}

/// Owns the live server process; dropping it kills the child.
#[derive(Debug)]
pub struct ManagedUpstream {
    child: Child,
}

impl ManagedUpstream {
    pub fn spawn(launch: &UpstreamLaunch) -> Result<Self, InfraError> {
        let child = Command::new(&launch.program)
            .args(launch.args())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                InfraError::upstream(format!("failed to launch `{}`: {err}", launch.program))
            })?;
        info!(
            target = "marimo_gateway::upstream",
            program = %launch.program,
            directory = %launch.directory.display(),
            port = launch.port,
            pid = child.id().unwrap_or_default(),
            "Launched live server"
        );
        Ok(Self { child })
    }

    /// Poll `health_url` until it answers or `timeout` elapses.
    pub async fn wait_until_healthy(&mut self, health_url: &Url, timeout: Duration) -> bool {
        let started_at = Instant::now();
        let client = Client::new();
        while started_at.elapsed() < timeout {
            if let Ok(Some(status)) = self.child.try_wait() {
                warn!(
                    target = "marimo_gateway::upstream",
                    exit = %status,
                    "Live server exited during startup"
                );
                return false;
            }
            let healthy = client
                .get(health_url.clone())
                .send()
                .await
                .is_ok_and(|response| response.status().is_success());
            if healthy {
                info!(
                    target = "marimo_gateway::upstream",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Live server is healthy"
                );
                return true;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        warn!(
            target = "marimo_gateway::upstream",
            timeout_s = timeout.as_secs(),
            "Live server did not become healthy in time"
        );
        false
    }

    pub async fn shutdown(mut self) {
        if let Err(err) = self.child.start_kill() {
            warn!(
                target = "marimo_gateway::upstream",
                error = %err,
                "Failed to stop live server"
            );
            return;
        }
        match self.child.wait().await {
            Ok(status) => info!(
                target = "marimo_gateway::upstream",
                exit = %status,
                "Live server stopped"
            ),
            Err(err) => warn!(
                target = "marimo_gateway::upstream",
                error = %err,
                "Failed to reap live server"
            ),
        }
    }
}
