//! Git export of run results.
//!
//! Writes one file per job into a git working tree, commits, and pushes to
//! `origin`. Export is best-effort: every failure is logged and swallowed,
//! and the run result is never altered.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, warn};

/// Exports sealed run results into a git repository.
#[derive(Debug, Clone)]
pub struct GitExporter {
    repo_path: PathBuf,
}

impl GitExporter {
    pub fn new(repo_path: impl AsRef<Path>) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Write `results_text` to `<repo>/<job_name>`, commit, and push.
    pub async fn push_results(&self, job_name: &str, results_text: &str) {
        if let Err(error) = tokio::fs::write(self.repo_path.join(job_name), results_text).await {
            warn!(job = job_name, %error, "writing results file failed");
            return;
        }
        let message = format!("Automatic commit ({job_name})");
        let commands = [
            vec!["add", "-A"],
            vec!["commit", "-m", &message],
            vec!["push", "origin"],
        ];
        for args in &commands {
            if !self.git(args).await {
                return;
            }
        }
        debug!(job = job_name, "results pushed to git");
    }

    async fn git(&self, args: &[&str]) -> bool {
        match Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
        {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    ?args,
                    stderr = String::from_utf8_lossy(&output.stderr).trim(),
                    "git command failed"
                );
                false
            }
            Err(error) => {
                warn!(?args, %error, "git invocation failed");
                false
            }
        }
    }
}
