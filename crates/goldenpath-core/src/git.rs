use std::process::Command;

use anyhow::{anyhow, Context, Result};

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Subprocess wrapper around the GitOps working copy.
pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_path)
            .args(args)
            .output()
            .with_context(|| {
                format!("failed to spawn git -C {} {}", self.repo_path, args.join(" "))
            })?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    pub fn fetch_origin(&self) -> Result<()> {
        let result = self.exec(&["fetch", "origin"])?;
        if !result.success() {
            return Err(anyhow!("git fetch origin failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn checkout(&self, branch: &str) -> Result<()> {
        let result = self.exec(&["checkout", branch])?;
        if !result.success() {
            return Err(anyhow!(
                "git checkout {branch} failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn reset_hard(&self, refname: &str) -> Result<()> {
        let result = self.exec(&["reset", "--hard", refname])?;
        if !result.success() {
            return Err(anyhow!(
                "git reset --hard {refname} failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    /// Fast-forward pull; returns the raw result so callers can downgrade a
    /// failure to a warning.
    pub fn pull_ff_only(&self) -> Result<ExecResult> {
        self.exec(&["pull", "--ff-only"])
    }

    pub fn add(&self, paths: &[String]) -> Result<()> {
        let mut args: Vec<&str> = vec!["add"];
        args.extend(paths.iter().map(String::as_str));
        let result = self.exec(&args)?;
        if !result.success() {
            return Err(anyhow!("git add failed: {}", result.combined_output()));
        }
        Ok(())
    }

    pub fn commit(&self, message: &str, author: Option<(&str, &str)>) -> Result<ExecResult> {
        let author_str;
        let mut args = vec!["commit", "-m", message];
        if let Some((name, email)) = author {
            author_str = format!("{name} <{email}>");
            args.push("--author");
            args.push(&author_str);
        }
        self.exec(&args)
    }

    pub fn push(&self, branch: &str) -> Result<ExecResult> {
        self.exec(&["push", "origin", branch])
    }

    pub fn last_commit_oneline(&self) -> Result<String> {
        let result = self.exec(&["log", "--oneline", "-1"])?;
        if !result.success() {
            return Err(anyhow!(
                "git log --oneline -1 failed: {}",
                result.combined_output()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    /// Configure the local identity needed for commits inside containers.
    pub fn set_identity(&self, name: &str, email: &str) -> Result<()> {
        let name_result = self.exec(&["config", "user.name", name])?;
        if !name_result.success() {
            return Err(anyhow!(
                "git config user.name failed: {}",
                name_result.combined_output()
            ));
        }
        let email_result = self.exec(&["config", "user.email", email])?;
        if !email_result.success() {
            return Err(anyhow!(
                "git config user.email failed: {}",
                email_result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn is_repo(&self) -> bool {
        std::path::Path::new(&self.repo_path).join(".git").exists()
    }
}
