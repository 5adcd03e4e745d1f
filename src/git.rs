use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::info;

use crate::app::Application;
use crate::error::{AgentError, Result};
use crate::log_capture::LogSource;
use crate::process::{run_checked, CommandSpec};
use crate::state::AgentState;

/// One `oldrev newrev refname` line fed to the post-receive hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub oldrev: String,
    pub newrev: String,
    pub refname: String,
}

impl RefUpdate {
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [oldrev, newrev, refname] => Ok(Self {
                oldrev: oldrev.to_string(),
                newrev: newrev.to_string(),
                refname: refname.to_string(),
            }),
            _ => Err(AgentError::MalformedRefLine(line.to_string())),
        }
    }
}

/// Parse hook stdin, skipping blank lines.
pub fn parse_ref_updates(input: &str) -> Result<Vec<RefUpdate>> {
    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(RefUpdate::parse)
        .collect()
}

/// Server side of `git push` for one app.
pub struct GitManager<'a> {
    state: &'a AgentState,
    app: &'a Application,
}

impl<'a> GitManager<'a> {
    pub fn new(state: &'a AgentState, app: &'a Application) -> Self {
        Self { state, app }
    }

    pub fn hook_path(&self) -> PathBuf {
        self.app.repo_path().join("hooks").join("post-receive")
    }

    /// Render the post-receive script piping ref updates to `git-hook`.
    pub fn hook_script(&self) -> String {
        format!(
            "#!/usr/bin/env bash\nset -e; set -o pipefail;\ncat | HOP3_ROOT=\"{}\" {} git-hook {}\n",
            self.state.config.hop3_root.display(),
            self.state.config.agent_bin.display(),
            self.app.name()
        )
    }

    /// Create the bare repo and its hook. No-op once the hook exists.
    pub async fn setup_hook(&self) -> Result<()> {
        let hook_path = self.hook_path();
        if hook_path.exists() {
            return Ok(());
        }

        let repo = self.app.repo_path();
        std::fs::create_dir_all(&repo)?;
        let spec = CommandSpec::git()
            .args(["init", "--quiet", "--bare"])
            .arg(repo.display().to_string())
            .timeout(self.state.config.timeouts.git)
            .source(LogSource::Git);
        run_checked(self.state.runner.as_ref(), &spec).await?;

        if let Some(parent) = hook_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&hook_path, self.hook_script())?;

        let mut perms = std::fs::metadata(&hook_path)?.permissions();
        perms.set_mode(perms.mode() | 0o100);
        std::fs::set_permissions(&hook_path, perms)?;

        info!("Installed post-receive hook {:?}", hook_path);
        Ok(())
    }

    /// Check the bare repo out into `src`, creating the app first.
    pub async fn clone(&self) -> Result<()> {
        if self.app.src_path().join(".git").exists() {
            return Ok(());
        }
        if !self.app.exists() {
            info!("Creating app '{}'", self.app.name());
        }
        self.app.create()?;

        let spec = CommandSpec::git()
            .args(["clone", "--quiet"])
            .arg(self.app.repo_path().display().to_string())
            .arg(self.app.src_path().display().to_string())
            .timeout(self.state.config.timeouts.git)
            .source(LogSource::Git);
        run_checked(self.state.runner.as_ref(), &spec).await?;
        Ok(())
    }

    /// Hand the push protocol to git, stdio untouched.
    pub async fn receive_pack(&self) -> Result<()> {
        self.plumbing("git-receive-pack").await
    }

    pub async fn upload_pack(&self) -> Result<()> {
        self.plumbing("git-upload-pack").await
    }

    async fn plumbing(&self, program: &str) -> Result<()> {
        let repo = self.app.repo_path();
        let spec = CommandSpec::new(program)
            .arg(repo.display().to_string())
            .cwd(&repo)
            .passthrough();
        run_checked(self.state.runner.as_ref(), &spec).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ref_lines() {
        let updates = parse_ref_updates("aaa bbb refs/heads/main\n\nccc ddd refs/heads/dev\n").unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].newrev, "bbb");
        assert_eq!(updates[1].refname, "refs/heads/dev");
    }

    #[test]
    fn rejects_short_ref_lines() {
        let err = parse_ref_updates("aaa bbb\n").unwrap_err();
        assert!(matches!(err, AgentError::MalformedRefLine(line) if line == "aaa bbb"));
    }
}
