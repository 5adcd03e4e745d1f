//! Per-language dependency installation. Every builder whose `accept`
//! matches the checkout runs, in registration order.

mod clojure;
mod go;
mod java;
mod node;
mod php;
mod python;
mod ruby;
mod rust;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::app::Application;
use crate::env::Env;
use crate::error::Result;
use crate::log_capture::LogSource;
use crate::process::{run_checked, CommandOutput, CommandRunner, CommandSpec};
use crate::uwsgi::find_configs;

pub use clojure::ClojureBuilder;
pub use go::GoBuilder;
pub use java::JavaBuilder;
pub use node::NodeBuilder;
pub use php::PhpBuilder;
pub use python::PythonBuilder;
pub use ruby::RubyBuilder;
pub use rust::RustBuilder;

#[async_trait]
pub trait Builder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Host binaries that must be on `PATH` before `build` runs.
    fn requirements(&self) -> &'static [&'static str];

    fn accept(&self, ctx: &BuildContext<'_>) -> bool;

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<()>;
}

/// The builders tried on every deploy.
pub fn default_builders() -> Vec<Box<dyn Builder>> {
    vec![
        Box::new(PythonBuilder),
        Box::new(RubyBuilder),
        Box::new(NodeBuilder),
        Box::new(ClojureBuilder),
        Box::new(GoBuilder),
        Box::new(RustBuilder),
        Box::new(PhpBuilder),
        Box::new(JavaBuilder),
    ]
}

/// What a builder may see and touch for one app.
pub struct BuildContext<'a> {
    pub app_name: String,
    pub app_path: PathBuf,
    pub src_path: PathBuf,
    pub venv_path: PathBuf,
    pub env_file: PathBuf,
    /// Enabled worker configs live here; used to tell if the app is running.
    pub uwsgi_enabled: PathBuf,
    pub runner: &'a dyn CommandRunner,
    pub timeout: Duration,
}

impl<'a> BuildContext<'a> {
    pub fn new(
        app: &Application,
        uwsgi_enabled: &Path,
        runner: &'a dyn CommandRunner,
        timeout: Duration,
    ) -> Self {
        Self {
            app_name: app.name().to_string(),
            app_path: app.app_path(),
            src_path: app.src_path(),
            venv_path: app.virtualenv_path(),
            env_file: app.env_file(),
            uwsgi_enabled: uwsgi_enabled.to_path_buf(),
            runner,
            timeout,
        }
    }

    /// Whether any of `files` exists in the checkout.
    pub fn check_exists(&self, files: &[&str]) -> bool {
        files.iter().any(|f| self.src_path.join(f).exists())
    }

    /// Builder defaults overlaid with the app's own `ENV` file.
    pub fn env_with(&self, defaults: Env) -> Result<Env> {
        let mut env = defaults;
        env.parse_settings(&self.env_file)?;
        Ok(env)
    }

    /// `venv/bin` and the given extra directories ahead of the host `PATH`.
    pub fn path_with(&self, extra: &[PathBuf]) -> String {
        let mut parts = vec![self.venv_path.join("bin").display().to_string()];
        parts.extend(extra.iter().map(|p| p.display().to_string()));
        if let Ok(path) = std::env::var("PATH") {
            parts.push(path);
        }
        parts.join(":")
    }

    /// Run a shell command in the source checkout.
    pub async fn shell(&self, command: &str, env: &Env) -> Result<CommandOutput> {
        self.shell_in(&self.src_path, command, env).await
    }

    pub async fn shell_in(&self, cwd: &Path, command: &str, env: &Env) -> Result<CommandOutput> {
        let spec = CommandSpec::shell(command)
            .scrub_env("GIT_")
            .cwd(cwd)
            .env(env)
            .timeout(self.timeout)
            .source(LogSource::Build);
        run_checked(self.runner, &spec).await
    }

    /// True when any worker config of the app is enabled.
    pub fn is_running(&self) -> bool {
        find_configs(&self.uwsgi_enabled, &self.app_name)
            .map(|configs| !configs.is_empty())
            .unwrap_or(false)
    }

    pub fn ensure_venv(&self) -> Result<()> {
        std::fs::create_dir_all(&self.venv_path)?;
        Ok(())
    }
}

pub(crate) fn found_app(kind: &str) {
    info!("{} app detected.", kind);
}
