use indexmap::IndexMap;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::deploy::Deployer;
use crate::diagnostics::DeployReport;
use crate::env::Env;
use crate::error::{AgentError, Result};
use crate::launcher::{scale_deltas, AppLauncher, SpawnOutcome};
use crate::settings::parse_pairs;
use crate::state::AgentState;
use crate::store::RunState;
use crate::uwsgi::find_configs;

static APP_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Number of worker configs that were disabled.
    Stopped(usize),
    NotRunning,
}

/// One deployable application and its on-disk layout under `apps_root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    name: String,
    app_path: PathBuf,
}

impl Application {
    pub fn new(config: &AgentConfig, name: &str) -> Result<Self> {
        Self::in_root(&config.apps_root, name)
    }

    pub fn in_root(apps_root: &Path, name: &str) -> Result<Self> {
        if !APP_NAME_PATTERN.is_match(name) {
            return Err(AgentError::InvalidAppName(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            app_path: apps_root.join(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn app_path(&self) -> PathBuf {
        self.app_path.clone()
    }

    /// Bare git repository receiving pushes.
    pub fn repo_path(&self) -> PathBuf {
        self.app_path.join("git")
    }

    pub fn src_path(&self) -> PathBuf {
        self.app_path.join("src")
    }

    /// Persistent data, never removed by the agent.
    pub fn data_path(&self) -> PathBuf {
        self.app_path.join("data")
    }

    pub fn log_path(&self) -> PathBuf {
        self.app_path.join("log")
    }

    pub fn virtualenv_path(&self) -> PathBuf {
        self.app_path.join("venv")
    }

    /// Settings shipped alongside the app.
    pub fn env_file(&self) -> PathBuf {
        self.app_path.join("ENV")
    }

    pub fn live_env_path(&self) -> PathBuf {
        self.virtualenv_path().join("LIVE_ENV")
    }

    pub fn scaling_path(&self) -> PathBuf {
        self.virtualenv_path().join("SCALING")
    }

    pub fn exists(&self) -> bool {
        self.app_path.exists()
    }

    pub fn check_exists(&self) -> Result<()> {
        if self.exists() {
            Ok(())
        } else {
            Err(AgentError::AppNotFound(self.name.clone()))
        }
    }

    pub fn create(&self) -> Result<()> {
        for path in [
            self.app_path(),
            self.repo_path(),
            self.src_path(),
            self.data_path(),
            self.log_path(),
        ] {
            std::fs::create_dir_all(&path)?;
        }
        Ok(())
    }

    /// Persisted `kind:count` scaling, empty before the first launch.
    pub fn scaling(&self) -> Result<IndexMap<String, String>> {
        parse_pairs(&self.scaling_path(), ':')
    }

    /// Worker log files of `process` (`*` for all), sorted.
    pub fn log_files(&self, process: &str) -> Result<Vec<PathBuf>> {
        let pattern = format!(
            "{}/{}.*.log",
            glob::Pattern::escape(&self.log_path().display().to_string()),
            process
        );
        let paths = glob::glob(&pattern).map_err(|e| AgentError::Other(format!("Bad log pattern: {}", e)))?;
        let mut files: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
        files.sort();
        Ok(files)
    }

    pub fn enabled_configs(&self, config: &AgentConfig) -> Result<Vec<PathBuf>> {
        find_configs(&config.uwsgi_enabled, &self.name)
    }

    pub fn is_running(&self, state: &AgentState) -> Result<bool> {
        Ok(state.store.run_state(&self.name)? == RunState::Running)
    }

    pub fn runtime_env(&self, state: &AgentState) -> Result<Env> {
        state.store.runtime_env(&self.name)
    }

    //
    // Lifecycle
    //

    pub async fn deploy(
        &self,
        state: &AgentState,
        deltas: &IndexMap<String, i64>,
        newrev: Option<&str>,
    ) -> Result<DeployReport> {
        let mut report = DeployReport::new(&self.name, newrev);
        self.deploy_into(state, &mut report, deltas).await?;
        Ok(report)
    }

    /// Deploy into a caller-owned report, which still holds the failed phase
    /// when an error comes back.
    pub async fn deploy_into(
        &self,
        state: &AgentState,
        report: &mut DeployReport,
        deltas: &IndexMap<String, i64>,
    ) -> Result<()> {
        let _lock = state.lock(&self.name).await?;
        self.deploy_locked(state, report, deltas).await
    }

    async fn deploy_locked(
        &self,
        state: &AgentState,
        report: &mut DeployReport,
        deltas: &IndexMap<String, i64>,
    ) -> Result<()> {
        Deployer::new(state, self).deploy(report, deltas).await?;
        state.store.set_run_state(&self.name, RunState::Running)?;
        Ok(())
    }

    async fn redeploy_locked(
        &self,
        state: &AgentState,
        deltas: &IndexMap<String, i64>,
    ) -> Result<DeployReport> {
        let mut report = DeployReport::new(&self.name, None);
        self.deploy_locked(state, &mut report, deltas).await?;
        Ok(report)
    }

    pub async fn start(&self, state: &AgentState) -> Result<SpawnOutcome> {
        let _lock = state.lock(&self.name).await?;
        self.start_locked(state).await
    }

    async fn start_locked(&self, state: &AgentState) -> Result<SpawnOutcome> {
        self.check_exists()?;
        let outcome = AppLauncher::new(state, self, IndexMap::new())?.spawn_app().await?;
        state.store.set_run_state(&self.name, RunState::Running)?;
        Ok(outcome)
    }

    pub async fn stop(&self, state: &AgentState) -> Result<StopOutcome> {
        let _lock = state.lock(&self.name).await?;
        self.stop_locked(state)
    }

    fn stop_locked(&self, state: &AgentState) -> Result<StopOutcome> {
        state.store.set_run_state(&self.name, RunState::Stopped)?;

        let configs = self.enabled_configs(&state.config)?;
        if configs.is_empty() {
            warn!("App '{}' not deployed or already stopped", self.name);
            return Ok(StopOutcome::NotRunning);
        }

        info!("Stopping app '{}'...", self.name);
        for config in &configs {
            std::fs::remove_file(config)?;
        }
        Ok(StopOutcome::Stopped(configs.len()))
    }

    /// Stop then start, under a single lock.
    pub async fn restart(&self, state: &AgentState) -> Result<SpawnOutcome> {
        let _lock = state.lock(&self.name).await?;
        self.check_exists()?;
        info!("Restarting app '{}'...", self.name);
        self.stop_locked(state)?;
        self.start_locked(state).await
    }

    /// `ps:scale`: turn `kind=count` settings into deltas and redeploy.
    pub async fn scale(&self, state: &AgentState, settings: &[String]) -> Result<DeployReport> {
        let _lock = state.lock(&self.name).await?;
        self.check_exists()?;
        let deltas = scale_deltas(self, settings)?;
        self.redeploy_locked(state, &deltas).await
    }

    /// `config:set`: persist `KEY=VALUE` settings and redeploy.
    pub async fn set_config(
        &self,
        state: &AgentState,
        settings: &[String],
    ) -> Result<DeployReport> {
        let _lock = state.lock(&self.name).await?;
        self.check_exists()?;

        let mut env = state.store.runtime_env(&self.name)?;
        for setting in settings {
            let (key, value) = setting
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| AgentError::MalformedScaleSetting(setting.clone()))?;
            info!("Setting {}={} for '{}'", key, value, self.name);
            env.set(key, value);
        }
        state.store.set_runtime_env(&self.name, &env)?;

        self.redeploy_locked(state, &IndexMap::new()).await
    }

    /// `config:unset`: drop settings and redeploy.
    pub async fn unset_config(&self, state: &AgentState, keys: &[String]) -> Result<DeployReport> {
        let _lock = state.lock(&self.name).await?;
        self.check_exists()?;

        let mut env = state.store.runtime_env(&self.name)?;
        for key in keys {
            if env.remove(key).is_some() {
                info!("Unsetting {} for '{}'", key, self.name);
            }
        }
        state.store.set_runtime_env(&self.name, &env)?;

        self.redeploy_locked(state, &IndexMap::new()).await
    }

    /// Remove everything the app owns except its data directory.
    pub async fn destroy(&self, state: &AgentState) -> Result<()> {
        let _lock = state.lock(&self.name).await?;
        let config = &state.config;

        for path in [
            self.app_path(),
            self.repo_path(),
            self.virtualenv_path(),
            self.log_path(),
        ] {
            remove_path_preserving(&path, &self.data_path())?;
        }

        for dir in [&config.uwsgi_available, &config.uwsgi_enabled] {
            for file in find_configs(dir, &self.name)? {
                remove_path(&file)?;
            }
        }

        for ext in ["conf", "sock", "key", "crt"] {
            remove_path(&config.nginx_root.join(format!("{}.{}", self.name, ext)))?;
        }

        let acme_link = config.acme_www.join(&self.name);
        if let Ok(target) = std::fs::read_link(&acme_link) {
            let target = if target.is_absolute() {
                target
            } else {
                config.acme_www.join(target)
            };
            remove_path(&acme_link)?;
            remove_path(&target)?;
        }

        state.store.delete_app(&self.name)?;

        let data = self.data_path();
        if data.exists() {
            info!("Preserving folder {:?}", data);
        }
        Ok(())
    }
}

/// Drop every character not allowed in an app name (ssh hands git commands
/// quoted paths such as `'/blog'`).
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

/// Apps with a directory under `apps_root`, sorted by name.
pub fn list_apps(config: &AgentConfig) -> Result<Vec<Application>> {
    let entries = match std::fs::read_dir(&config.apps_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut apps = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Ok(app) = Application::new(config, &entry.file_name().to_string_lossy()) {
            apps.push(app);
        }
    }
    apps.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(apps)
}

fn remove_path(path: &Path) -> Result<()> {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return Ok(());
    };
    if meta.is_dir() {
        info!("Removing directory {:?}", path);
        std::fs::remove_dir_all(path)?;
    } else {
        info!("Removing file {:?}", path);
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Like [`remove_path`], but descends into a directory that contains
/// `keep` and removes its other entries instead.
fn remove_path_preserving(path: &Path, keep: &Path) -> Result<()> {
    if !keep.starts_with(path) || keep == path {
        return remove_path(path);
    }
    let Ok(entries) = std::fs::read_dir(path) else {
        return Ok(());
    };
    for entry in entries {
        let entry = entry?.path();
        if entry == keep {
            continue;
        }
        remove_path_preserving(&entry, keep)?;
    }
    Ok(())
}
