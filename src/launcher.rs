//! Reconciles an app's enabled worker configs with its Procfile and the
//! desired replica counts in `SCALING`.

use indexmap::IndexMap;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::app::Application;
use crate::app_config::AppConfig;
use crate::config::{INTERNAL_ENV_PREFIX, NON_WORKER_KINDS};
use crate::env::Env;
use crate::error::{AgentError, Result};
use crate::process::port::pick_free_port;
use crate::settings::{fingerprint, parse_pairs, write_settings};
use crate::state::AgentState;
use crate::uwsgi::{find_configs, spawn_worker, WorkerContext, WorkerKind};

/// Launch-time switches read once from the app env.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSettings {
    pub auto_restart: bool,
    pub disable_ipv6: bool,
    pub server_name: Option<String>,
}

impl LaunchSettings {
    pub fn from_env(env: &Env) -> Self {
        Self {
            auto_restart: env.get_bool("HOP3_AUTO_RESTART", true),
            disable_ipv6: env.get_bool("DISABLE_IPV6", false),
            server_name: env.get("NGINX_SERVER_NAME").map(str::to_string),
        }
    }
}

/// Counts after deltas, plus the ordinals to bring up and take down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalingPlan {
    pub counts: IndexMap<String, i64>,
    pub to_create: IndexMap<String, Vec<u32>>,
    pub to_destroy: IndexMap<String, Vec<u32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpawnOutcome {
    /// `kind.ordinal` of each worker config written.
    pub created: Vec<String>,
    pub destroyed: Vec<String>,
}

/// Add `deltas` to the matching `counts`. Deltas for unknown kinds are
/// ignored; a kind driven below zero is an error.
pub fn apply_deltas(
    counts: &IndexMap<String, i64>,
    deltas: &IndexMap<String, i64>,
) -> Result<IndexMap<String, i64>> {
    let mut next = counts.clone();
    for (kind, count) in next.iter_mut() {
        if let Some(delta) = deltas.get(kind) {
            *count += delta;
            if *count < 0 {
                return Err(AgentError::InvalidScale { kind: kind.clone() });
            }
        }
    }
    Ok(next)
}

/// Every kind keeps ordinals `1..=count`; a shrinking kind also loses the
/// ordinals above its new count, highest first.
pub fn plan_scaling(
    current: &IndexMap<String, i64>,
    deltas: &IndexMap<String, i64>,
) -> Result<ScalingPlan> {
    let counts = apply_deltas(current, deltas)?;
    let mut plan = ScalingPlan::default();

    for (kind, &old) in current {
        let new = counts[kind];
        plan.to_create.insert(kind.clone(), ordinals(1, new));
        if new < old {
            let mut gone = ordinals(new + 1, old);
            gone.reverse();
            plan.to_destroy.insert(kind.clone(), gone);
        }
    }

    plan.counts = counts;
    Ok(plan)
}

fn ordinals(from: i64, to: i64) -> Vec<u32> {
    (from.max(1)..=to).filter_map(|n| u32::try_from(n).ok()).collect()
}

/// Desired counts: one per web kind, overridden by the persisted value.
/// Kinds in `SCALING` that the Procfile no longer declares are ignored.
pub fn current_counts(
    web_kinds: &IndexMap<String, String>,
    scaling_path: &Path,
) -> Result<IndexMap<String, i64>> {
    let mut counts: IndexMap<String, i64> = web_kinds.keys().map(|k| (k.clone(), 1)).collect();
    for (kind, value) in parse_pairs(scaling_path, ':')? {
        if let Some(count) = counts.get_mut(&kind) {
            *count = value.parse().map_err(|_| AgentError::MalformedSetting {
                path: scaling_path.to_path_buf(),
                line: format!("{}:{}", kind, value),
            })?;
        }
    }
    Ok(counts)
}

/// Turn `kind=count` arguments into deltas against the persisted scaling.
pub fn scale_deltas(app: &Application, settings: &[String]) -> Result<IndexMap<String, i64>> {
    let mut worker_count: IndexMap<String, i64> = IndexMap::new();
    for (kind, value) in app.scaling()? {
        let count = value.parse().map_err(|_| AgentError::MalformedSetting {
            path: app.scaling_path(),
            line: format!("{}:{}", kind, value),
        })?;
        worker_count.insert(kind, count);
    }

    let mut deltas = IndexMap::new();
    for setting in settings {
        let (kind, count) = setting
            .split_once('=')
            .and_then(|(k, v)| Some((k.trim(), v.trim().parse::<i64>().ok()?)))
            .ok_or_else(|| AgentError::MalformedScaleSetting(setting.clone()))?;

        if count < 0 {
            return Err(AgentError::InvalidScale { kind: kind.to_string() });
        }
        let current = worker_count
            .get(kind)
            .ok_or_else(|| AgentError::WorkerTypeNotPresent {
                app: app.name().to_string(),
                kind: kind.to_string(),
            })?;
        deltas.insert(kind.to_string(), count - current);
    }
    Ok(deltas)
}

pub struct AppLauncher<'a> {
    state: &'a AgentState,
    app: &'a Application,
    config: AppConfig,
    deltas: IndexMap<String, i64>,
    env: Env,
}

impl<'a> AppLauncher<'a> {
    pub fn new(
        state: &'a AgentState,
        app: &'a Application,
        deltas: IndexMap<String, i64>,
    ) -> Result<Self> {
        let config = AppConfig::from_dir(&app.app_path())?;
        let mut launcher = Self {
            state,
            app,
            config,
            deltas,
            env: Env::new(),
        };
        launcher.env = launcher.make_env()?;
        Ok(launcher)
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Layered runtime env: bootstrap < app `ENV` file < persisted settings
    /// < picked port < network defaults.
    pub fn make_env(&self) -> Result<Env> {
        let agent = &self.state.config;
        let venv = self.app.virtualenv_path();
        let host_path = std::env::var("PATH").unwrap_or_default();
        let mut path = format!("{}:{}", venv.join("bin").display(), host_path);

        let mut env = Env::new();
        env.set("APP", self.app.name());
        env.set("HOME", agent.hop3_root.display());
        env.set("USER", &agent.hop3_user);
        env.set("PWD", self.app.app_path().display());
        env.set("VIRTUAL_ENV", venv.display());

        let node_path = venv.join("node_modules");
        if node_path.exists() {
            env.set("NODE_PATH", node_path.display());
            path = format!("{}:{}", node_path.join(".bin").display(), path);
        }
        env.set("PATH", path);

        env.parse_settings(&self.app.env_file())?;
        env.update(self.state.store.runtime_env(self.app.name())?.iter());

        if !env.contains("PORT") {
            let port = match self.state.store.port(self.app.name())? {
                Some(port) => port,
                None => {
                    let port = pick_free_port()?;
                    info!("Picked free port: {}", port);
                    port
                }
            };
            env.set("PORT", port);
        }

        let mut safe_defaults = vec![
            ("NGINX_IPV4_ADDRESS", "0.0.0.0"),
            ("NGINX_IPV6_ADDRESS", "[::]"),
            ("BIND_ADDRESS", "127.0.0.1"),
        ];
        if LaunchSettings::from_env(&env).disable_ipv6 {
            safe_defaults.retain(|(k, _)| *k != "NGINX_IPV6_ADDRESS");
            info!("nginx will NOT use IPv6");
        }
        for (key, value) in safe_defaults {
            if !env.contains(key) {
                debug!("nginx {} will be set to {}", key, value);
                env.set(key, value);
            }
        }

        Ok(env)
    }

    /// Non-web kinds that run as a single worker.
    fn aux_workers(&self) -> Vec<&str> {
        let web = self.config.web_workers();
        self.config
            .workers()
            .keys()
            .map(String::as_str)
            .filter(|k| !web.contains_key(*k) && !NON_WORKER_KINDS.contains(k))
            .collect()
    }

    pub async fn spawn_app(&self) -> Result<SpawnOutcome> {
        let mut env = self.env.clone();
        let settings = LaunchSettings::from_env(&env);

        // SCALING is read before any await and checked again before the
        // first write; a change in between means another invocation raced us.
        let scaling = self.app.scaling_path();
        let seen = fingerprint(&scaling)?;
        let current = current_counts(&self.config.web_workers(), &scaling)?;
        let plan = plan_scaling(&current, &self.deltas)?;

        // The proxy decides the socket path the workers must bind to.
        if settings.server_name.is_some() {
            self.state.proxy.setup(self.app, &mut env, self.config.workers()).await?;
        }

        if fingerprint(&scaling)? != seen {
            return Err(AgentError::ConcurrentModification(scaling));
        }

        if settings.server_name.is_some() {
            if let Some(names) = env.get("NGINX_SERVER_NAME") {
                self.state.store.set_hostname(self.app.name(), names)?;
            }
        }
        env.strip_prefixed(INTERNAL_ENV_PREFIX);
        env.write(&self.app.live_env_path())?;
        write_settings(&scaling, plan.counts.iter(), ':')?;

        let agent = &self.state.config;
        if settings.auto_restart {
            let configs = find_configs(&agent.uwsgi_enabled, self.app.name())?;
            if !configs.is_empty() {
                info!("Removing uwsgi configs to trigger auto-restart.");
                for config in configs {
                    std::fs::remove_file(config)?;
                }
            }
        }

        let ctx = WorkerContext::for_app(agent, self.app);
        let mut outcome = SpawnOutcome::default();

        let aux: Vec<(&str, Vec<u32>)> = self.aux_workers().into_iter().map(|k| (k, vec![1])).collect();
        let to_create = plan
            .to_create
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .chain(aux);
        for (kind, ordinals) in to_create {
            let command = self.config.get_worker(kind);
            for ordinal in ordinals {
                if ctx.enabled_path(kind, ordinal).exists() {
                    continue;
                }
                info!("spawning '{}:{}.{}'", self.app.name(), kind, ordinal);
                if spawn_worker(&WorkerKind::parse(kind), &ctx, command, &env, ordinal)?.is_some() {
                    outcome.created.push(format!("{}.{}", kind, ordinal));
                }
            }
        }

        // Logs of removed workers stay in place.
        for (kind, ordinals) in &plan.to_destroy {
            for &ordinal in ordinals {
                let enabled = ctx.enabled_path(kind, ordinal);
                if !enabled.exists() {
                    continue;
                }
                warn!("terminating '{}:{}.{}'", self.app.name(), kind, ordinal);
                std::fs::remove_file(&enabled)?;
                outcome.destroyed.push(format!("{}.{}", kind, ordinal));
            }
        }

        if let Some(port) = env.get("PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.state.store.set_port(self.app.name(), port)?;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, i64)]) -> IndexMap<String, i64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn no_delta_keeps_every_ordinal() {
        let plan = plan_scaling(&counts(&[("web", 2)]), &IndexMap::new()).unwrap();
        assert_eq!(plan.to_create["web"], vec![1, 2]);
        assert!(plan.to_destroy.is_empty());
        assert_eq!(plan.counts["web"], 2);
    }

    #[test]
    fn zero_delta_is_no_change() {
        let plan = plan_scaling(&counts(&[("web", 3)]), &counts(&[("web", 0)])).unwrap();
        assert_eq!(plan.to_create["web"], vec![1, 2, 3]);
        assert!(plan.to_destroy.is_empty());
    }

    #[test]
    fn scaling_to_zero_destroys_everything() {
        let plan = plan_scaling(&counts(&[("web", 2)]), &counts(&[("web", -2)])).unwrap();
        assert!(plan.to_create["web"].is_empty());
        assert_eq!(plan.to_destroy["web"], vec![2, 1]);
    }

    #[test]
    fn below_zero_is_rejected() {
        let err = plan_scaling(&counts(&[("web", 1)]), &counts(&[("web", -2)])).unwrap_err();
        assert!(matches!(err, AgentError::InvalidScale { kind } if kind == "web"));
    }

    #[test]
    fn launch_settings_defaults() {
        let settings = LaunchSettings::from_env(&Env::new());
        assert!(settings.auto_restart);
        assert!(!settings.disable_ipv6);
        assert_eq!(settings.server_name, None);

        let env = Env::from_pairs([("HOP3_AUTO_RESTART", "off"), ("NGINX_SERVER_NAME", "a.example")]);
        let settings = LaunchSettings::from_env(&env);
        assert!(!settings.auto_restart);
        assert_eq!(settings.server_name.as_deref(), Some("a.example"));
    }
}
