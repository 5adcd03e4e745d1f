use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::info;

use super::settings::UwsgiSettings;
use super::WorkerKind;
use crate::app::Application;
use crate::config::{AgentConfig, UWSGI_LOG_MAXSIZE};
use crate::env::Env;
use crate::error::{AgentError, Result};
use crate::settings::parse_settings;

/// Env keys never forwarded to workers.
const STRIPPED_WORKER_ENV: &[&str] = &["NGINX_ACL"];

/// Filesystem and identity facts shared by every worker of one app.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub app_name: String,
    pub src_path: PathBuf,
    pub log_path: PathBuf,
    pub venv_path: PathBuf,
    pub nginx_root: PathBuf,
    pub uwsgi_available: PathBuf,
    pub uwsgi_enabled: PathBuf,
    pub user: String,
    pub group: String,
}

impl WorkerContext {
    pub fn for_app(config: &AgentConfig, app: &Application) -> Self {
        Self {
            app_name: app.name().to_string(),
            src_path: app.src_path(),
            log_path: app.log_path(),
            venv_path: app.virtualenv_path(),
            nginx_root: config.nginx_root.clone(),
            uwsgi_available: config.uwsgi_available.clone(),
            uwsgi_enabled: config.uwsgi_enabled.clone(),
            user: config.worker_user.clone(),
            group: config.worker_group.clone(),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.nginx_root.join(format!("{}.sock", self.app_name))
    }

    pub fn enabled_path(&self, kind: &str, ordinal: u32) -> PathBuf {
        self.uwsgi_enabled.join(config_name(&self.app_name, kind, ordinal))
    }
}

/// `{app}_{kind}.{ordinal}.ini`
pub fn config_name(app: &str, kind: &str, ordinal: u32) -> String {
    format!("{}_{}.{}.ini", app, kind, ordinal)
}

/// Every worker config of `app` in `dir`, sorted.
pub fn find_configs(dir: &Path, app: &str) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/{}_*.ini",
        glob::Pattern::escape(&dir.display().to_string()),
        glob::Pattern::escape(app)
    );
    let paths = glob::glob(&pattern).map_err(|e| AgentError::Other(format!("Bad config pattern: {}", e)))?;

    let mut configs: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
    configs.sort();
    Ok(configs)
}

/// Worker tunables read from the app env once, with their defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub max_requests: String,
    pub listen: String,
    pub processes: String,
    pub threads: String,
    pub enable_threads: String,
    pub log_x_forwarded_for: String,
    pub log_maxsize: String,
    /// Seconds of inactivity before an on-demand worker exits.
    pub idle: Option<u64>,
    pub include_file: Option<String>,
    pub server_name: Option<String>,
    pub bind_address: Option<String>,
    pub port: Option<String>,
}

impl WorkerSettings {
    pub fn from_env(env: &Env) -> Result<Self> {
        Ok(Self {
            max_requests: env.get_or("UWSGI_MAX_REQUESTS", "1024").to_string(),
            listen: env.get_or("UWSGI_LISTEN", "16").to_string(),
            processes: env.get_or("UWSGI_PROCESSES", "1").to_string(),
            threads: env.get_or("UWSGI_THREADS", "4").to_string(),
            enable_threads: env.get_or("UWSGI_ENABLE_THREADS", "true").to_lowercase(),
            log_x_forwarded_for: env.get_or("UWSGI_LOG_X_FORWARDED_FOR", "false").to_lowercase(),
            log_maxsize: env.get_or("UWSGI_LOG_MAXSIZE", UWSGI_LOG_MAXSIZE).to_string(),
            idle: parse_optional(env, "UWSGI_IDLE")?,
            include_file: env.get("UWSGI_INCLUDE_FILE").map(str::to_string),
            server_name: env.get("NGINX_SERVER_NAME").map(str::to_string),
            bind_address: env.get("BIND_ADDRESS").map(str::to_string),
            port: env.get("PORT").map(str::to_string),
        })
    }

    /// `BIND_ADDRESS:PORT` for a directly exposed worker.
    fn http_bind(&self) -> Result<String> {
        let address = self.bind_address.as_deref().ok_or_else(|| AgentError::InvalidWorkerSetting {
            key: "BIND_ADDRESS".to_string(),
            value: String::new(),
        })?;
        let port = self.port.as_deref().ok_or_else(|| AgentError::InvalidWorkerSetting {
            key: "PORT".to_string(),
            value: String::new(),
        })?;
        Ok(format!("{}:{}", address, port))
    }
}

fn parse_optional<T: std::str::FromStr>(env: &Env, key: &str) -> Result<Option<T>> {
    match env.get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AgentError::InvalidWorkerSetting {
                key: key.to_string(),
                value: value.to_string(),
            }),
        None => Ok(None),
    }
}

/// Build the config of one worker. `static` workers have no process and
/// yield `None`.
pub fn generate(
    kind: &WorkerKind,
    ctx: &WorkerContext,
    command: &str,
    env: &Env,
    ordinal: u32,
) -> Result<Option<UwsgiSettings>> {
    if *kind == WorkerKind::Static {
        info!("nginx serving static files only for '{}'", ctx.app_name);
        return Ok(None);
    }

    let tunables = WorkerSettings::from_env(env)?;
    let mut settings = UwsgiSettings::new();

    add_base_settings(&mut settings, kind, ctx, &tunables, ordinal);
    add_kind_settings(&mut settings, kind, ctx, &tunables, command, env)?;
    add_env(&mut settings, kind, ctx, &tunables, env)?;

    Ok(Some(settings))
}

fn add_base_settings(
    settings: &mut UwsgiSettings,
    kind: &WorkerKind,
    ctx: &WorkerContext,
    tunables: &WorkerSettings,
    ordinal: u32,
) {
    let log_file = ctx.log_path.join(kind.as_str());
    let log_file = log_file.display();

    settings.extend([
        ("chdir", ctx.src_path.display().to_string()),
        ("uid", ctx.user.clone()),
        ("gid", ctx.group.clone()),
        ("master", "true".to_string()),
        ("project", ctx.app_name.clone()),
        ("max-requests", tunables.max_requests.clone()),
        ("listen", tunables.listen.clone()),
        ("processes", tunables.processes.clone()),
        ("procname-prefix", format!("{}:{}:", ctx.app_name, kind)),
        ("enable-threads", tunables.enable_threads.clone()),
        ("log-x-forwarded-for", tunables.log_x_forwarded_for.clone()),
        ("log-maxsize", tunables.log_maxsize.clone()),
        ("logfile-chown", format!("{}:{}", ctx.user, ctx.group)),
        ("logfile-chmod", "640".to_string()),
        ("logto2", format!("{}.{}.log", log_file, ordinal)),
        ("log-backupname", format!("{}.{}.log.old", log_file, ordinal)),
    ]);

    if let Some(format) = kind.log_format() {
        settings.add("log-format", format);
    }

    // Only a real virtualenv can be activated by uWSGI.
    if ctx.venv_path.join("bin").join("activate_this.py").exists() {
        settings.add("virtualenv", ctx.venv_path.display());
    }

    if let Some(idle) = tunables.idle {
        settings.extend([
            ("idle", idle.to_string()),
            ("cheap", "True".to_string()),
            ("die-on-idle", "True".to_string()),
        ]);
        info!(
            "uwsgi will start workers on demand and kill them after {}s of inactivity",
            idle
        );
    }
}

fn add_kind_settings(
    settings: &mut UwsgiSettings,
    kind: &WorkerKind,
    ctx: &WorkerContext,
    tunables: &WorkerSettings,
    command: &str,
    env: &Env,
) -> Result<()> {
    match kind {
        WorkerKind::Cron => {
            let cron = command.replace("*/", "-").replace('*', "-1");
            info!("uwsgi scheduled cron for {}", command);
            settings.add("cron", cron);
        }
        WorkerKind::Jwsgi => {
            settings.extend([
                ("module", command),
                ("threads", tunables.threads.as_str()),
                ("plugin", "jvm"),
                ("plugin", "jwsgi"),
            ]);
        }
        WorkerKind::Rwsgi => {
            settings.extend([
                ("module", command),
                ("threads", tunables.threads.as_str()),
                ("plugin", "rack"),
                ("plugin", "rbrequire"),
                ("plugin", "post-buffering"),
            ]);
        }
        WorkerKind::Wsgi => {
            settings.extend([
                ("module", command),
                ("threads", tunables.threads.as_str()),
                ("plugin", "python3"),
            ]);
            // Only wsgi workers read the async task count.
            if let Some(tasks) = parse_optional::<u32>(env, "UWSGI_ASYNCIO")? {
                settings.add("plugin", "asyncio_python3");
                settings.add("async", tasks);
                info!("uwsgi will support {} async tasks", tasks);
            }
        }
        WorkerKind::Web | WorkerKind::Generic(_) => {
            settings.add("attach-daemon", command);
        }
        WorkerKind::Static => {}
    }

    if kind.is_wsgi_family() {
        if tunables.server_name.is_some() {
            // The proxy talks to the same socket it was configured with.
            let socket = ctx.socket_path();
            info!("nginx will talk to uWSGI via {:?}", socket);
            settings.add("socket", socket.display());
            settings.add("chmod-socket", "664");
        } else {
            let bind = tunables.http_bind()?;
            info!("nginx will talk to uWSGI via {}", bind);
            settings.add("http", &bind);
            settings.add("http-use-socket", &bind);
            settings.add("http-socket", &bind);
        }
    }

    Ok(())
}

fn add_env(
    settings: &mut UwsgiSettings,
    kind: &WorkerKind,
    ctx: &WorkerContext,
    tunables: &WorkerSettings,
    env: &Env,
) -> Result<()> {
    let mut env = env.clone();
    for key in STRIPPED_WORKER_ENV {
        env.remove(key);
    }
    env.set("PROC_TYPE", kind);

    if let Some(include) = &tunables.include_file {
        let extra = parse_settings(&ctx.src_path.join(include), &IndexMap::new())?;
        settings.extend(extra);
    }

    for (key, value) in env.iter() {
        settings.add("env", format!("{}={}", key, value));
    }
    Ok(())
}

/// Generate a worker config, write it to the available directory and mirror
/// it into the enabled one. Returns the enabled path, `None` for `static`.
pub fn spawn_worker(
    kind: &WorkerKind,
    ctx: &WorkerContext,
    command: &str,
    env: &Env,
    ordinal: u32,
) -> Result<Option<PathBuf>> {
    let Some(settings) = generate(kind, ctx, command, env, ordinal)? else {
        return Ok(None);
    };

    let name = config_name(&ctx.app_name, kind.as_str(), ordinal);
    let available = ctx.uwsgi_available.join(&name);
    let enabled = ctx.uwsgi_enabled.join(&name);

    settings.write(&available)?;
    copy_to_enabled(&available, &enabled)?;
    Ok(Some(enabled))
}

fn copy_to_enabled(available: &Path, enabled: &Path) -> Result<()> {
    if let Some(parent) = enabled.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(available, enabled)?;
    Ok(())
}
