use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Hop3 agent: deploys git-pushed apps and reconciles their uWSGI workers.
#[derive(Parser, Debug, Clone)]
#[command(name = "hop3-agent", version)]
pub struct CliArgs {
    /// Root directory holding apps, worker configs and proxy files
    #[arg(long = "root", env = "HOP3_ROOT", default_value = DEFAULT_HOP3_ROOT, global = true)]
    pub root: PathBuf,

    /// System user owning the deployment
    #[arg(long = "user", env = "HOP3_USER", default_value = DEFAULT_HOP3_USER, global = true)]
    pub user: String,

    /// Log at debug level
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the root directory layout
    Setup,

    /// List apps
    Apps,

    /// Create an app's directories without deploying it
    Create { app: String },

    /// Deploy an app from its current checkout
    Deploy {
        app: String,
        /// Print the deploy report as JSON
        #[arg(long = "json")]
        json: bool,
    },

    /// Remove an app (its data directory is kept)
    Destroy { app: String },

    /// (Re)generate worker configs for an app
    Start { app: String },

    /// Disable every worker of an app
    Stop { app: String },

    /// Stop then start an app
    Restart { app: String },

    /// Show worker counts
    Ps { app: String },

    /// Scale workers, e.g. `ps:scale myapp web=3`
    #[command(name = "ps:scale")]
    PsScale {
        app: String,
        #[arg(required = true)]
        settings: Vec<String>,
    },

    /// Show the runtime environment of an app
    Config { app: String },

    /// Print one runtime setting
    #[command(name = "config:get")]
    ConfigGet { app: String, setting: String },

    /// Set runtime settings and redeploy, e.g. `config:set myapp FOO=bar`
    #[command(name = "config:set")]
    ConfigSet {
        app: String,
        #[arg(required = true)]
        settings: Vec<String>,
    },

    /// Unset runtime settings and redeploy
    #[command(name = "config:unset")]
    ConfigUnset {
        app: String,
        #[arg(required = true)]
        settings: Vec<String>,
    },

    /// Print the tail of an app's worker logs
    Logs {
        app: String,
        #[arg(default_value = "*")]
        process: String,
        #[arg(short = 'n', long = "lines", default_value_t = 50)]
        lines: usize,
    },

    /// INTERNAL: post-receive hook
    #[command(name = "git-hook", hide = true)]
    GitHook { app: String },

    /// INTERNAL: handle a git push
    #[command(name = "git-receive-pack", hide = true)]
    GitReceivePack { app: String },

    /// INTERNAL: handle a git fetch
    #[command(name = "git-upload-pack", hide = true)]
    GitUploadPack { app: String },
}

/// Wall-clock limits for the external commands of each deploy phase.
#[derive(Debug, Clone)]
pub struct PhaseTimeouts {
    pub git: Duration,
    pub hook: Duration,
    pub build: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            git: Duration::from_secs(GIT_TIMEOUT_SECS),
            hook: Duration::from_secs(HOOK_TIMEOUT_SECS),
            build: Duration::from_secs(BUILD_TIMEOUT_SECS),
        }
    }
}

pub struct AgentConfig {
    pub hop3_root: PathBuf,
    pub hop3_user: String,
    pub apps_root: PathBuf,
    pub nginx_root: PathBuf,
    pub cache_root: PathBuf,
    pub uwsgi_root: PathBuf,
    pub uwsgi_available: PathBuf,
    pub uwsgi_enabled: PathBuf,
    pub acme_www: PathBuf,
    pub locks_root: PathBuf,
    pub db_path: PathBuf,
    /// Binary invoked by the post-receive hook.
    pub agent_bin: PathBuf,
    /// uid/gid names written into worker configs.
    pub worker_user: String,
    pub worker_group: String,
    pub timeouts: PhaseTimeouts,
    pub lock_wait: Duration,
}

// Path constants
pub const DEFAULT_HOP3_ROOT: &str = "/home/hop3";
pub const DEFAULT_HOP3_USER: &str = "hop3";

// Process constants
pub const GIT_TIMEOUT_SECS: u64 = 300;
pub const HOOK_TIMEOUT_SECS: u64 = 1800;
pub const BUILD_TIMEOUT_SECS: u64 = 1800;

// Lock constants
pub const LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const LOCK_RETRY_INTERVAL_MS: u64 = 250;

// uWSGI constants
pub const UWSGI_LOG_MAXSIZE: &str = "1048576";

// Procfile constants
pub const WEB_WORKER_KINDS: &[&str] = &["wsgi", "jwsgi", "rwsgi", "web"];
pub const WSGI_WORKER_KINDS: &[&str] = &["wsgi", "jwsgi", "rwsgi"];
/// Procfile kinds that are deploy hooks or proxy mappings, never workers.
pub const NON_WORKER_KINDS: &[&str] = &["prebuild", "build", "postbuild", "prerun", "release", "static"];
/// Maximum value of each cron field: minute, hour, day, month, weekday.
pub const CRON_FIELD_LIMITS: [u32; 5] = [59, 24, 31, 12, 7];

// Env keys with this prefix never reach LIVE_ENV
pub const INTERNAL_ENV_PREFIX: &str = "HOP3_INTERNAL_";

impl AgentConfig {
    pub fn new(hop3_root: PathBuf, hop3_user: impl Into<String>) -> Self {
        let (worker_user, worker_group) = current_user_and_group();
        let agent_bin = std::env::current_exe()
            .unwrap_or_else(|_| hop3_root.join("bin").join("hop3-agent"));

        AgentConfig {
            apps_root: hop3_root.join("apps"),
            nginx_root: hop3_root.join("nginx"),
            cache_root: hop3_root.join("cache"),
            uwsgi_root: hop3_root.join("uwsgi"),
            uwsgi_available: hop3_root.join("uwsgi-available"),
            uwsgi_enabled: hop3_root.join("uwsgi-enabled"),
            acme_www: hop3_root.join("acme"),
            locks_root: hop3_root.join("locks"),
            db_path: hop3_root.join("hop3.db"),
            hop3_root,
            hop3_user: hop3_user.into(),
            agent_bin,
            worker_user,
            worker_group,
            timeouts: PhaseTimeouts::default(),
            lock_wait: Duration::from_secs(LOCK_WAIT_TIMEOUT_SECS),
        }
    }

    pub fn from_args(args: &CliArgs) -> Self {
        Self::new(args.root.clone(), args.user.clone())
    }

    /// Directories that must exist before any app is deployed.
    pub fn root_dirs(&self) -> Vec<&PathBuf> {
        vec![
            &self.apps_root,
            &self.cache_root,
            &self.uwsgi_root,
            &self.uwsgi_available,
            &self.uwsgi_enabled,
            &self.nginx_root,
            &self.acme_www,
            &self.locks_root,
        ]
    }

    pub fn ensure_root_dirs(&self) -> std::io::Result<()> {
        for dir in self.root_dirs() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Name of the invoking OS user and its primary group, falling back to the
/// numeric ids when the passwd/group databases have no entry.
fn current_user_and_group() -> (String, String) {
    let uid = nix::unistd::getuid();
    let gid = nix::unistd::getgid();

    let user = match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.as_raw().to_string(),
    };
    let group = match nix::unistd::Group::from_gid(gid) {
        Ok(Some(group)) => group.name,
        _ => gid.as_raw().to_string(),
    };

    (user, group)
}
