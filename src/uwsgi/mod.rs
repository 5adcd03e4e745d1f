//! Generation of uWSGI vassal configs, one file per worker.

pub mod settings;
pub mod worker;

use std::fmt;

pub use settings::UwsgiSettings;
pub use worker::{config_name, find_configs, generate, spawn_worker, WorkerContext, WorkerSettings};

/// Process kind of a worker, as named in the Procfile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Wsgi,
    Jwsgi,
    Rwsgi,
    Web,
    Cron,
    Static,
    /// Any other Procfile kind, run as an attached daemon.
    Generic(String),
}

impl WorkerKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "wsgi" => WorkerKind::Wsgi,
            "jwsgi" => WorkerKind::Jwsgi,
            "rwsgi" => WorkerKind::Rwsgi,
            "web" => WorkerKind::Web,
            "cron" => WorkerKind::Cron,
            "static" => WorkerKind::Static,
            other => WorkerKind::Generic(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WorkerKind::Wsgi => "wsgi",
            WorkerKind::Jwsgi => "jwsgi",
            WorkerKind::Rwsgi => "rwsgi",
            WorkerKind::Web => "web",
            WorkerKind::Cron => "cron",
            WorkerKind::Static => "static",
            WorkerKind::Generic(name) => name,
        }
    }

    /// Kinds served through the app server's own socket.
    pub fn is_wsgi_family(&self) -> bool {
        matches!(self, WorkerKind::Wsgi | WorkerKind::Jwsgi | WorkerKind::Rwsgi)
    }

    pub fn is_web(&self) -> bool {
        self.is_wsgi_family() || *self == WorkerKind::Web
    }

    fn log_format(&self) -> Option<&'static str> {
        match self {
            WorkerKind::Wsgi | WorkerKind::Web => Some(
                r#"%%(addr) - %%(user) [%%(ltime)] "%%(method) %%(uri) %%(proto)" %%(status) %%(size) "%%(referer)" "%%(uagent)" %%(msecs)ms"#,
            ),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
