use std::path::PathBuf;

/// Every fatal condition of the agent. The CLI prints the message and exits
/// with [`AgentError::exit_code`].
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // Validation
    #[error("Invalid app name: '{0}'")]
    InvalidAppName(String),

    #[error("Misformatted Procfile entry '{content}' at line {line}")]
    MalformedProcfile { line: usize, content: String },

    #[error("Invalid cron pattern: {0}")]
    InvalidCronPattern(String),

    #[error("Found both 'wsgi' and 'web' workers")]
    ConflictingWorkerKinds,

    #[error("Malformed setting '{line}' in {path:?}")]
    MalformedSetting { path: PathBuf, line: String },

    #[error("Malformed setting '{0}'")]
    MalformedScaleSetting(String),

    #[error("Cannot scale type '{kind}' below 0")]
    InvalidScale { kind: String },

    #[error("Malformed setting '{key}': '{value}'")]
    InvalidWorkerSetting { key: String, value: String },

    #[error("Malformed ref update line '{0}'")]
    MalformedRefLine(String),

    // Preconditions
    #[error("App '{0}' not found")]
    AppNotFound(String),

    #[error("Procfile not found in {0:?}")]
    ProcfileNotFound(PathBuf),

    #[error("Procfile for app '{0}' defines no workers")]
    NoWorkersDefined(String),

    #[error("Worker type '{kind}' not present in '{app}'")]
    WorkerTypeNotPresent { app: String, kind: String },

    #[error("No app detected")]
    NoBuilderDetected,

    #[error("{builder} builder needs missing binaries: {missing}")]
    MissingRequirements { builder: String, missing: String },

    #[error("Can't update node with app running. Stop the app & retry")]
    AppRunning,

    // External tools
    #[error("{command} failed with exit code {exit_code}")]
    CommandFailed { command: String, exit_code: i32 },

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    // Concurrency
    #[error("App '{0}' is locked by another operation")]
    AppLocked(String),

    #[error("{0:?} was modified by a concurrent operation")]
    ConcurrentModification(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Process exit status for this error. Failed external commands surface
    /// their own code.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::CommandFailed { exit_code, .. } if *exit_code > 0 => *exit_code,
            _ => 1,
        }
    }
}
