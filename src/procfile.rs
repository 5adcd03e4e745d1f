use indexmap::IndexMap;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use crate::config::{CRON_FIELD_LIMITS, WEB_WORKER_KINDS, WSGI_WORKER_KINDS};
use crate::error::{AgentError, Result};

static CRON_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^((?:(?:\*/)?\d+)|\*) ((?:(?:\*/)?\d+)|\*) ((?:(?:\*/)?\d+)|\*) ((?:(?:\*/)?\d+)|\*) ((?:(?:\*/)?\d+)|\*) (.*)$",
    )
    .unwrap()
});

/// Kinds end up in worker config file names, so no separators or dots.
static KIND_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Parsed Procfile: one shell command per process kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Procfile {
    workers: IndexMap<String, String>,
}

impl Procfile {
    /// Parse Procfile text. Later lines for the same kind replace earlier ones.
    pub fn parse(text: &str) -> Result<Self> {
        let mut workers = IndexMap::new();

        for (index, raw) in text.split('\n').enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (kind, command) = line.split_once(':').ok_or_else(|| AgentError::MalformedProcfile {
                line: index + 1,
                content: line.to_string(),
            })?;
            let kind = kind.trim();
            let command = command.trim();
            if !KIND_PATTERN.is_match(kind) {
                return Err(AgentError::MalformedProcfile {
                    line: index + 1,
                    content: line.to_string(),
                });
            }

            if kind == "cron" {
                check_cron(command)?;
            }

            workers.insert(kind.to_string(), command.to_string());
        }

        let has_wsgi = WSGI_WORKER_KINDS.iter().any(|k| workers.contains_key(*k));
        if has_wsgi && workers.contains_key("web") {
            return Err(AgentError::ConflictingWorkerKinds);
        }

        Ok(Self { workers })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn workers(&self) -> &IndexMap<String, String> {
        &self.workers
    }

    /// Kinds eligible for front-end exposure (and for scaling).
    pub fn web_workers(&self) -> IndexMap<String, String> {
        self.workers
            .iter()
            .filter(|(kind, _)| WEB_WORKER_KINDS.contains(&kind.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn get(&self, kind: &str) -> Option<&str> {
        self.workers.get(kind).map(String::as_str)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.workers.contains_key(kind)
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }
}

impl fmt::Display for Procfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (kind, command) in &self.workers {
            writeln!(f, "{}: {}", kind, command)?;
        }
        Ok(())
    }
}

/// Validate the five schedule fields of a cron command. Wildcards count as 1
/// and `*/n` as `n` when checked against the field maxima.
fn check_cron(command: &str) -> Result<()> {
    let caps = CRON_PATTERN
        .captures(command)
        .ok_or_else(|| AgentError::InvalidCronPattern(command.to_string()))?;

    for (i, limit) in CRON_FIELD_LIMITS.iter().enumerate() {
        let field = &caps[i + 1];
        let value: u32 = field
            .replace("*/", "")
            .replace('*', "1")
            .parse()
            .map_err(|_| AgentError::InvalidCronPattern(command.to_string()))?;
        if value > *limit {
            return Err(AgentError::InvalidCronPattern(command.to_string()));
        }
    }

    Ok(())
}
