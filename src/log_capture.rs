use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub level: LogLevel,
    pub message: String,
}

/// Which part of the pipeline produced a line of child output.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Git,
    Build,
    Hook,
    Agent,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

impl LogEntry {
    pub fn new(source: LogSource, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            level,
            message: message.into(),
        }
    }

    /// Forward to `tracing` at the entry's level.
    pub fn emit(&self) {
        let source = self.source;
        match self.level {
            LogLevel::Error => error!(?source, "{}", self.message),
            LogLevel::Warn => warn!(?source, "{}", self.message),
            LogLevel::Debug => debug!(?source, "{}", self.message),
            LogLevel::Info => info!(?source, "{}", self.message),
        }
    }
}

/// Spawn a task that reads `stream` line by line, logs every line under
/// `source`, and hands back the collected lines when the stream closes.
pub fn spawn_line_reader<R>(stream: R, source: LogSource) -> tokio::task::JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();
        let mut collected = Vec::new();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    LogEntry::new(source, classify_log_level(&line), line.as_str()).emit();
                    collected.push(line);
                }
                Ok(None) => {
                    debug!("{:?} output closed", source);
                    break;
                }
                Err(e) => {
                    warn!("Error reading {:?} output: {}", source, e);
                    break;
                }
            }
        }

        collected
    })
}

pub fn classify_log_level(line: &str) -> LogLevel {
    if line.contains("ERROR") || line.contains("error:") || line.contains("fatal:") {
        LogLevel::Error
    } else if line.contains("WARN") || line.contains("warning") {
        LogLevel::Warn
    } else if line.contains("DEBUG") || line.contains("TRACE") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_tool_output() {
        assert_eq!(classify_log_level("fatal: not a git repository"), LogLevel::Error);
        assert_eq!(classify_log_level("npm warning deprecated"), LogLevel::Warn);
        assert_eq!(classify_log_level("Collecting flask"), LogLevel::Info);
    }

    #[tokio::test]
    async fn reader_collects_every_line() {
        let input: &[u8] = b"one\ntwo\nthree";
        let lines = spawn_line_reader(input, LogSource::Build).await.unwrap();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }
}
