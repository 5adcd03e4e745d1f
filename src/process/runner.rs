use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::env::Env;
use crate::error::{AgentError, Result};
use crate::log_capture::{spawn_line_reader, LogSource};

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Overlaid on the agent's own environment.
    pub env: Env,
    /// Inherited variables starting with any of these are not passed on.
    pub scrub_prefixes: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub source: LogSource,
    /// Hand the agent's stdin/stdout to the child untouched (git pack protocol).
    pub passthrough: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Env::new(),
            scrub_prefixes: Vec::new(),
            stdin: None,
            timeout: None,
            source: LogSource::Agent,
            passthrough: false,
        }
    }

    /// `sh -c "<command>"`.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(command)
    }

    /// `git` without the `GIT_*` variables a hook inherits (`GIT_DIR=.` and
    /// friends would point every command at the bare repo).
    pub fn git() -> Self {
        Self::new("git").scrub_env("GIT_")
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, env: &Env) -> Self {
        self.env.update(env.iter());
        self
    }

    pub fn scrub_env(mut self, prefix: impl Into<String>) -> Self {
        self.scrub_prefixes.push(prefix.into());
        self
    }

    /// Whether an inherited variable is dropped for this command.
    pub fn scrubs(&self, key: &str) -> bool {
        self.scrub_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn source(mut self, source: LogSource) -> Self {
        self.source = source;
        self
    }

    pub fn passthrough(mut self) -> Self {
        self.passthrough = true;
        self
    }

    /// Human-readable command line for logs and error messages.
    pub fn display(&self) -> String {
        if self.program == "sh" && self.args.len() == 2 && self.args[0] == "-c" {
            return self.args[1].clone();
        }
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Seam between the pipeline and the host's processes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Whether `name` resolves to an executable on `PATH`.
    fn has_binary(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }
}

/// Run `spec`, turning a non-zero exit into [`AgentError::CommandFailed`].
pub async fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
    let output = runner.run(spec).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(AgentError::CommandFailed {
            command: spec.display(),
            exit_code: output.exit_code.unwrap_or(-1),
        })
    }
}

/// Runs commands as real child processes via `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let command_line = spec.display();
        debug!("Running {:?} in {:?}", command_line, spec.cwd);

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, _) in std::env::vars_os() {
            if key.to_str().is_some_and(|k| spec.scrubs(k)) {
                command.env_remove(&key);
            }
        }
        for (key, value) in spec.env.iter() {
            command.env(key, value);
        }

        if spec.passthrough {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            command
                .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|e| AgentError::Spawn {
            command: command_line.clone(),
            source: e,
        })?;

        if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            stdin.write_all(input).await?;
            drop(stdin);
        }

        let stdout_handle = child.stdout.take().map(|s| spawn_line_reader(s, spec.source));
        let stderr_handle = child.stderr.take().map(|s| spawn_line_reader(s, spec.source));

        let status = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!("{} timed out after {}s, killing", command_line, limit.as_secs());
                    let _ = child.kill().await;
                    return Err(AgentError::Timeout(format!(
                        "{} timed out after {}s",
                        command_line,
                        limit.as_secs()
                    )));
                }
            },
            None => child.wait().await?,
        };

        let stdout = match stdout_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout: stdout.join("\n"),
            stderr: stderr.join("\n"),
        })
    }
}
