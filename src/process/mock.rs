//! Mock runner for testing.
//!
//! Records every command instead of spawning it, answers with scripted
//! exit codes and pretends a configurable set of binaries is installed.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::Result;

/// Recorded state stays readable after a panicking test thread.
fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct MockRunner {
    calls: Mutex<Vec<CommandSpec>>,
    /// Exit codes keyed by a substring of the displayed command line.
    failures: Mutex<Vec<(String, i32)>>,
    stdout: Mutex<HashMap<String, String>>,
    binaries: Mutex<HashSet<String>>,
    /// When set, every binary lookup succeeds.
    pub all_binaries: bool,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runner where every `has_binary` check succeeds.
    pub fn permissive() -> Self {
        Self {
            all_binaries: true,
            ..Self::default()
        }
    }

    pub fn with_binaries<I, S>(binaries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let runner = Self::new();
        guard(&runner.binaries).extend(binaries.into_iter().map(Into::into));
        runner
    }

    /// Commands whose display line contains `pattern` exit with `code`.
    pub fn fail_on(&self, pattern: impl Into<String>, code: i32) {
        guard(&self.failures).push((pattern.into(), code));
    }

    /// Commands whose display line contains `pattern` print `output`.
    pub fn respond(&self, pattern: impl Into<String>, output: impl Into<String>) {
        guard(&self.stdout).insert(pattern.into(), output.into());
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        guard(&self.calls).clone()
    }

    /// Displayed command lines in call order.
    pub fn command_lines(&self) -> Vec<String> {
        guard(&self.calls).iter().map(CommandSpec::display).collect()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.command_lines().iter().any(|line| line.contains(pattern))
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.display();
        guard(&self.calls).push(spec.clone());

        let exit_code = guard(&self.failures)
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);

        let stdout = guard(&self.stdout)
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();

        Ok(CommandOutput {
            exit_code: Some(exit_code),
            stdout,
            stderr: String::new(),
        })
    }

    fn has_binary(&self, name: &str) -> bool {
        self.all_binaries || guard(&self.binaries).contains(name)
    }
}
