use indexmap::IndexMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::settings::{parse_settings, write_settings};

const TRUE_VALUES: &[&str] = &["1", "on", "true", "enabled", "yes", "y"];

/// Ordered, string-valued variable bag. Values are stringified on insert;
/// typed getters re-parse on every read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Env {
    data: IndexMap<String, String>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Display,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut env = Env::new();
        env.update(pairs);
        env
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Display) {
        self.data.insert(key.into(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.data.shift_remove(key)
    }

    /// Merge `pairs`, overwriting existing keys.
    pub fn update<K, V, I>(&mut self, pairs: I)
    where
        K: Into<String>,
        V: Display,
        I: IntoIterator<Item = (K, V)>,
    {
        for (k, v) in pairs {
            self.set(k, v);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Integer value of `key`; `default` when absent. A present but
    /// non-numeric value is an error for the caller to report.
    pub fn get_int(
        &self,
        key: &str,
        default: i64,
    ) -> std::result::Result<i64, std::num::ParseIntError> {
        match self.get(key) {
            Some(value) => value.trim().parse(),
            None => Ok(default),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(value) => TRUE_VALUES.contains(&value.trim().to_lowercase().as_str()),
            None => default,
        }
    }

    pub fn get_path(&self, key: &str, default: impl AsRef<Path>) -> PathBuf {
        match self.get(key) {
            Some(value) => PathBuf::from(value),
            None => default.as_ref().to_path_buf(),
        }
    }

    /// Layer a `key=value` file on top of this Env. A missing file is a
    /// no-op; a malformed one leaves the Env untouched and errors.
    pub fn parse_settings(&mut self, path: &Path) -> Result<()> {
        let parsed = parse_settings(path, &self.data)?;
        self.data.extend(parsed);
        Ok(())
    }

    /// Persist as a sorted `key=value` file.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_settings(path, self.iter(), '=')
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    /// Drop every key starting with `prefix`.
    pub fn strip_prefixed(&mut self, prefix: &str) {
        self.data.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<'a> IntoIterator for &'a Env {
    type Item = (&'a String, &'a String);
    type IntoIter = indexmap::map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.data.iter()
    }
}
