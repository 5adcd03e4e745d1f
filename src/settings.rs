//! Reader and writer for the flat `key<sep>value` files the agent keeps on
//! disk: `ENV`, `LIVE_ENV` (separator `=`) and `SCALING` (separator `:`).

use indexmap::IndexMap;
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{AgentError, Result};

static VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\w+|\{([^}]*)\})").unwrap());

/// Shell-style `$VAR` / `${VAR}` interpolation. Unknown references are kept
/// verbatim.
pub fn expand_vars<'a, F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<&'a str>,
{
    VAR_PATTERN
        .replace_all(template, |caps: &Captures| {
            let name = caps
                .get(2)
                .or_else(|| caps.get(1))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match lookup(name) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Parse a `key=value` settings file.
///
/// Values are expanded against the keys parsed so far, then against `known`.
/// A missing file yields an empty map. Any malformed line rejects the whole
/// file so a half-read configuration is never applied.
pub fn parse_settings(
    path: &Path,
    known: &IndexMap<String, String>,
) -> Result<IndexMap<String, String>> {
    let mut parsed: IndexMap<String, String> = IndexMap::new();
    if !path.exists() {
        return Ok(parsed);
    }

    let text = std::fs::read_to_string(path)?;
    for line in text.split('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (key, value) = split_pair(trimmed, '=').ok_or_else(|| AgentError::MalformedSetting {
            path: path.to_path_buf(),
            line: trimmed.to_string(),
        })?;

        let expanded = expand_vars(value, |name| {
            parsed
                .get(name)
                .or_else(|| known.get(name))
                .map(String::as_str)
        });
        parsed.insert(key.to_string(), expanded);
    }

    Ok(parsed)
}

/// Parse a `key<sep>value` file without variable expansion (used for
/// `SCALING`). A missing file yields an empty map.
pub fn parse_pairs(path: &Path, separator: char) -> Result<IndexMap<String, String>> {
    let mut pairs = IndexMap::new();
    if !path.exists() {
        return Ok(pairs);
    }

    let text = std::fs::read_to_string(path)?;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (key, value) = split_pair(trimmed, separator).ok_or_else(|| AgentError::MalformedSetting {
            path: path.to_path_buf(),
            line: trimmed.to_string(),
        })?;
        pairs.insert(key.to_string(), value.to_string());
    }

    Ok(pairs)
}

/// Write `entries` sorted by key, one `key<sep>value` per line. Parent
/// directories are created as needed.
pub fn write_settings<K, V, I>(path: &Path, entries: I, separator: char) -> Result<()>
where
    K: AsRef<str>,
    V: Display,
    I: IntoIterator<Item = (K, V)>,
{
    let mut lines: Vec<(String, String)> = entries
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.to_string()))
        .collect();
    lines.sort();

    let mut out = String::new();
    for (k, v) in lines {
        out.push_str(&k);
        out.push(separator);
        out.push_str(&v);
        out.push('\n');
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// SHA-256 of a file's content, `None` when it does not exist.
pub fn fingerprint(path: &Path) -> Result<Option<String>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(hex::encode(Sha256::digest(&bytes)))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn split_pair(line: &str, separator: char) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(separator)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}
