use std::fmt::Display;
use std::path::Path;

use crate::error::Result;

/// Ordered multimap of uWSGI directives. Keys may repeat (`env`, `plugin`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UwsgiSettings {
    values: Vec<(String, String)>,
}

impl UwsgiSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Display) {
        self.values.push((key.into(), value.to_string()));
    }

    pub fn extend<K, V, I>(&mut self, items: I)
    where
        K: Into<String>,
        V: Display,
        I: IntoIterator<Item = (K, V)>,
    {
        for (k, v) in items {
            self.add(k, v);
        }
    }

    /// Every value recorded under `key`, in insertion order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `[uwsgi]` section with one `key = value` line per directive, sorted
    /// by key then value so identical input renders identical bytes.
    pub fn render(&self) -> String {
        let mut sorted = self.values.clone();
        sorted.sort();

        let mut out = String::from("[uwsgi]\n");
        for (k, v) in sorted {
            out.push_str(&k);
            out.push_str(" = ");
            out.push_str(&v);
            out.push('\n');
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_sorts_by_key_then_value() {
        let mut settings = UwsgiSettings::new();
        settings.add("plugin", "python3");
        settings.add("env", "B=2");
        settings.add("env", "A=1");
        settings.add("master", true);

        assert_eq!(
            settings.render(),
            "[uwsgi]\nenv = A=1\nenv = B=2\nmaster = true\nplugin = python3\n"
        );
        assert_eq!(settings.get_all("env"), vec!["B=2", "A=1"]);
    }
}
