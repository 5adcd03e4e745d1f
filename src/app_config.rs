use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::procfile::Procfile;

/// Deployment manifest of one app checkout: its Procfile plus the optional
/// `app.json` metadata.
#[derive(Debug, Clone)]
pub struct AppConfig {
    app_dir: PathBuf,
    procfile_path: PathBuf,
    procfile: Procfile,
    app_json: Option<serde_json::Value>,
}

impl AppConfig {
    pub fn from_dir(app_dir: &Path) -> Result<Self> {
        let src_dir = app_dir.join("src");
        let procfile_path =
            find_file(&src_dir, "Procfile").ok_or_else(|| AgentError::ProcfileNotFound(app_dir.to_path_buf()))?;
        debug!("Using Procfile {:?}", procfile_path);
        let procfile = Procfile::from_file(&procfile_path)?;

        let app_json = match find_file(&src_dir, "app.json") {
            Some(path) => {
                let text = std::fs::read_to_string(&path)?;
                let value = serde_json::from_str(&text)
                    .map_err(|e| AgentError::Other(format!("Failed to parse {:?}: {}", path, e)))?;
                Some(value)
            }
            None => None,
        };

        Ok(Self {
            app_dir: app_dir.to_path_buf(),
            procfile_path,
            procfile,
            app_json,
        })
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn src_dir(&self) -> PathBuf {
        self.app_dir.join("src")
    }

    pub fn procfile_path(&self) -> &Path {
        &self.procfile_path
    }

    pub fn procfile(&self) -> &Procfile {
        &self.procfile
    }

    pub fn workers(&self) -> &IndexMap<String, String> {
        self.procfile.workers()
    }

    pub fn web_workers(&self) -> IndexMap<String, String> {
        self.procfile.web_workers()
    }

    pub fn get_worker(&self, kind: &str) -> &str {
        self.procfile.get(kind).unwrap_or("")
    }

    pub fn pre_build(&self) -> &str {
        self.get_worker("prebuild")
    }

    pub fn post_build(&self) -> &str {
        self.get_worker("postbuild")
    }

    pub fn pre_run(&self) -> &str {
        self.get_worker("prerun")
    }

    pub fn app_json(&self) -> Option<&serde_json::Value> {
        self.app_json.as_ref()
    }
}

/// `src/hop3/<name>` wins over `src/<name>`.
fn find_file(src_dir: &Path, name: &str) -> Option<PathBuf> {
    [src_dir.join("hop3").join(name), src_dir.join(name)]
        .into_iter()
        .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn app_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src").join("hop3")).unwrap();
        dir
    }

    #[test]
    fn hop3_subdirectory_wins() {
        let dir = app_dir();
        std::fs::write(dir.path().join("src/Procfile"), "web: root.sh\n").unwrap();
        std::fs::write(dir.path().join("src/hop3/Procfile"), "web: nested.sh\nprebuild: make\n").unwrap();

        let config = AppConfig::from_dir(dir.path()).unwrap();
        assert_eq!(config.get_worker("web"), "nested.sh");
        assert_eq!(config.pre_build(), "make");
        assert_eq!(config.post_build(), "");
        assert_eq!(config.pre_run(), "");
    }

    #[test]
    fn missing_procfile_is_fatal() {
        let dir = app_dir();
        let err = AppConfig::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, AgentError::ProcfileNotFound(_)));
    }

    #[test]
    fn reads_app_json_when_present() {
        let dir = app_dir();
        std::fs::write(dir.path().join("src/Procfile"), "worker: run.sh\n").unwrap();
        std::fs::write(dir.path().join("src/app.json"), r#"{"name": "blog"}"#).unwrap();

        let config = AppConfig::from_dir(dir.path()).unwrap();
        assert_eq!(config.app_json().unwrap()["name"], "blog");
        assert!(config.web_workers().is_empty());
    }
}
