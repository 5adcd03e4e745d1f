use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

use super::{BuildContext, Builder};
use crate::env::Env;
use crate::error::Result;

/// Leiningen (`project.clj`) or Clojure CLI (`deps.edn`) projects.
pub struct ClojureBuilder;

impl ClojureBuilder {
    fn is_leiningen(ctx: &BuildContext<'_>) -> bool {
        ctx.src_path.join("project.clj").exists()
    }
}

/// `$VAR` from the agent's environment, else `$HOME/<fallback>`.
fn home_dir_setting(var: &str, fallback: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(fallback).display().to_string()
    })
}

#[async_trait]
impl Builder for ClojureBuilder {
    fn name(&self) -> &'static str {
        "Clojure"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &[]
    }

    fn accept(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.check_exists(&["project.clj", "deps.edn"])
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<()> {
        ctx.ensure_venv()?;
        std::fs::create_dir_all(ctx.src_path.join("target"))?;

        let leiningen = Self::is_leiningen(ctx);
        let mut defaults = Env::new();
        defaults.set("VIRTUAL_ENV", ctx.venv_path.display());
        defaults.set("PATH", ctx.path_with(&[ctx.src_path.join(".bin")]));
        if leiningen {
            defaults.set("LEIN_HOME", home_dir_setting("LEIN_HOME", ".lein"));
        } else {
            defaults.set("CLJ_CONFIG", home_dir_setting("CLJ_CONFIG", ".clojure"));
        }
        let env = ctx.env_with(defaults)?;

        info!("Building Clojure Application");
        if leiningen {
            ctx.shell("lein clean", &env).await?;
            ctx.shell("lein uberjar", &env).await?;
        } else {
            ctx.shell("clojure -T:build release", &env).await?;
        }
        Ok(())
    }
}
