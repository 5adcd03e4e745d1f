use async_trait::async_trait;
use tracing::info;

use super::{BuildContext, Builder};
use crate::env::Env;
use crate::error::Result;

pub struct GoBuilder;

#[async_trait]
impl Builder for GoBuilder {
    fn name(&self) -> &'static str {
        "Go"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["go"]
    }

    fn accept(&self, ctx: &BuildContext<'_>) -> bool {
        if ctx.check_exists(&["Godeps"]) {
            return true;
        }
        let pattern = format!(
            "{}/*.go",
            glob::Pattern::escape(&ctx.src_path.display().to_string())
        );
        glob::glob(&pattern)
            .map(|mut paths| paths.any(|p| p.is_ok()))
            .unwrap_or(false)
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<()> {
        ctx.ensure_venv()?;
        let mut defaults = Env::new();
        defaults.set("GOPATH", ctx.venv_path.display());
        defaults.set("GOBIN", ctx.venv_path.join("bin").display());
        defaults.set("PATH", ctx.path_with(&[]));
        let env = ctx.env_with(defaults)?;

        info!("Building Go application '{}'", ctx.app_name);
        let output = ctx.venv_path.join("bin").join(&ctx.app_name);
        ctx.shell(&format!("go build -o {} .", output.display()), &env).await?;
        Ok(())
    }
}
