use async_trait::async_trait;
use tracing::info;

use super::{BuildContext, Builder};
use crate::env::Env;
use crate::error::Result;

pub struct RubyBuilder;

#[async_trait]
impl Builder for RubyBuilder {
    fn name(&self) -> &'static str {
        "Ruby"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["ruby", "gem", "bundle"]
    }

    fn accept(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.check_exists(&["Gemfile"])
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<()> {
        let mut defaults = Env::new();
        defaults.set("VIRTUAL_ENV", ctx.venv_path.display());
        defaults.set("PATH", ctx.path_with(&[ctx.src_path.join(".bin")]));
        let env = ctx.env_with(defaults)?;

        if !ctx.venv_path.exists() {
            info!("Creating gem environment for '{}'", ctx.app_name);
            ctx.ensure_venv()?;
            ctx.shell("bundle config set --local path $VIRTUAL_ENV", &env).await?;
        }

        info!("Installing gems for '{}'", ctx.app_name);
        ctx.shell("bundle install", &env).await?;
        Ok(())
    }
}
