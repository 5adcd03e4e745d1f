use async_trait::async_trait;
use tracing::info;

use super::{BuildContext, Builder};
use crate::env::Env;
use crate::error::Result;

pub struct PhpBuilder;

#[async_trait]
impl Builder for PhpBuilder {
    fn name(&self) -> &'static str {
        "PHP"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["composer"]
    }

    fn accept(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.check_exists(&["composer.json"])
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<()> {
        let mut defaults = Env::new();
        defaults.set("COMPOSER_HOME", ctx.venv_path.join("composer").display());
        defaults.set("PATH", ctx.path_with(&[]));
        let env = ctx.env_with(defaults)?;

        info!("Installing PHP dependencies for '{}'", ctx.app_name);
        ctx.shell("composer install", &env).await?;
        Ok(())
    }
}
