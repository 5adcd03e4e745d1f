use async_trait::async_trait;
use tracing::info;

use super::{BuildContext, Builder};
use crate::env::Env;
use crate::error::Result;

pub struct RustBuilder;

#[async_trait]
impl Builder for RustBuilder {
    fn name(&self) -> &'static str {
        "Rust"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["cargo"]
    }

    fn accept(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.check_exists(&["Cargo.toml"])
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<()> {
        let mut defaults = Env::new();
        defaults.set("CARGO_TARGET_DIR", ctx.src_path.join("target").display());
        defaults.set("PATH", ctx.path_with(&[]));
        let env = ctx.env_with(defaults)?;

        info!("Compiling Rust project '{}'", ctx.app_name);
        ctx.shell("cargo build --release", &env).await?;
        Ok(())
    }
}
