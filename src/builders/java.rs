use async_trait::async_trait;
use tracing::info;

use super::{BuildContext, Builder};
use crate::env::Env;
use crate::error::Result;

/// Maven (`pom.xml`) or Gradle (`build.gradle[.kts]`) projects.
pub struct JavaBuilder;

enum JavaTool {
    Maven,
    Gradle,
}

impl JavaTool {
    fn detect(ctx: &BuildContext<'_>) -> Option<Self> {
        if ctx.check_exists(&["pom.xml"]) {
            Some(JavaTool::Maven)
        } else if ctx.check_exists(&["build.gradle", "build.gradle.kts"]) {
            Some(JavaTool::Gradle)
        } else {
            None
        }
    }

    fn binary(&self) -> &'static str {
        match self {
            JavaTool::Maven => "mvn",
            JavaTool::Gradle => "gradle",
        }
    }

    /// Directory holding the previous build output.
    fn output_dir(&self) -> &'static str {
        match self {
            JavaTool::Maven => "target",
            JavaTool::Gradle => "build",
        }
    }

    fn build_goal(&self) -> &'static str {
        match self {
            JavaTool::Maven => "package",
            JavaTool::Gradle => "build",
        }
    }
}

#[async_trait]
impl Builder for JavaBuilder {
    fn name(&self) -> &'static str {
        "Java"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["java"]
    }

    fn accept(&self, ctx: &BuildContext<'_>) -> bool {
        JavaTool::detect(ctx).is_some()
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<()> {
        let Some(tool) = JavaTool::detect(ctx) else {
            return Ok(());
        };

        ctx.ensure_venv()?;
        let mut defaults = Env::new();
        defaults.set("VIRTUAL_ENV", ctx.venv_path.display());
        defaults.set("PATH", ctx.path_with(&[ctx.src_path.join(".bin")]));
        let env = ctx.env_with(defaults)?;

        if ctx.src_path.join(tool.output_dir()).exists() {
            info!("Removing previous builds");
            ctx.shell(&format!("{} clean", tool.binary()), &env).await?;
        }

        info!("Building Java Application with {}", tool.binary());
        ctx.shell(&format!("{} {}", tool.binary(), tool.build_goal()), &env)
            .await?;
        Ok(())
    }
}
