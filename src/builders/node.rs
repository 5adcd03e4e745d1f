use async_trait::async_trait;
use tracing::info;

use super::{BuildContext, Builder};
use crate::env::Env;
use crate::error::{AgentError, Result};
use crate::log_capture::LogSource;
use crate::process::CommandSpec;

/// npm install, with an optional pinned node version through nodeenv.
pub struct NodeBuilder;

impl NodeBuilder {
    fn make_env(&self, ctx: &BuildContext<'_>) -> Result<Env> {
        let node_modules = ctx.src_path.join("node_modules");
        let mut defaults = Env::new();
        defaults.set("VIRTUAL_ENV", ctx.venv_path.display());
        defaults.set("NODE_PATH", node_modules.display());
        defaults.set("NPM_CONFIG_PREFIX", ctx.src_path.display());
        defaults.set("PATH", ctx.path_with(&[node_modules.join(".bin")]));
        ctx.env_with(defaults)
    }

    async fn installed_version(&self, ctx: &BuildContext<'_>, env: &Env) -> Result<String> {
        let node = ctx.venv_path.join("bin").join("node");
        if !node.exists() {
            return Ok(String::new());
        }
        let spec = CommandSpec::new(node.display().to_string())
            .arg("-v")
            .env(env)
            .timeout(ctx.timeout)
            .source(LogSource::Build);
        let output = ctx.runner.run(&spec).await?;
        Ok(output.stdout.trim_end().to_string())
    }

    async fn install_node(&self, ctx: &BuildContext<'_>, env: &Env) -> Result<()> {
        let Some(version) = env.get("NODE_VERSION") else {
            return Ok(());
        };
        if !ctx.runner.has_binary("nodeenv") {
            return Ok(());
        }

        let installed = self.installed_version(ctx, env).await?;
        if installed.ends_with(version) {
            info!("Node is installed at {}.", version);
            return Ok(());
        }
        if !installed.is_empty() && ctx.is_running() {
            return Err(AgentError::AppRunning);
        }

        info!("Installing node version '{}' using nodeenv", version);
        let command = format!(
            "nodeenv --prebuilt --node={} --clean-src --force {}",
            version,
            ctx.venv_path.display()
        );
        ctx.shell_in(&ctx.venv_path, &command, env).await?;
        Ok(())
    }
}

#[async_trait]
impl Builder for NodeBuilder {
    fn name(&self) -> &'static str {
        "Node"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["node", "npm"]
    }

    fn accept(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.check_exists(&["package.json"])
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<()> {
        ctx.ensure_venv()?;
        let env = self.make_env(ctx)?;

        self.install_node(ctx, &env).await?;

        info!("Installing node modules for '{}'", ctx.app_name);
        let command = format!(
            "npm install --prefix {} --package-lock=false",
            ctx.src_path.display()
        );
        ctx.shell(&command, &env).await?;
        Ok(())
    }
}
