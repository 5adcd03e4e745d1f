use async_trait::async_trait;
use tracing::info;

use super::{BuildContext, Builder};
use crate::env::Env;
use crate::error::{AgentError, Result};

/// virtualenv + pip, from `requirements.txt` or `pyproject.toml`.
pub struct PythonBuilder;

#[async_trait]
impl Builder for PythonBuilder {
    fn name(&self) -> &'static str {
        "Python"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["python3", "pip", "virtualenv"]
    }

    fn accept(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.check_exists(&["requirements.txt", "pyproject.toml"])
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<()> {
        let mut defaults = Env::new();
        defaults.set("PYTHONUNBUFFERED", "1");
        defaults.set("PYTHONIOENCODING", "UTF_8:replace");
        defaults.set("VIRTUAL_ENV", ctx.venv_path.display());
        defaults.set("PATH", ctx.path_with(&[]));
        let env = ctx.env_with(defaults)?;

        if !ctx.venv_path.join("bin").join("activate").exists() {
            info!("Creating virtualenv for '{}'", ctx.app_name);
            ctx.shell(
                &format!("virtualenv --python=python3 {}", ctx.venv_path.display()),
                &env,
            )
            .await?;
        }

        info!("Installing requirements for '{}'", ctx.app_name);
        let pip = ctx.venv_path.join("bin").join("pip");
        if ctx.src_path.join("requirements.txt").exists() {
            ctx.shell(&format!("{} install -r requirements.txt", pip.display()), &env)
                .await?;
        } else if ctx.src_path.join("pyproject.toml").exists() {
            ctx.shell(&format!("{} install .", pip.display()), &env).await?;
        } else {
            return Err(AgentError::Other(format!(
                "requirements.txt or pyproject.toml not found for '{}'",
                ctx.app_name
            )));
        }

        Ok(())
    }
}
