//! The build pipeline: fetch, prebuild, build, postbuild, then hand the app
//! over to the launcher.

use indexmap::IndexMap;
use std::time::Duration;
use tracing::{error, info};

use crate::app::Application;
use crate::app_config::AppConfig;
use crate::builders::{found_app, BuildContext};
use crate::diagnostics::{DeployEventKind, DeployPhase, DeployReport};
use crate::error::{AgentError, Result};
use crate::launcher::AppLauncher;
use crate::log_capture::LogSource;
use crate::process::{run_checked, CommandSpec};
use crate::state::AgentState;

pub struct Deployer<'a> {
    state: &'a AgentState,
    app: &'a Application,
}

impl<'a> Deployer<'a> {
    pub fn new(state: &'a AgentState, app: &'a Application) -> Self {
        Self { state, app }
    }

    /// Run every phase in order, recording them in `report`. The first
    /// failure aborts the deploy; the report keeps the failed phase.
    pub async fn deploy(
        &self,
        report: &mut DeployReport,
        deltas: &IndexMap<String, i64>,
    ) -> Result<()> {
        let newrev = report.newrev.clone();
        match self.run_phases(report, deltas, newrev.as_deref()).await {
            Ok(()) => {
                report.finish();
                info!("Deploy of '{}' done ({})", self.app.name(), report.deploy_id);
                Ok(())
            }
            Err(e) => {
                error!("Deploy of '{}' failed in {:?}: {}", self.app.name(), report.phase, e);
                report.fail(&e.to_string());
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        report: &mut DeployReport,
        deltas: &IndexMap<String, i64>,
        newrev: Option<&str>,
    ) -> Result<()> {
        report.begin(DeployPhase::Fetching);
        let config = self.update(newrev).await?;
        report.complete();

        self.run_hook(report, DeployPhase::Prebuild, config.pre_build()).await?;

        report.begin(DeployPhase::Building);
        self.run_build(&config, report).await?;
        report.complete();

        self.run_hook(report, DeployPhase::Postbuild, config.post_build()).await?;

        report.begin(DeployPhase::Spawning);
        let outcome = AppLauncher::new(self.state, self.app, deltas.clone())?.spawn_app().await?;
        report.emit(DeployEventKind::WorkersChanged {
            created: outcome.created,
            destroyed: outcome.destroyed,
        });
        report.complete();
        Ok(())
    }

    /// Sync the checkout with the bare repo and load its Procfile.
    pub async fn update(&self, newrev: Option<&str>) -> Result<AppConfig> {
        self.app.check_exists()?;
        info!("Deploying app '{}'", self.app.name());

        self.git(&["fetch", "--quiet"]).await?;
        if let Some(rev) = newrev.filter(|r| !r.is_empty()) {
            self.git(&["reset", "--hard", rev]).await?;
        }
        self.git(&["submodule", "init"]).await?;
        self.git(&["submodule", "update"]).await?;

        let config = AppConfig::from_dir(&self.app.app_path())?;
        if config.workers().is_empty() {
            return Err(AgentError::NoWorkersDefined(self.app.name().to_string()));
        }
        Ok(config)
    }

    async fn git(&self, args: &[&str]) -> Result<()> {
        let spec = CommandSpec::git()
            .args(args.iter().copied())
            .cwd(self.app.src_path())
            .timeout(self.state.config.timeouts.git)
            .source(LogSource::Git);
        run_checked(self.state.runner.as_ref(), &spec).await?;
        Ok(())
    }

    async fn shell(&self, command: &str, timeout: Duration, source: LogSource) -> Result<()> {
        let spec = CommandSpec::shell(command)
            .scrub_env("GIT_")
            .cwd(self.app.src_path())
            .timeout(timeout)
            .source(source);
        run_checked(self.state.runner.as_ref(), &spec).await?;
        Ok(())
    }

    /// `prebuild` / `postbuild`. An absent command is skipped.
    async fn run_hook(
        &self,
        report: &mut DeployReport,
        phase: DeployPhase,
        command: &str,
    ) -> Result<()> {
        if command.is_empty() {
            report.skip(phase, "no command in Procfile");
            return Ok(());
        }
        report.begin(phase);
        info!("Running {:?} for '{}'", phase, self.app.name());
        self.shell(command, self.state.config.timeouts.hook, LogSource::Hook).await?;
        report.complete();
        Ok(())
    }

    /// An explicit `build` command wins; otherwise every accepting builder
    /// runs, in registration order.
    pub async fn run_build(&self, config: &AppConfig, report: &mut DeployReport) -> Result<()> {
        let timeout = self.state.config.timeouts.build;
        let build = config.get_worker("build");
        if !build.is_empty() {
            info!("Running build.");
            return self.shell(build, timeout, LogSource::Build).await;
        }

        let runner = self.state.runner.as_ref();
        let ctx = BuildContext::new(self.app, &self.state.config.uwsgi_enabled, runner, timeout);
        let mut detected = false;

        for builder in &self.state.builders {
            if !builder.accept(&ctx) {
                continue;
            }
            let missing: Vec<&str> = builder
                .requirements()
                .iter()
                .copied()
                .filter(|bin| !runner.has_binary(bin))
                .collect();
            if !missing.is_empty() {
                return Err(AgentError::MissingRequirements {
                    builder: builder.name().to_string(),
                    missing: missing.join(", "),
                });
            }

            found_app(builder.name());
            report.builder_detected(builder.name());
            builder.build(&ctx).await?;
            detected = true;
        }

        let workers = config.workers();
        if workers.contains_key("release") && workers.contains_key("web") {
            found_app("Generic");
            detected = true;
        } else if workers.contains_key("static") {
            found_app("Static");
            detected = true;
        }

        if detected {
            Ok(())
        } else {
            Err(AgentError::NoBuilderDetected)
        }
    }
}
