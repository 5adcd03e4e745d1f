use anyhow::Context;
use clap::Parser;
use indexmap::IndexMap;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use hop3_agent::app::{list_apps, sanitize_name, Application, StopOutcome};
use hop3_agent::config::{AgentConfig, CliArgs, Command};
use hop3_agent::diagnostics::DeployReport;
use hop3_agent::error::AgentError;
use hop3_agent::git::{parse_ref_updates, GitManager};
use hop3_agent::state::AgentState;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let default_filter = if args.verbose { "hop3_agent=debug" } else { "hop3_agent=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        let code = e.downcast_ref::<AgentError>().map(AgentError::exit_code).unwrap_or(1);
        error!("{:#}", e);
        std::process::exit(code);
    }
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let config = AgentConfig::from_args(&args);

    if let Command::Setup = args.command {
        config.ensure_root_dirs().context("Failed to create root directories")?;
        info!("Root layout ready under {:?}", config.hop3_root);
        return Ok(());
    }

    let state = AgentState::new(config)?;

    match args.command {
        Command::Setup => {}
        Command::Apps => {
            let apps = list_apps(&state.config)?;
            if apps.is_empty() {
                println!("There are no applications deployed.");
            }
            for app in apps {
                let marker = if app.is_running(&state)? { "*" } else { " " };
                println!("{} {}", marker, app.name());
            }
        }
        Command::Create { app } => {
            let app = state.app(&app)?;
            app.create()?;
            state.store.ensure_app(app.name())?;
            info!("Created app '{}'", app.name());
        }
        Command::Deploy { app, json } => {
            let app = state.app(&app)?;
            let mut report = DeployReport::new(app.name(), None);
            let result = app.deploy_into(&state, &mut report, &IndexMap::new()).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report).context("Failed to encode deploy report")?);
            }
            result?;
        }
        Command::Destroy { app } => {
            let app = state.app(&app)?;
            app.destroy(&state).await?;
        }
        Command::Start { app } => {
            let app = state.app(&app)?;
            let outcome = app.start(&state).await?;
            info!("Started '{}': {} worker(s) spawned", app.name(), outcome.created.len());
        }
        Command::Stop { app } => {
            let app = state.app(&app)?;
            app.check_exists()?;
            if let StopOutcome::Stopped(n) = app.stop(&state).await? {
                info!("Stopped '{}': {} worker(s) disabled", app.name(), n);
            }
        }
        Command::Restart { app } => {
            let app = state.app(&app)?;
            app.restart(&state).await?;
        }
        Command::Ps { app } => {
            let app = state.app(&app)?;
            app.check_exists()?;
            let scaling = app.scaling()?;
            if scaling.is_empty() {
                warn!("No workers found for app '{}'", app.name());
            }
            for (kind, count) in scaling {
                println!("{}:{}", kind, count);
            }
        }
        Command::PsScale { app, settings } => {
            let app = state.app(&app)?;
            app.scale(&state, &settings).await?;
        }
        Command::Config { app } => {
            let app = state.app(&app)?;
            app.check_exists()?;
            for (key, value) in app.runtime_env(&state)?.iter() {
                println!("{}={}", key, value);
            }
        }
        Command::ConfigGet { app, setting } => {
            let app = state.app(&app)?;
            app.check_exists()?;
            if let Some(value) = app.runtime_env(&state)?.get(&setting) {
                println!("{}", value);
            }
        }
        Command::ConfigSet { app, settings } => {
            let app = state.app(&app)?;
            app.set_config(&state, &settings).await?;
        }
        Command::ConfigUnset { app, settings } => {
            let app = state.app(&app)?;
            app.unset_config(&state, &settings).await?;
        }
        Command::Logs { app, process, lines } => {
            let app = state.app(&app)?;
            app.check_exists()?;
            tail_logs(&app, &process, lines)?;
        }
        Command::GitHook { app } => {
            let app = state.app(&app)?;
            GitManager::new(&state, &app).clone().await?;

            let mut input = String::new();
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .context("Failed to read ref updates")?;
            for update in parse_ref_updates(&input)? {
                info!("Received {} at {}", update.refname, update.newrev);
                app.deploy(&state, &IndexMap::new(), Some(&update.newrev)).await?;
            }
        }
        Command::GitReceivePack { app } => {
            let app = state.app(&sanitize_name(&app))?;
            let git = GitManager::new(&state, &app);
            git.setup_hook().await?;
            git.receive_pack().await?;
        }
        Command::GitUploadPack { app } => {
            let app = state.app(&sanitize_name(&app))?;
            app.check_exists()?;
            GitManager::new(&state, &app).upload_pack().await?;
        }
    }

    Ok(())
}

fn tail_logs(app: &Application, process: &str, lines: usize) -> anyhow::Result<()> {
    let files = app.log_files(process)?;
    if files.is_empty() {
        warn!("No logs found for app '{}'", app.name());
        return Ok(());
    }
    for file in files {
        let text = std::fs::read_to_string(&file).with_context(|| format!("Failed to read {:?}", file))?;
        let all: Vec<&str> = text.lines().collect();
        let start = all.len().saturating_sub(lines);
        println!("==> {} <==", file.display());
        for line in &all[start..] {
            println!("{}", line);
        }
    }
    Ok(())
}
