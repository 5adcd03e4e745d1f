use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

use hop3_agent::config::AgentConfig;
use hop3_agent::error::AgentError;
use hop3_agent::git::{parse_ref_updates, GitManager, RefUpdate};
use hop3_agent::process::mock::MockRunner;
use hop3_agent::process::{CommandRunner, ShellRunner};
use hop3_agent::state::AgentState;
use hop3_agent::store::AppStore;

fn test_state(root: &Path, runner: Arc<MockRunner>) -> AgentState {
    let mut config = AgentConfig::new(root.to_path_buf(), "hop3");
    config.agent_bin = "/usr/local/bin/hop3-agent".into();
    config.ensure_root_dirs().unwrap();
    AgentState::with_runner(config, runner, AppStore::open_in_memory().unwrap())
}

#[tokio::test]
async fn test_setup_hook_installs_executable_script() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new());
    let state = test_state(dir.path(), runner.clone());
    let app = state.app("blog").unwrap();
    let git = GitManager::new(&state, &app);

    git.setup_hook().await.unwrap();

    let hook = git.hook_path();
    let script = std::fs::read_to_string(&hook).unwrap();
    assert!(script.starts_with("#!/usr/bin/env bash\n"));
    assert!(script.contains(&format!(
        "cat | HOP3_ROOT=\"{}\" /usr/local/bin/hop3-agent git-hook blog",
        dir.path().display()
    )));
    let mode = std::fs::metadata(&hook).unwrap().permissions().mode();
    assert_ne!(mode & 0o100, 0);
    assert!(runner.ran("git init --quiet --bare"));
}

#[tokio::test]
async fn test_setup_hook_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new());
    let state = test_state(dir.path(), runner.clone());
    let app = state.app("blog").unwrap();
    let git = GitManager::new(&state, &app);

    git.setup_hook().await.unwrap();
    git.setup_hook().await.unwrap();

    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn test_clone_creates_the_app() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new());
    let state = test_state(dir.path(), runner.clone());
    let app = state.app("blog").unwrap();

    GitManager::new(&state, &app).clone().await.unwrap();

    assert!(app.data_path().is_dir());
    assert!(app.log_path().is_dir());
    let clone = &runner.command_lines()[0];
    assert!(clone.starts_with("git clone --quiet"));
    assert!(clone.ends_with(&app.src_path().display().to_string()));
}

#[tokio::test]
async fn test_clone_skips_existing_checkout() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new());
    let state = test_state(dir.path(), runner.clone());
    let app = state.app("blog").unwrap();
    std::fs::create_dir_all(app.src_path().join(".git")).unwrap();

    GitManager::new(&state, &app).clone().await.unwrap();

    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_pack_commands_pass_stdio_through() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new());
    let state = test_state(dir.path(), runner.clone());
    let app = state.app("blog").unwrap();
    let git = GitManager::new(&state, &app);

    git.receive_pack().await.unwrap();
    git.upload_pack().await.unwrap();

    let calls = runner.calls();
    assert_eq!(calls[0].program, "git-receive-pack");
    assert_eq!(calls[1].program, "git-upload-pack");
    for call in calls {
        assert!(call.passthrough);
        assert_eq!(call.cwd, Some(app.repo_path()));
    }
}

#[tokio::test]
async fn test_receive_pack_failure_propagates() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(MockRunner::new());
    runner.fail_on("git-receive-pack", 1);
    let state = test_state(dir.path(), runner);
    let app = state.app("blog").unwrap();

    let err = GitManager::new(&state, &app).receive_pack().await.unwrap_err();
    assert!(matches!(err, AgentError::CommandFailed { exit_code: 1, .. }));
}

#[test]
fn test_hook_input_parsing() {
    let updates = parse_ref_updates("0000 1111 refs/heads/main\n").unwrap();
    assert_eq!(
        updates,
        vec![RefUpdate {
            oldrev: "0000".into(),
            newrev: "1111".into(),
            refname: "refs/heads/main".into(),
        }]
    );
    assert!(matches!(
        parse_ref_updates("0000 1111 refs/heads/main extra"),
        Err(AgentError::MalformedRefLine(_))
    ));
}

fn git(cwd: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=Dev", "-c", "user.email=dev@example.com"])
        .args(args)
        .current_dir(cwd)
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

#[tokio::test]
async fn test_push_through_installed_hook_deploys() {
    if !ShellRunner.has_binary("git") {
        return;
    }
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("hop3");
    let mut config = AgentConfig::new(root.clone(), "hop3");
    config.agent_bin = env!("CARGO_BIN_EXE_hop3-agent").into();
    config.ensure_root_dirs().unwrap();
    let state = AgentState::with_runner(config, Arc::new(ShellRunner), AppStore::open_in_memory().unwrap());
    let app = state.app("blog").unwrap();
    GitManager::new(&state, &app).setup_hook().await.unwrap();

    let work = dir.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    std::fs::write(work.join("Procfile"), "web: sleep 600\nrelease: true\n").unwrap();
    git(&work, &["init", "--quiet"]);
    git(&work, &["add", "Procfile"]);
    git(&work, &["commit", "--quiet", "-m", "first"]);
    git(&work, &["push", "--quiet", &app.repo_path().display().to_string(), "HEAD:refs/heads/master"]);

    assert!(app.src_path().join("Procfile").is_file());
    assert!(state.config.uwsgi_enabled.join("blog_web.1.ini").is_file());
}
