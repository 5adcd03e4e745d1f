use indexmap::IndexMap;
use proptest::prelude::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use hop3_agent::app::{list_apps, Application, StopOutcome};
use hop3_agent::config::AgentConfig;
use hop3_agent::error::AgentError;
use hop3_agent::process::mock::MockRunner;
use hop3_agent::state::AgentState;
use hop3_agent::store::{AppStore, RunState};

fn test_state(root: &Path) -> AgentState {
    let mut config = AgentConfig::new(root.to_path_buf(), "hop3");
    config.lock_wait = Duration::from_millis(200);
    config.ensure_root_dirs().unwrap();
    AgentState::with_runner(config, Arc::new(MockRunner::permissive()), AppStore::open_in_memory().unwrap())
}

fn generic_app(state: &AgentState) -> Application {
    let app = state.app("blog").unwrap();
    app.create().unwrap();
    std::fs::write(app.src_path().join("Procfile"), "web: ./serve\nrelease: ./migrate\n").unwrap();
    app
}

fn enabled_count(state: &AgentState) -> usize {
    std::fs::read_dir(&state.config.uwsgi_enabled).unwrap().count()
}

/// Lay down every artifact an app can own.
fn populate(state: &AgentState, app: &Application) {
    let config = &state.config;
    std::fs::create_dir_all(app.virtualenv_path().join("bin")).unwrap();
    std::fs::write(app.data_path().join("db.sqlite"), "precious").unwrap();
    std::fs::write(app.log_path().join("web.1.log"), "GET /").unwrap();
    std::fs::write(app.repo_path().join("HEAD"), "ref: refs/heads/main").unwrap();
    std::fs::write(app.env_file(), "A=1\n").unwrap();
    for dir in [&config.uwsgi_available, &config.uwsgi_enabled] {
        std::fs::write(dir.join("blog_web.1.ini"), "[uwsgi]\n").unwrap();
    }
    for ext in ["conf", "sock", "key", "crt"] {
        std::fs::write(config.nginx_root.join(format!("blog.{}", ext)), "x").unwrap();
    }
}

#[tokio::test]
async fn test_destroy_keeps_only_data() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path());
    let app = generic_app(&state);
    populate(&state, &app);

    let challenge = dir.path().join("challenges-blog");
    std::fs::create_dir_all(&challenge).unwrap();
    std::os::unix::fs::symlink(&challenge, state.config.acme_www.join("blog")).unwrap();
    state.store.set_run_state("blog", RunState::Running).unwrap();

    app.destroy(&state).await.unwrap();

    let left: Vec<String> = std::fs::read_dir(app.app_path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(left, vec!["data"]);
    assert_eq!(std::fs::read_to_string(app.data_path().join("db.sqlite")).unwrap(), "precious");
    assert_eq!(enabled_count(&state), 0);
    assert!(!state.config.uwsgi_available.join("blog_web.1.ini").exists());
    assert!(!state.config.nginx_root.join("blog.conf").exists());
    assert!(!state.config.acme_www.join("blog").exists());
    assert!(!challenge.exists());
    assert!(state.store.list_apps().unwrap().is_empty());
}

#[tokio::test]
async fn test_destroy_leaves_other_apps_alone() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path());
    let app = generic_app(&state);
    populate(&state, &app);
    std::fs::write(state.config.uwsgi_enabled.join("blogger_web.1.ini"), "[uwsgi]\n").unwrap();

    app.destroy(&state).await.unwrap();

    assert!(state.config.uwsgi_enabled.join("blogger_web.1.ini").exists());
}

proptest! {
    #[test]
    fn test_destroy_never_removes_data(
        repo in any::<bool>(), venv in any::<bool>(), log in any::<bool>(), src in any::<bool>()
    ) {
        let dir = TempDir::new().unwrap();
        let state = test_state(dir.path());
        let app = state.app("blog").unwrap();
        std::fs::create_dir_all(app.data_path()).unwrap();
        std::fs::write(app.data_path().join("keep"), "1").unwrap();
        for (present, path) in [(repo, app.repo_path()), (venv, app.virtualenv_path()), (log, app.log_path()), (src, app.src_path())] {
            if present {
                std::fs::create_dir_all(&path).unwrap();
            }
        }

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(app.destroy(&state)).unwrap();

        prop_assert!(app.data_path().join("keep").exists());
        prop_assert!(!app.src_path().exists());
    }
}

#[tokio::test]
async fn test_stop_then_start() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path());
    let app = generic_app(&state);

    app.deploy(&state, &IndexMap::new(), None).await.unwrap();
    assert!(app.is_running(&state).unwrap());
    assert_eq!(enabled_count(&state), 1);

    assert_eq!(app.stop(&state).await.unwrap(), StopOutcome::Stopped(1));
    assert_eq!(enabled_count(&state), 0);
    assert!(!app.is_running(&state).unwrap());

    assert_eq!(app.stop(&state).await.unwrap(), StopOutcome::NotRunning);

    let outcome = app.start(&state).await.unwrap();
    assert_eq!(outcome.created, vec!["web.1"]);
    assert!(app.is_running(&state).unwrap());
}

#[tokio::test]
async fn test_restart_recreates_workers() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path());
    let app = generic_app(&state);
    app.deploy(&state, &IndexMap::new(), None).await.unwrap();

    let outcome = app.restart(&state).await.unwrap();

    assert_eq!(outcome.created, vec!["web.1"]);
    assert_eq!(enabled_count(&state), 1);
}

#[tokio::test]
async fn test_start_unknown_app() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path());
    let app = state.app("ghost").unwrap();

    assert!(matches!(app.start(&state).await, Err(AgentError::AppNotFound(_))));
}

#[tokio::test]
async fn test_restart_unknown_app_leaves_no_record() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path());
    let app = state.app("ghost").unwrap();

    assert!(matches!(app.restart(&state).await, Err(AgentError::AppNotFound(_))));
    assert!(state.store.list_apps().unwrap().is_empty());
    assert!(!app.app_path().exists());
}

#[tokio::test]
async fn test_scale_redeploys_with_new_count() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path());
    let app = generic_app(&state);
    app.deploy(&state, &IndexMap::new(), None).await.unwrap();

    app.scale(&state, &["web=3".to_string()]).await.unwrap();

    assert_eq!(std::fs::read_to_string(app.scaling_path()).unwrap(), "web:3\n");
    assert_eq!(enabled_count(&state), 3);
}

#[tokio::test]
async fn test_config_set_and_unset_redeploy() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path());
    let app = generic_app(&state);
    app.deploy(&state, &IndexMap::new(), None).await.unwrap();

    app.set_config(&state, &["GREETING=hello".to_string(), "PORT=9000".to_string()])
        .await
        .unwrap();
    assert_eq!(app.runtime_env(&state).unwrap().get("GREETING"), Some("hello"));
    let live = std::fs::read_to_string(app.live_env_path()).unwrap();
    assert!(live.contains("GREETING=hello\n"));
    assert_eq!(state.store.port("blog").unwrap(), Some(9000));

    app.unset_config(&state, &["GREETING".to_string()]).await.unwrap();
    assert_eq!(app.runtime_env(&state).unwrap().get("GREETING"), None);
    let live = std::fs::read_to_string(app.live_env_path()).unwrap();
    assert!(!live.contains("GREETING"));
}

#[tokio::test]
async fn test_config_set_rejects_bare_keys() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path());
    let app = generic_app(&state);

    let err = app.set_config(&state, &["GREETING".to_string()]).await.unwrap_err();
    assert!(matches!(err, AgentError::MalformedScaleSetting(_)));
}

#[tokio::test]
async fn test_locked_app_fails_fast() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path());
    let app = generic_app(&state);

    let _held = state.lock("blog").await.unwrap();
    let err = app.stop(&state).await.unwrap_err();

    assert!(matches!(err, AgentError::AppLocked(name) if name == "blog"));
}

#[test]
fn test_list_apps_skips_files() {
    let dir = TempDir::new().unwrap();
    let state = test_state(dir.path());
    for name in ["zeta", "alpha"] {
        state.app(name).unwrap().create().unwrap();
    }
    std::fs::write(state.config.apps_root.join("README"), "").unwrap();

    let names: Vec<String> = list_apps(&state.config)
        .unwrap()
        .iter()
        .map(|a| a.name().to_string())
        .collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
}
