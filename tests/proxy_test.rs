use indexmap::IndexMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use hop3_agent::app::Application;
use hop3_agent::config::AgentConfig;
use hop3_agent::env::Env;
use hop3_agent::launcher::AppLauncher;
use hop3_agent::process::mock::MockRunner;
use hop3_agent::proxy::{CertificatePaths, NginxProxy, ReverseProxy, SelfSignedCertificates};
use hop3_agent::state::AgentState;
use hop3_agent::store::AppStore;

fn setup(root: &Path) -> (AgentConfig, Arc<MockRunner>, NginxProxy) {
    let config = AgentConfig::new(root.to_path_buf(), "hop3");
    config.ensure_root_dirs().unwrap();
    let runner = Arc::new(MockRunner::permissive());
    let certs = Arc::new(SelfSignedCertificates::new(&config.nginx_root, runner.clone(), Duration::from_secs(5)));
    let proxy = NginxProxy::new(&config, certs);
    (config, runner, proxy)
}

fn workers(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[tokio::test]
async fn test_wsgi_app_goes_through_the_socket() {
    let dir = TempDir::new().unwrap();
    let (config, runner, proxy) = setup(dir.path());
    let app = Application::new(&config, "blog").unwrap();
    let mut env = Env::from_pairs([
        ("NGINX_SERVER_NAME", "blog.example.com,www.blog.example.com"),
        ("BIND_ADDRESS", "127.0.0.1"),
        ("PORT", "8000"),
    ]);

    let conf = proxy.setup(&app, &mut env, &workers(&[("wsgi", "app:app")])).await.unwrap();

    let sock = format!("unix://{}", config.nginx_root.join("blog.sock").display());
    assert_eq!(env.get("NGINX_SERVER_NAME"), Some("blog.example.com www.blog.example.com"));
    assert_eq!(env.get("NGINX_SOCKET"), Some(sock.as_str()));
    assert_eq!(env.get("BIND_ADDRESS"), Some(sock.as_str()));
    assert_eq!(env.get("PORT"), None);

    let text = std::fs::read_to_string(&conf).unwrap();
    assert_eq!(conf, proxy.conf_path("blog"));
    assert!(text.contains("server_name blog.example.com www.blog.example.com;"));
    assert!(text.contains(&format!("uwsgi_pass {};", sock)));
    assert!(text.contains("location ~ /\\.git { deny all; }"));
    assert!(runner.ran("CN=blog.example.com"));
}

#[tokio::test]
async fn test_web_app_is_proxied_over_tcp() {
    let dir = TempDir::new().unwrap();
    let (config, _runner, proxy) = setup(dir.path());
    let app = Application::new(&config, "blog").unwrap();
    let mut env = Env::from_pairs([
        ("NGINX_SERVER_NAME", "blog.example.com"),
        ("BIND_ADDRESS", "127.0.0.1"),
        ("PORT", "8000"),
        ("NGINX_HTTPS_ONLY", "true"),
        ("NGINX_IPV6_ADDRESS", "[::]"),
    ]);

    let conf = proxy.setup(&app, &mut env, &workers(&[("web", "./serve")])).await.unwrap();

    let text = std::fs::read_to_string(conf).unwrap();
    assert_eq!(env.get("NGINX_SOCKET"), Some("127.0.0.1:8000"));
    assert!(text.contains("proxy_pass http://127.0.0.1:8000;"));
    assert!(text.contains("return 301 https://$server_name$request_uri;"));
    assert!(text.contains("listen [::]:443 ssl;"));
}

#[tokio::test]
async fn test_web_app_without_port_fails() {
    let dir = TempDir::new().unwrap();
    let (config, _runner, proxy) = setup(dir.path());
    let app = Application::new(&config, "blog").unwrap();
    let mut env = Env::from_pairs([("NGINX_SERVER_NAME", "blog.example.com")]);

    assert!(proxy.setup(&app, &mut env, &workers(&[("web", "./serve")])).await.is_err());
}

#[tokio::test]
async fn test_existing_certificate_is_reused() {
    let dir = TempDir::new().unwrap();
    let (config, runner, proxy) = setup(dir.path());
    let paths = CertificatePaths::for_app(&config.nginx_root, "blog");
    std::fs::write(&paths.key, "key").unwrap();
    std::fs::write(&paths.crt, "crt").unwrap();
    assert!(paths.usable());

    let app = Application::new(&config, "blog").unwrap();
    let mut env = Env::from_pairs([("NGINX_SERVER_NAME", "blog.example.com")]);
    proxy.setup(&app, &mut env, &workers(&[("static", "public")])).await.unwrap();

    assert!(!runner.ran("openssl"));
    let text = std::fs::read_to_string(proxy.conf_path("blog")).unwrap();
    assert!(text.contains(&format!("root {};", app.src_path().join("public").display())));
}

#[tokio::test]
async fn test_launcher_sets_up_proxy_before_workers() {
    let dir = TempDir::new().unwrap();
    let mut config = AgentConfig::new(dir.path().to_path_buf(), "hop3");
    config.lock_wait = Duration::from_millis(200);
    config.ensure_root_dirs().unwrap();
    let state = AgentState::with_runner(config, Arc::new(MockRunner::permissive()), AppStore::open_in_memory().unwrap());

    let app = state.app("blog").unwrap();
    app.create().unwrap();
    std::fs::write(app.src_path().join("Procfile"), "wsgi: app:app\n").unwrap();
    std::fs::write(app.env_file(), "NGINX_SERVER_NAME=blog.example.com\n").unwrap();

    AppLauncher::new(&state, &app, IndexMap::new()).unwrap().spawn_app().await.unwrap();

    assert!(state.config.nginx_root.join("blog.conf").exists());
    let ini = std::fs::read_to_string(state.config.uwsgi_enabled.join("blog_wsgi.1.ini")).unwrap();
    let sock = state.config.nginx_root.join("blog.sock");
    assert!(ini.contains(&format!("socket = {}\n", sock.display())));
    assert!(!ini.contains("http = "));
    assert!(!ini.contains("NGINX_ACL"));
    let live = std::fs::read_to_string(app.live_env_path()).unwrap();
    assert!(live.contains("NGINX_SOCKET=unix://"));
}
