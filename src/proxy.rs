//! Reverse-proxy collaborator: turns an app's env and workers into an nginx
//! server block, and keeps a TLS key/cert pair next to it.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::app::Application;
use crate::config::{AgentConfig, WEB_WORKER_KINDS, WSGI_WORKER_KINDS};
use crate::env::Env;
use crate::error::{AgentError, Result};
use crate::process::{run_checked, CommandRunner, CommandSpec};

#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Write `{app}.conf`. May rewrite `NGINX_SERVER_NAME`, `NGINX_SOCKET`,
    /// `BIND_ADDRESS` and `PORT` in `env` for the worker generator.
    async fn setup(
        &self,
        app: &Application,
        env: &mut Env,
        workers: &IndexMap<String, String>,
    ) -> Result<PathBuf>;
}

#[async_trait]
pub trait CertificateManager: Send + Sync {
    /// Ensure `{app}.key` and `{app}.crt` exist and are non-empty.
    async fn ensure_certificate(
        &self,
        app_name: &str,
        domains: &[String],
    ) -> Result<CertificatePaths>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub key: PathBuf,
    pub crt: PathBuf,
}

impl CertificatePaths {
    pub fn for_app(nginx_root: &Path, app_name: &str) -> Self {
        Self {
            key: nginx_root.join(format!("{}.key", app_name)),
            crt: nginx_root.join(format!("{}.crt", app_name)),
        }
    }

    /// Both files exist and the certificate is not empty.
    pub fn usable(&self) -> bool {
        self.key.exists()
            && std::fs::metadata(&self.crt)
                .map(|m| m.len() > 0)
                .unwrap_or(false)
    }
}

/// Issues a self-signed certificate with `openssl` when none is usable.
pub struct SelfSignedCertificates {
    nginx_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl SelfSignedCertificates {
    pub fn new(nginx_root: &Path, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            nginx_root: nginx_root.to_path_buf(),
            runner,
            timeout,
        }
    }
}

#[async_trait]
impl CertificateManager for SelfSignedCertificates {
    async fn ensure_certificate(
        &self,
        app_name: &str,
        domains: &[String],
    ) -> Result<CertificatePaths> {
        let paths = CertificatePaths::for_app(&self.nginx_root, app_name);
        if paths.usable() {
            return Ok(paths);
        }

        let domain = domains
            .first()
            .ok_or_else(|| AgentError::Other(format!("No server name for '{}'", app_name)))?;
        std::fs::create_dir_all(&self.nginx_root)?;

        info!("Generating self-signed certificate for {}", domain);
        let spec = CommandSpec::new("openssl")
            .args(["req", "-new", "-newkey", "rsa:4096", "-days", "365", "-nodes", "-x509", "-subj"])
            .arg(format!("/C=FR/ST=NA/L=Paris/O=Hop3/OU=Self-Signed/CN={}", domain))
            .arg("-keyout")
            .arg(paths.key.display().to_string())
            .arg("-out")
            .arg(paths.crt.display().to_string())
            .timeout(self.timeout);
        run_checked(self.runner.as_ref(), &spec).await?;

        Ok(paths)
    }
}

fn has_backend(workers: &IndexMap<String, String>) -> bool {
    workers.keys().any(|k| WEB_WORKER_KINDS.contains(&k.as_str()))
}

/// Renders `nginx_root/{app}.conf`.
pub struct NginxProxy {
    nginx_root: PathBuf,
    acme_www: PathBuf,
    certificates: Arc<dyn CertificateManager>,
}

impl NginxProxy {
    pub fn new(config: &AgentConfig, certificates: Arc<dyn CertificateManager>) -> Self {
        Self {
            nginx_root: config.nginx_root.clone(),
            acme_www: config.acme_www.clone(),
            certificates,
        }
    }

    pub fn conf_path(&self, app_name: &str) -> PathBuf {
        self.nginx_root.join(format!("{}.conf", app_name))
    }

    fn socket_path(&self, app_name: &str) -> PathBuf {
        self.nginx_root.join(format!("{}.sock", app_name))
    }

    /// Point the proxy at the app: a Unix socket for wsgi-family workers,
    /// `BIND_ADDRESS:PORT` otherwise. Static-only apps have no backend.
    fn setup_backend(
        &self,
        app_name: &str,
        env: &mut Env,
        workers: &IndexMap<String, String>,
    ) -> Result<String> {
        if !has_backend(workers) {
            return Ok(String::new());
        }
        let uses_socket = WSGI_WORKER_KINDS.iter().any(|k| workers.contains_key(*k));
        if uses_socket {
            let sock = format!("unix://{}", self.socket_path(app_name).display());
            env.set("NGINX_SOCKET", &sock);
            env.set("BIND_ADDRESS", &sock);
            env.remove("PORT");
            info!("nginx will talk to app '{}' via {}", app_name, sock);
            Ok(format!("uwsgi_pass {};\n        include uwsgi_params;", sock))
        } else {
            let address = env.get_or("BIND_ADDRESS", "127.0.0.1").to_string();
            let port = env
                .get("PORT")
                .ok_or_else(|| AgentError::Other(format!("No PORT for app '{}'", app_name)))?
                .to_string();
            let backend = format!("{}:{}", address, port);
            env.set("NGINX_SOCKET", &backend);
            info!("nginx will look for app '{}' on {}", app_name, backend);
            Ok(format!("proxy_pass http://{};", backend))
        }
    }

    fn render(
        &self,
        app: &Application,
        env: &Env,
        workers: &IndexMap<String, String>,
        backend: &str,
        certs: &CertificatePaths,
    ) -> String {
        let server_name = env.get_or("NGINX_SERVER_NAME", "");
        let ipv4 = env.get_or("NGINX_IPV4_ADDRESS", "0.0.0.0");
        let ipv6 = env.get("NGINX_IPV6_ADDRESS");
        let https_only = env.get_bool("NGINX_HTTPS_ONLY", false);

        let mut listen_http = vec![format!("listen {}:80;", ipv4)];
        let mut listen_https = vec![format!("listen {}:443 ssl;", ipv4)];
        if let Some(ipv6) = ipv6 {
            listen_http.push(format!("listen {}:80;", ipv6));
            listen_https.push(format!("listen {}:443 ssl;", ipv6));
        }

        let mut locations = vec![format!(
            "location ^~ /.well-known/acme-challenge {{\n        allow all;\n        root {};\n    }}",
            self.acme_www.display()
        )];
        if !env.get_bool("NGINX_ALLOW_GIT_FOLDERS", false) {
            locations.push(r"location ~ /\.git { deny all; }".to_string());
        }

        if has_backend(workers) {
            locations.push(format!("location / {{\n        {}\n    }}", backend));
        } else if let Some(static_dir) = workers.get("static") {
            locations.push(format!(
                "location / {{\n        root {};\n    }}",
                app.src_path().join(static_dir.trim_start_matches('/')).display()
            ));
        }

        let mut out = String::new();
        if https_only {
            out.push_str(&format!(
                "server {{\n    {}\n    server_name {};\n    return 301 https://$server_name$request_uri;\n}}\n\n",
                listen_http.join("\n    "),
                server_name
            ));
        } else {
            listen_https.extend(listen_http);
        }

        out.push_str(&format!(
            "server {{\n    {}\n    server_name {};\n    ssl_certificate {};\n    ssl_certificate_key {};\n\n    {}\n}}\n",
            listen_https.join("\n    "),
            server_name,
            certs.crt.display(),
            certs.key.display(),
            locations.join("\n\n    ")
        ));
        out
    }
}

#[async_trait]
impl ReverseProxy for NginxProxy {
    async fn setup(
        &self,
        app: &Application,
        env: &mut Env,
        workers: &IndexMap<String, String>,
    ) -> Result<PathBuf> {
        let names: Vec<String> = env
            .get_or("NGINX_SERVER_NAME", "")
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        env.set("NGINX_SERVER_NAME", names.join(" "));
        env.set("NGINX_ROOT", self.nginx_root.display());
        env.set("ACME_WWW", self.acme_www.display());

        let backend = self.setup_backend(app.name(), env, workers)?;
        let certs = self.certificates.ensure_certificate(app.name(), &names).await?;

        // Cleared here; the worker generator never forwards it.
        env.set("NGINX_ACL", "");

        let buffer = self.render(app, env, workers, &backend, &certs);
        let path = self.conf_path(app.name());
        std::fs::create_dir_all(&self.nginx_root)?;
        std::fs::write(&path, buffer)?;
        info!("nginx will map app '{}' to hostname(s) '{}'", app.name(), names.join(" "));
        Ok(path)
    }
}
