use std::sync::Arc;

use crate::app::Application;
use crate::builders::{default_builders, Builder};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::lock::AppLock;
use crate::process::{CommandRunner, ShellRunner};
use crate::proxy::{NginxProxy, ReverseProxy, SelfSignedCertificates};
use crate::store::AppStore;

/// Everything one agent invocation works with, built once at startup and
/// passed by reference into every component.
pub struct AgentState {
    pub config: AgentConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub store: AppStore,
    pub proxy: Arc<dyn ReverseProxy>,
    pub builders: Vec<Box<dyn Builder>>,
}

impl AgentState {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let store = AppStore::open(&config.db_path)?;
        Ok(Self::with_runner(config, Arc::new(ShellRunner), store))
    }

    /// State over a caller-supplied runner and store; the proxy and its
    /// certificate manager share the runner.
    pub fn with_runner(
        config: AgentConfig,
        runner: Arc<dyn CommandRunner>,
        store: AppStore,
    ) -> Self {
        let certificates = Arc::new(SelfSignedCertificates::new(
            &config.nginx_root,
            runner.clone(),
            config.timeouts.hook,
        ));
        let proxy = Arc::new(NginxProxy::new(&config, certificates));

        Self {
            config,
            runner,
            store,
            proxy,
            builders: default_builders(),
        }
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn ReverseProxy>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn app(&self, name: &str) -> Result<Application> {
        Application::new(&self.config, name)
    }

    /// Exclusive per-app lock, held until the guard drops.
    pub async fn lock(&self, app: &str) -> Result<AppLock> {
        AppLock::acquire(&self.config.locks_root, app, self.config.lock_wait).await
    }
}
