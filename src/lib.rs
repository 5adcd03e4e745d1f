// Library crate for integration tests and the hop3-agent binary.

pub mod app;
pub mod app_config;
pub mod builders;
pub mod config;
pub mod deploy;
pub mod diagnostics;
pub mod env;
pub mod error;
pub mod git;
pub mod launcher;
pub mod lock;
pub mod log_capture;
pub mod process;
pub mod procfile;
pub mod proxy;
pub mod settings;
pub mod state;
pub mod store;
pub mod uwsgi;
