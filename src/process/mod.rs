pub mod mock;
pub mod port;
pub mod runner;

pub use runner::{run_checked, CommandOutput, CommandRunner, CommandSpec, ShellRunner};
