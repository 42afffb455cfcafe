//! Infrastructure: config loading, logging, and drivers for external
//! collaborators (git, child processes, tools).

pub mod config;
pub mod git;
pub mod logging;
pub mod process;
pub mod tools;

pub use config::{ConfigError, ConfigLoader};
pub use git::ShellGitDriver;
pub use logging::init_logging;
pub use process::TokioProcessRunner;
pub use tools::{InMemoryToolRegistry, ToolHandler};
