pub mod collaborators;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod memory;
pub mod orchestrator;
pub mod permissions;
pub mod planner;
pub mod references;
pub mod storage_paths;
pub mod tasks;

pub const DEFAULT_DAEMON_HOST: &str = "127.0.0.1";
pub const DEFAULT_DAEMON_PORT: u16 = 38888;

pub use collaborators::*;
pub use config::*;
pub use error::*;
pub use event_bus::*;
pub use memory::*;
pub use orchestrator::*;
pub use permissions::*;
pub use planner::*;
pub use storage_paths::*;
pub use tasks::*;
