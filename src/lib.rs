pub mod common;
pub mod config;
pub mod logging;
pub mod selfupdate;

pub use common::{PROJECT_NAME, PROJECT_VERSION};
pub use config::AgentConfig;
pub use logging::Logging;
pub use selfupdate::{UpdateError, UpdateResult};
