pub mod config;
pub mod error;
pub mod events;
pub mod sanitize;

pub use config::MarvinConfig;
pub use error::{MarvinError, Result};
pub use events::{AgentEvent, EventBus};
