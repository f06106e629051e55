pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{CaseforgeError, Result};
pub use event::{EventBus, WorkflowEvent};
pub use types::*;
