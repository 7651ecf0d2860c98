pub mod audit;
pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{ActionFailure, ErrorType, Result, TesseraError};
pub use event::{DomainEvent, EventBus};
pub use types::*;
