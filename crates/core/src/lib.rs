pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::EngineConfig;
pub use error::{AudienceError, AudienceResult};
pub use types::{DataType, Event, Identity, Profile};
