pub mod config;
pub mod errors;
pub mod types;

pub use config::CaptureConfiguration;
pub use errors::CaptureError;
pub use types::*;
