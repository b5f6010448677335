pub mod cluster;
pub mod config;
pub mod error;

pub use config::MusterConfig;
pub use error::{MusterError, Result};
