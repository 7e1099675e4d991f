pub mod config;
pub mod encoding;
pub mod error;
pub mod ids;
pub mod types;

pub use error::{HarvestError, Result};
pub use ids::*;
