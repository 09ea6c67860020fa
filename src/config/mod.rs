//! Configuration for opskit
//!
//! Command-line arguments (with environment fallbacks) and `.env` style
//! files that feed the process environment before anything else runs.

mod env_file;
mod settings;

pub use env_file::*;
pub use settings::*;
