//! CLI utilities for spkexport.
//!
//! Profile configuration, summary output and logging setup shared by the
//! `spkexport` binary.

pub mod config;
pub mod logging;
pub mod output;
pub mod paths;

pub use config::{Config, Profile, load_config};
pub use logging::init_logging;
pub use output::{OutputFormat, render_summary};
pub use paths::Paths;
