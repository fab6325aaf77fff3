//! # ghostcut - Online schema migration for MySQL
//!
//! Command-line front end for [`ghostcut_core`]: flag parsing and
//! validation, building the shared migration context, and the background
//! tasks that run next to the abort coordinator.

pub mod cli;
pub mod startup;

pub use cli::Cli;
pub use startup::{build_context, reload_config, watch_panic_flag_file};
