//! Startup helpers shared by the `hub` and `node` binaries.
//!
//! # Functions
//! - `setup_logging`: initializes the logger with colored output and info-level filtering.
//! - `setup_database`: connects to the Hub's MySQL database and runs schema setup.
//! - `launch_server`: logs a startup banner and launches an assembled Rocket instance.

pub mod launch_server;
pub mod setup_database;
pub mod setup_logging;

pub use launch_server::launch_server;
pub use setup_database::setup_database;
pub use setup_logging::setup_logging;
