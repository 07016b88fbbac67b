//! # fairrec-core: shared infrastructure for FairRec
//!
//! Layered configuration loading, atomic JSON persistence and logging setup
//! used by the training engine (`fairrec-ml`) and the `fairrec` CLI.

pub mod config;
pub mod error;
pub mod logging;
pub mod persistence;

pub use config::{config_exists, default_config_files, load_layered};
pub use error::CoreError;
pub use logging::init_logging;
