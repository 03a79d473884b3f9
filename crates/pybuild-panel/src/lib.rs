pub mod cleanup;
pub mod config;
pub mod editor;
pub mod error;
pub mod log_sanitize;
pub mod logging;
pub mod matcher;
pub mod project;
pub mod session;
pub mod ui;

pub use error::{Error, ErrorKind, Result};
