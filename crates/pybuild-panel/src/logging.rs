use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::error::{Error, Result};

/// Filter directives are read from this variable, e.g. `PYBUILD_LOG=pybuild_panel=debug`.
pub const LOG_ENV: &str = "PYBUILD_LOG";

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions<'a> {
    pub json: bool,
    /// Append to this file instead of stderr (the terminal panel owns the screen).
    pub file: Option<&'a Path>,
}

pub fn init(opts: LogOptions<'_>) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);

    let res = match opts.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::msg(format!("failed to open log file {}: {e}", path.display())))?;
            let writer = Mutex::new(file);
            if opts.json {
                registry
                    .with(fmt::layer().json().with_writer(writer))
                    .try_init()
            } else {
                registry
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .try_init()
            }
        }
        None if opts.json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        None => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    res.map_err(|e| Error::msg(format!("failed to initialise logging: {e}")))
}
