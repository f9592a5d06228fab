pub mod balances;
pub mod chain;
pub mod engine;
pub mod errors;
pub mod history;
pub mod notify;
pub mod provider;
pub mod state;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
mod testing;

use crate::state::EngineSettings;
use crate::utils::constants::{LOG_BASENAME, LOG_KEEP_FILES, LOG_ROTATE_BYTES};
use anyhow::Context;
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};

pub use engine::WalletEngine;
pub use errors::{EngineError, EngineResult};

/// Starts file logging. Keep the returned handle alive; dropping it flushes
/// and stops the async writer.
pub fn init_logging(settings: &EngineSettings) -> anyhow::Result<LoggerHandle> {
    Logger::try_with_str(&settings.log_spec)
        .with_context(|| format!("Invalid log spec {:?}", settings.log_spec))?
        .log_to_file(
            FileSpec::default()
                .directory(&settings.log_directory)
                .basename(LOG_BASENAME),
        )
        .write_mode(WriteMode::Async)
        .rotate(
            Criterion::Size(LOG_ROTATE_BYTES),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(LOG_KEEP_FILES),
        )
        .start()
        .context("Failed to initialize logger")
}
