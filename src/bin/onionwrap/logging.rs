use std::path::Path;

use flexi_logger::{
    detailed_format, FileSpec, FlexiLoggerError, LogSpecification, Logger, LoggerHandle,
};
use log::LevelFilter;

/// Start the global logger.
///
/// Logs go to stderr unless `log_file` is set; stdout belongs to the worker.
/// The returned handle must be kept alive for file logging to be flushed.
pub fn setup_logger(
    level: LevelFilter,
    log_file: Option<&Path>,
) -> Result<LoggerHandle, FlexiLoggerError> {
    let spec = LogSpecification::builder().default(level).build();
    let logger = Logger::with(spec);

    match log_file {
        Some(path) => logger
            .log_to_file(FileSpec::try_from(path)?)
            .append()
            .format(detailed_format)
            .start(),
        None => logger.log_to_stderr().start(),
    }
}
