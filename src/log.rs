//! Logging setup: colourised terminal output plus two per-run log files.
//!
//! The info log carries the full run record, shadow-price and objective history included, and is
//! the postmortem source for failed runs; the error log holds warnings and errors only. The level
//! comes from the `REHUB_LOG_LEVEL` environment variable, falling back to the settings file and
//! then to [`DEFAULT_LOG_LEVEL`].
use anyhow::{Context, Result};
use chrono::Local;
use fern::colors::{Color, ColoredLevelConfig};
use fern::{Dispatch, FormatCallback};
use log::{LevelFilter, Record};
use std::env;
use std::fmt::Arguments;
use std::fs::File;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::OnceLock;

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

/// The log level used when neither the environment nor the settings file names one
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// File name of the full run record
const LOG_INFO_FILE_NAME: &str = "rehub_info.log";

/// File name of the warnings-and-errors log
const LOG_ERROR_FILE_NAME: &str = "rehub_error.log";

/// Whether the program logger has been installed
pub fn is_logger_initialised() -> bool {
    LOGGER_INIT.get().is_some()
}

/// Install the program logger.
///
/// `log_level_from_settings` is the level named in the settings file; `REHUB_LOG_LEVEL` overrides
/// it. When `log_dir` is given, the two log files are created there. Calling again after a logger
/// is installed is a no-op, so command handlers can be invoked repeatedly in one process.
pub fn init(log_level_from_settings: Option<&str>, log_dir: Option<&Path>) -> Result<()> {
    if is_logger_initialised() {
        return Ok(());
    }

    let level_name = env::var("REHUB_LOG_LEVEL").unwrap_or_else(|_| {
        log_level_from_settings
            .unwrap_or(DEFAULT_LOG_LEVEL)
            .to_string()
    });
    let level: LevelFilter = level_name
        .to_lowercase()
        .parse()
        .with_context(|| format!("Unknown log level: {level_name}"))?;

    let mut dispatch = Dispatch::new()
        .chain(terminal_chain(level, Stream::Stdout))
        .chain(terminal_chain(level, Stream::Stderr));

    if let Some(log_dir) = log_dir {
        let info_file = File::create(log_dir.join(LOG_INFO_FILE_NAME))?;
        let error_file = File::create(log_dir.join(LOG_ERROR_FILE_NAME))?;
        dispatch = dispatch
            .chain(
                Dispatch::new()
                    .filter(|metadata| metadata.level() > LevelFilter::Warn)
                    .format(plain_format)
                    .level(level.max(LevelFilter::Info))
                    .chain(info_file),
            )
            .chain(
                Dispatch::new()
                    .format(plain_format)
                    .level(LevelFilter::Warn)
                    .chain(error_file),
            );
    }

    dispatch.apply().expect("Logger already initialised");
    LOGGER_INIT.set(()).unwrap();

    Ok(())
}

/// The two terminal targets: info and below to stdout, warnings and errors to stderr
#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn terminal_chain(level: LevelFilter, stream: Stream) -> Dispatch {
    let colours = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::Magenta);

    let dispatch = Dispatch::new();
    match stream {
        Stream::Stdout => {
            let coloured = std::io::stdout().is_terminal();
            dispatch
                .filter(|metadata| metadata.level() > LevelFilter::Warn)
                .format(move |out, message, record| {
                    colour_format(out, message, record, coloured, &colours);
                })
                .level(level)
                .chain(std::io::stdout())
        }
        Stream::Stderr => {
            let coloured = std::io::stderr().is_terminal();
            dispatch
                .format(move |out, message, record| {
                    colour_format(out, message, record, coloured, &colours);
                })
                .level(level.min(LevelFilter::Warn))
                .chain(std::io::stderr())
        }
    }
}

fn plain_format(out: FormatCallback, message: &Arguments, record: &Record) {
    let timestamp = Local::now().format("%H:%M:%S");
    out.finish(format_args!(
        "[{timestamp} {} {}] {message}",
        record.level(),
        record.target()
    ));
}

fn colour_format(
    out: FormatCallback,
    message: &Arguments,
    record: &Record,
    coloured: bool,
    colours: &ColoredLevelConfig,
) {
    if coloured {
        let timestamp = Local::now().format("%H:%M:%S");
        out.finish(format_args!(
            "[{timestamp} {} {}] {message}",
            colours.color(record.level()),
            record.target()
        ));
    } else {
        plain_format(out, message, record);
    }
}
