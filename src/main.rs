//! Provides the main entry point to the program.
use clap::Parser;
use log::error;
use rehub::cli::{Cli, Commands, handle_run_command, handle_validate_command};
use rehub::error::{FailureKind, failure_kind};
use rehub::log::is_logger_initialised;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run { model_dir, opts } => handle_run_command(&model_dir, &opts),
        Commands::Validate { model_dir } => handle_validate_command(&model_dir),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let kind = failure_kind(&err);
            let summary = match kind {
                Some(kind) => format!("{kind}: {err:#}"),
                None => format!("Error: {err:#}"),
            };
            if is_logger_initialised() {
                error!("{summary}");
            } else {
                eprintln!("{summary}");
            }
            kind.map_or(ExitCode::FAILURE, FailureKind::exit_code)
        }
    }
}
