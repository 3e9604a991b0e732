#[macro_use]
extern crate tracing;

use std::process::ExitCode;

use clap::Parser;
use whep_snapshot::cli::Args;
use whep_snapshot::session;
use whep_snapshot::settings::Settings;
use whep_snapshot::trace::tracing_init;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    // Logging is configured from the settings, so these go to stderr directly.
    let settings = match Settings::load(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let initialized = settings
        .log_level()
        .map_err(|e| e.to_string())
        .and_then(|level| tracing_init(level).map_err(|e| e.to_string()));
    if let Err(e) = initialized {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match session::run(&settings, session::wait_for_exit()).await {
        Ok(()) => {
            info!("bye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "session failed");
            ExitCode::FAILURE
        }
    }
}
