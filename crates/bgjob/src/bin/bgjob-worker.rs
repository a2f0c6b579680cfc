//! Stock worker binary: runs the script executor against a segment.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use bgjob::testkit::ScriptExecutor;
use bgjob::worker::run_worker;

#[derive(Debug, Parser)]
#[command(name = "bgjob-worker", about = "bgjob background worker process")]
struct Args {
    /// Name of the shared segment to attach to.
    #[arg(long, env = "BGJOB_SEGMENT")]
    segment: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run_worker(&args.segment, &ScriptExecutor) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(segment = %args.segment, %err, "worker failed");
            ExitCode::FAILURE
        }
    }
}
