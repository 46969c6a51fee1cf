//! Binary entrypoint. Checks for the `exec`-reentry env vars before
//! touching argument parsing — a successful re-entry never returns.

use clap::Parser;
use sudocker::cli::Cli;

#[tokio::main]
async fn main() {
    if let Err(e) = sudocker::init::maybe_reexec() {
        eprintln!("sudocker: {e}");
        std::process::exit(e.exit_code());
    }

    let cli = Cli::parse();
    let code = sudocker::cli::dispatch(cli).await;
    std::process::exit(code);
}
