use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = gateway_observer_cli::Cli::parse();
    ExitCode::from(gateway_observer_cli::run_cli(cli))
}
