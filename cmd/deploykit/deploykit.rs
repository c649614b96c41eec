use std::process::ExitCode;

use clap::Parser;
use deploykit::cli::CLI;

#[tokio::main]
async fn main() -> ExitCode {
    let CLI { opts, command } = CLI::parse();

    match command.run(&opts).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}
