//! buildfs - build ext4 root filesystem images from container images.
//!
//! Images are cached per workspace; repeated builds of the same image
//! return the cached file.

use std::process::ExitCode;

use clap::Parser;

mod commands;
mod error;
mod logging;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init(cli.log_format());

    // Return instead of exiting so the runtime shuts down and finishes
    // pending blocking work.
    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error::print_error(&e);
            ExitCode::FAILURE
        }
    }
}
