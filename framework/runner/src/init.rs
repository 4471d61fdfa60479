use clap::Parser;

use crate::cli::SquallCli;

/// Initialise logging and parse the command line for the Squall runner.
pub fn init() -> SquallCli {
    env_logger::init();

    SquallCli::parse()
}
