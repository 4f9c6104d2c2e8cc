//! Kiln - incremental content cooker.

use std::process::ExitCode;

use kiln::cli;

fn main() -> ExitCode {
    cli::run()
}
