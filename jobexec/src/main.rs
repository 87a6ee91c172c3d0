//! Jobexec - run an external command as a job handle and report the outcome.
//!
//! The binary is a thin driver around the `jobexec` library: it acquires a
//! handle from a pool, configures it from the command line, runs it and
//! prints the captured output or a JSON report.

mod cli;

use anyhow::Result;
use clap::Parser;

use cli::{execute, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    jobexec::logging::init(cli.verbose);
    let code = execute(cli).await?;
    std::process::exit(code)
}
