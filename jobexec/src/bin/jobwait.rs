//! Jobwait - helper process for exercising job handles.
//!
//! Echoes standard input back on standard output, writes a marker line to
//! standard error, sleeps, then exits with the requested code.

use std::io::{self, IsTerminal, Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

/// Jobwait - echo stdin, sleep, exit with a chosen code
#[derive(Parser, Debug)]
#[command(name = "jobwait")]
#[command(version, about, long_about = None)]
struct Args {
    /// Seconds to sleep before exiting
    #[arg(short, long, default_value_t = 0.0)]
    sleep: f64,

    /// Exit code to finish with
    #[arg(long = "exit", default_value_t = 0)]
    exit_code: i32,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut input = Vec::new();
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        stdin
            .lock()
            .read_to_end(&mut input)
            .context("Failed to read stdin")?;
    }

    let mut stdout = io::stdout().lock();
    stdout.write_all(&input).context("Failed to write stdout")?;
    stdout.flush().context("Failed to flush stdout")?;
    eprintln!("jobwait: stderr");

    std::thread::sleep(Duration::from_secs_f64(args.sleep.max(0.0)));
    std::process::exit(args.exit_code)
}
