//! CLI command execution.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use jobexec::{HandlePool, JobHandle, JobReport, JobStatus};
use tracing::{debug, warn};

use super::args::Cli;

/// Run the requested command and return the exit code to finish with.
pub async fn execute(cli: Cli) -> Result<i32> {
    let pool = HandlePool::with_auto_reset();
    let job = pool.acquire();

    let (command, args) = cli.program();
    job.configure(
        cli.dir.clone().unwrap_or_default(),
        command,
        args.iter().map(String::as_str),
    );
    job.set_job_tag(cli.tag);
    if let Some(ref input) = cli.stdin {
        job.write_stdin(input);
    }

    // A deadline needs the caller's task free while the job runs.
    let background = cli.background || cli.kill_after.is_some();
    job.set_async(background);
    job.on_start(|job| debug!(pid = ?job.pid(), "job started"));

    if let Err(e) = job.run().await {
        if e.is_spawn_failure() {
            return Err(e).with_context(|| format!("Failed to run {command}"));
        }
    }

    match cli.kill_after {
        Some(ms) => wait_with_deadline(&job, Duration::from_millis(ms)).await,
        None => job.wait().await,
    }

    let report = job.report();
    let output = (job.stdout(), job.stderr());
    pool.release(job);

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print_report(&report, &output.0, &output.1)?;
    }

    Ok(exit_code_for(&report))
}

/// Wait for the job, killing it once `deadline` passes.
async fn wait_with_deadline(job: &JobHandle, deadline: Duration) {
    if tokio::time::timeout(deadline, job.wait()).await.is_ok() {
        return;
    }

    match job.kill() {
        Ok(()) => debug!(?deadline, "deadline passed, job killed"),
        Err(e) if e.is_benign_kill_race() => debug!("job exited before it could be killed"),
        Err(e) => warn!(error = %e, "failed to kill job"),
    }
    job.wait().await;
}

/// Pass the captured bytes through untouched and summarize on stderr.
fn print_report(report: &JobReport, stdout: &[u8], stderr: &[u8]) -> Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(stdout).context("Failed to write stdout")?;
    out.flush().context("Failed to flush stdout")?;
    std::io::stderr()
        .write_all(stderr)
        .context("Failed to write stderr")?;

    let elapsed = report
        .duration()
        .map(|d| format!(" in {}ms", d.num_milliseconds()))
        .unwrap_or_default();
    let pid = report
        .pid
        .map_or_else(|| "no pid".to_string(), |pid| format!("pid {pid}"));
    eprintln!(
        "job {} ({pid}): {}{elapsed}",
        report.identity, report.status
    );
    if let Some(ref error) = report.error {
        eprintln!("error: {error}");
    }
    Ok(())
}

fn exit_code_for(report: &JobReport) -> i32 {
    match report.status {
        JobStatus::Succeeded | JobStatus::Idle | JobStatus::Running => 0,
        JobStatus::Failed if report.exit_code != 0 => report.exit_code,
        JobStatus::Failed => 1,
    }
}
