//! End-to-end job lifecycle tests driven by the `jobwait` helper.

#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobexec::{HandlePool, JobError, JobHandle, JobStatus};

const JOBWAIT: &str = env!("CARGO_BIN_EXE_jobwait");

fn jobwait(args: &[&str]) -> JobHandle {
    JobHandle::new(JOBWAIT, args.iter().copied())
}

#[tokio::test]
async fn test_stdin_round_trip() {
    let job = jobwait(&[]);
    job.write_stdin("abc\n");
    job.set_async(true);

    job.run().await.unwrap();
    job.wait().await;

    assert_eq!(job.stdout(), b"abc\n");
    assert_eq!(job.stderr_string(), "jobwait: stderr\n");
    assert!(job.last_error().is_none());
}

#[tokio::test]
async fn test_exit_code_seven() {
    let job = jobwait(&["--exit", "7"]);
    let failures = Arc::new(AtomicUsize::new(0));
    {
        let failures = failures.clone();
        job.on_failure(move |_| {
            failures.fetch_add(1, Ordering::SeqCst);
        });
    }
    job.on_success(|_| panic!("on_success must not fire"));

    let err = job.run().await.unwrap_err();

    assert!(matches!(err, JobError::Exited { code: Some(7), .. }));
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(job.exit_code(), 7);
    assert_eq!(job.report().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_background_run_returns_immediately() {
    let job = jobwait(&["--sleep", "0.5"]);
    job.set_async(true);

    let started = std::time::Instant::now();
    job.run().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(400));
    assert!(job.is_running());
    assert_eq!(job.report().status, JobStatus::Running);

    job.wait().await;
    assert!(!job.is_running());
    assert!(job.last_error().is_none());
    assert!(job.report().duration().is_some());
}

#[tokio::test]
async fn test_kill_mid_flight() {
    let job = jobwait(&["--sleep", "30"]);
    job.set_async(true);
    let failed = Arc::new(AtomicUsize::new(0));
    {
        let failed = failed.clone();
        job.on_failure(move |job| {
            assert!(job.last_error().is_some());
            failed.fetch_add(1, Ordering::SeqCst);
        });
    }

    job.run().await.unwrap();
    job.kill().unwrap();
    tokio::time::timeout(Duration::from_secs(10), job.wait())
        .await
        .expect("killed job did not finish");

    assert_eq!(failed.load(Ordering::SeqCst), 1);
    assert!(job.kill().unwrap_err().is_benign_kill_race());
}

#[tokio::test]
async fn test_working_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("input.txt"), "from file\n").unwrap();

    let job = JobHandle::default();
    job.configure(dir.path(), "cat", ["input.txt"]);
    job.run().await.unwrap();

    assert_eq!(job.stdout_string(), "from file\n");
}

#[tokio::test]
async fn test_missing_working_dir_is_spawn_failure() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist");

    let job = JobHandle::default();
    job.configure(missing, JOBWAIT, Vec::<String>::new());
    let err = job.run().await.unwrap_err();

    assert!(err.is_spawn_failure());
    assert!(job.pid().is_none());
    assert!(!job.is_running());
}

#[tokio::test]
async fn test_pool_recycles_finished_jobs() {
    let pool = HandlePool::with_auto_reset();

    for round in 0..3u64 {
        let jobs: Vec<JobHandle> = (0..4)
            .map(|i| {
                let job = pool.acquire();
                job.configure("", JOBWAIT, ["--sleep", "0.1"]);
                job.write_stdin(format!("round {round} job {i}\n"));
                job.set_job_tag(Some(round * 10 + i));
                job.set_async(true);
                job
            })
            .collect();

        for job in &jobs {
            job.run().await.unwrap();
        }
        for (i, job) in jobs.iter().enumerate() {
            job.wait().await;
            assert_eq!(job.stdout_string(), format!("round {round} job {i}\n"));
            assert_eq!(job.job_tag(), Some(round * 10 + i as u64));
        }
        for job in jobs {
            pool.release(job);
        }
    }

    assert_eq!(pool.count(), 4);
    assert_eq!(pool.available(), 4);
}
