//! bounded worker pool for object transfers

use std::sync::{mpsc, Mutex};
use std::thread;

use tracing::debug;

use crate::error::{Error, Result, TransferFailure};

/// parallel uploads per operation
pub const UPLOAD_WORKERS: usize = 5;
/// parallel downloads per operation
pub const DOWNLOAD_WORKERS: usize = 4;

/// a unit of transfer work
pub trait Job: Send {
    /// label used in progress and error reports
    fn name(&self) -> &str;
}

/// run `work` over every job on at most `workers` threads
///
/// jobs are queued up front and the channel closed; workers drain it. every
/// result is collected before returning, so one failure does not abort the
/// rest. any failure makes the whole batch an `Error::Transfers`.
pub fn run_jobs<J, T, F>(jobs: Vec<J>, workers: usize, work: F) -> Result<Vec<T>>
where
    J: Job,
    T: Send,
    F: Fn(J) -> Result<T> + Sync,
{
    let total = jobs.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let (job_tx, job_rx) = mpsc::channel();
    for job in jobs {
        job_tx.send(job).map_err(|_| Error::Cancelled)?;
    }
    drop(job_tx);

    let job_rx = Mutex::new(job_rx);
    let (done_tx, done_rx) = mpsc::channel();
    let workers = workers.clamp(1, total);
    debug!(jobs = total, workers, "starting transfer pool");

    let mut results = Vec::with_capacity(total);
    let mut failures = Vec::new();

    thread::scope(|scope| {
        for _ in 0..workers {
            let done_tx = done_tx.clone();
            let job_rx = &job_rx;
            let work = &work;
            scope.spawn(move || loop {
                let job = {
                    let Ok(rx) = job_rx.lock() else { break };
                    match rx.recv() {
                        Ok(job) => job,
                        Err(_) => break,
                    }
                };
                let name = job.name().to_string();
                let outcome = work(job);
                if done_tx.send((name, outcome)).is_err() {
                    break;
                }
            });
        }
        drop(done_tx);

        for (name, outcome) in done_rx {
            match outcome {
                Ok(value) => results.push(value),
                Err(error) => {
                    debug!(job = %name, error = %error, "transfer failed");
                    failures.push(TransferFailure { name, error });
                }
            }
        }
    });

    if !failures.is_empty() {
        failures.sort_by(|a, b| a.name.cmp(&b.name));
        return Err(Error::Transfers { total, failures });
    }
    Ok(results)
}
