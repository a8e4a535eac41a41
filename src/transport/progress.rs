//! transfer progress, rendered by a single thread

use std::io::{self, Read};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

/// bytes accumulated before a progress event is sent
const REPORT_EVERY: u64 = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    Started { job: String, total: Option<u64> },
    Advanced { job: String, bytes: u64 },
    Finished { job: String, outcome: String },
}

/// draws progress events; owned by the ui thread
pub trait ProgressRenderer: Send {
    fn render(&mut self, event: &ProgressEvent);

    fn finish(&mut self) {}
}

/// reports through tracing
#[derive(Debug, Default)]
pub struct TracingRenderer {
    jobs: usize,
    bytes: u64,
}

impl ProgressRenderer for TracingRenderer {
    fn render(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { job, total } => debug!(job = %job, size = ?total, "transfer started"),
            ProgressEvent::Advanced { bytes, .. } => self.bytes += bytes,
            ProgressEvent::Finished { job, outcome } => {
                self.jobs += 1;
                info!(job = %job, outcome = %outcome, "transfer finished");
            }
        }
    }

    fn finish(&mut self) {
        if self.jobs > 0 {
            info!(jobs = self.jobs, bytes = self.bytes, "transfers complete");
        }
    }
}

/// keeps every event, for inspection in tests
#[derive(Clone, Debug, Default)]
pub struct RecordingRenderer {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingRenderer {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressRenderer for RecordingRenderer {
    fn render(&mut self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// fan-in point for per-job progress counters
pub struct Progress {
    tx: Option<Sender<ProgressEvent>>,
    ui: Option<JoinHandle<()>>,
}

impl Progress {
    /// start the ui thread
    pub fn spawn(mut renderer: Box<dyn ProgressRenderer>) -> Self {
        let (tx, rx) = mpsc::channel::<ProgressEvent>();
        let ui = thread::Builder::new()
            .name("pvr-progress".into())
            .spawn(move || {
                for event in rx {
                    renderer.render(&event);
                }
                renderer.finish();
            })
            .ok();
        Self { tx: Some(tx), ui }
    }

    /// discard every event
    pub fn silent() -> Self {
        Self { tx: None, ui: None }
    }

    /// counter for one job
    pub fn job(&self, name: &str, total: Option<u64>) -> JobProgress {
        let job = JobProgress {
            tx: self.tx.clone(),
            name: name.to_string(),
            pending: 0,
        };
        job.send(ProgressEvent::Started {
            job: job.name.clone(),
            total,
        });
        job
    }

    /// report the end of a job whose counter was handed off
    pub fn finished(&self, job: &str, outcome: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressEvent::Finished {
                job: job.to_string(),
                outcome: outcome.to_string(),
            });
        }
    }

    /// close the channel and wait for the ui thread to drain it
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(ui) = self.ui.take() {
            let _ = ui.join();
        }
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct JobProgress {
    tx: Option<Sender<ProgressEvent>>,
    name: String,
    pending: u64,
}

impl JobProgress {
    fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.pending += bytes;
        if self.pending >= REPORT_EVERY {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.pending > 0 {
            self.send(ProgressEvent::Advanced {
                job: self.name.clone(),
                bytes: self.pending,
            });
            self.pending = 0;
        }
    }

    pub fn finish(mut self, outcome: &str) {
        self.flush();
        self.send(ProgressEvent::Finished {
            job: self.name.clone(),
            outcome: outcome.to_string(),
        });
    }
}

/// counts bytes read through it into a job counter
pub struct ProgressReader<R> {
    inner: R,
    progress: JobProgress,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R, progress: JobProgress) -> Self {
        Self { inner, progress }
    }

    pub fn finish(self, outcome: &str) {
        self.progress.finish(outcome);
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.progress.flush();
        } else {
            self.progress.advance(n as u64);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_reach_renderer_in_order() {
        let recorder = RecordingRenderer::default();
        let progress = Progress::spawn(Box::new(recorder.clone()));

        let data = vec![1u8; 3 * REPORT_EVERY as usize / 2];
        let mut reader = ProgressReader::new(data.as_slice(), progress.job("obj", Some(data.len() as u64)));
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).unwrap();
        reader.finish("uploaded");
        progress.finish();

        let events = recorder.events();
        assert_eq!(
            events.first(),
            Some(&ProgressEvent::Started {
                job: "obj".into(),
                total: Some(data.len() as u64)
            })
        );
        let advanced: u64 = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Advanced { bytes, .. } => Some(*bytes),
                _ => None,
            })
            .sum();
        assert_eq!(advanced, data.len() as u64);
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Finished {
                job: "obj".into(),
                outcome: "uploaded".into()
            })
        );
    }

    #[test]
    fn test_silent_progress() {
        let progress = Progress::silent();
        let mut job = progress.job("x", None);
        job.advance(10);
        job.finish("done");
    }
}
