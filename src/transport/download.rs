//! object download into the pool

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::object::ObjectPool;
use crate::session::expect_success;
use crate::transport::jobs::{run_jobs, Job, DOWNLOAD_WORKERS};
use crate::transport::progress::{Progress, ProgressReader};
use crate::transport::remote::{object_type, Remote};
use crate::types::State;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub downloaded: usize,
    /// already in the pool with the right content
    pub present: usize,
    pub bytes: u64,
    /// downloads the remote tagged as links
    pub linked: usize,
}

struct DownloadJob {
    name: String,
    hash: Hash,
}

impl Job for DownloadJob {
    fn name(&self) -> &str {
        &self.name
    }
}

enum Fetched {
    Present,
    Downloaded { bytes: u64, link: bool },
}

/// bring every object `state` references into `pool`
pub fn download_objects(
    remote: &Remote<'_>,
    pool: &ObjectPool,
    state: &State,
    progress: &Progress,
) -> Result<DownloadSummary> {
    let mut seen = BTreeSet::new();
    let jobs: Vec<DownloadJob> = state
        .objects()
        .filter(|(_, hash)| seen.insert(*hash))
        .map(|(key, hash)| DownloadJob {
            name: key.clone(),
            hash,
        })
        .collect();
    debug!(objects = jobs.len(), "downloading objects");

    let fetched = run_jobs(jobs, DOWNLOAD_WORKERS, |job| {
        let name = job.name.clone();
        let fetched = download_one(remote, pool, job, progress)?;
        progress.finished(
            &name,
            match fetched {
                Fetched::Present => "present",
                Fetched::Downloaded { .. } => "downloaded",
            },
        );
        Ok(fetched)
    })?;

    let mut summary = DownloadSummary::default();
    for f in fetched {
        match f {
            Fetched::Present => summary.present += 1,
            Fetched::Downloaded { bytes, link } => {
                summary.downloaded += 1;
                summary.bytes += bytes;
                if link {
                    summary.linked += 1;
                }
            }
        }
    }
    info!(
        downloaded = summary.downloaded,
        present = summary.present,
        bytes = summary.bytes,
        "objects fetched"
    );
    Ok(summary)
}

fn download_one(
    remote: &Remote<'_>,
    pool: &ObjectPool,
    job: DownloadJob,
    progress: &Progress,
) -> Result<Fetched> {
    // resume: a valid entry is done, a corrupt one is dropped
    if pool.ensure_valid(&job.hash)? {
        return Ok(Fetched::Present);
    }

    let meta = remote.object_meta(&job.hash)?;
    if meta.signed_get_url.is_empty() {
        return Err(Error::Remote(format!("no signed download url for {}", job.name)));
    }

    let response = expect_success(remote.session().client().get(&meta.signed_get_url).send()?)?;
    let link = object_type(&response).as_deref() == Some("link");
    let total = response.content_length();
    let mut reader = ProgressReader::new(response, progress.job(&job.name, total));
    let bytes = pool.put_expected(&job.hash, &mut reader)?;
    Ok(Fetched::Downloaded { bytes, link })
}
