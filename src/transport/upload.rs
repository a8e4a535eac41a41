//! object upload through signed urls

use std::collections::BTreeSet;
use std::fs::File;
use std::path::PathBuf;

use reqwest::blocking::Body;
use reqwest::header::CONTENT_LENGTH;
use reqwest::StatusCode;
use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::object::ObjectPool;
use crate::session::expect_success;
use crate::transport::jobs::{run_jobs, Job, UPLOAD_WORKERS};
use crate::transport::progress::{Progress, ProgressReader};
use crate::transport::remote::{authorized, object_type, read_json, ObjectMeta, Remote};
use crate::types::State;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    /// server resolved the digest to an object it already stores elsewhere
    Linked,
    /// already present, not re-uploaded
    Existing,
}

impl UploadOutcome {
    fn as_str(self) -> &'static str {
        match self {
            UploadOutcome::Uploaded => "uploaded",
            UploadOutcome::Linked => "linked",
            UploadOutcome::Existing => "existing",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub linked: usize,
    pub existing: usize,
    pub bytes: u64,
}

struct UploadJob {
    name: String,
    hash: Hash,
    path: PathBuf,
    size: u64,
}

impl Job for UploadJob {
    fn name(&self) -> &str {
        &self.name
    }
}

/// upload every object of `state` the `baseline` does not already reference
///
/// each digest is handled once per call, whatever the number of keys naming it.
pub fn upload_objects(
    remote: &Remote<'_>,
    pool: &ObjectPool,
    state: &State,
    baseline: &State,
    force: bool,
    progress: &Progress,
) -> Result<UploadSummary> {
    let known = baseline.digests();
    let mut seen = BTreeSet::new();
    let mut jobs = Vec::new();
    for (key, hash) in state.objects() {
        if known.contains(&hash) || !seen.insert(hash) {
            continue;
        }
        jobs.push(UploadJob {
            name: key.clone(),
            hash,
            path: pool.object_path(&hash),
            size: pool.size(&hash)?,
        });
    }
    debug!(objects = jobs.len(), "uploading objects");

    let outcomes = run_jobs(jobs, UPLOAD_WORKERS, |job| {
        let (name, size) = (job.name.clone(), job.size);
        let outcome = upload_one(remote, job, force, progress)?;
        progress.finished(&name, outcome.as_str());
        Ok((outcome, size))
    })?;

    let mut summary = UploadSummary::default();
    for (outcome, size) in outcomes {
        match outcome {
            UploadOutcome::Uploaded => {
                summary.uploaded += 1;
                summary.bytes += size;
            }
            UploadOutcome::Linked => summary.linked += 1,
            UploadOutcome::Existing => summary.existing += 1,
        }
    }
    info!(
        uploaded = summary.uploaded,
        linked = summary.linked,
        existing = summary.existing,
        "objects synced"
    );
    Ok(summary)
}

fn upload_one(
    remote: &Remote<'_>,
    job: UploadJob,
    force: bool,
    progress: &Progress,
) -> Result<UploadOutcome> {
    let session = remote.session();
    let endpoint = &remote.info().objects_endpoint;
    let meta = ObjectMeta::for_upload(&job.name, &job.hash, job.size);

    let response = session.send(|client, bearer| authorized(client.post(endpoint), bearer).json(&meta))?;

    let signed = match response.status() {
        StatusCode::CONFLICT => {
            if object_type(&response).as_deref() == Some("link") {
                debug!(object = %job.name, "linked by remote");
                return Ok(UploadOutcome::Linked);
            }
            if !force {
                debug!(object = %job.name, "already on remote");
                return Ok(UploadOutcome::Existing);
            }
            let url = remote.info().object_url(&job.hash);
            let response = expect_success(
                session.send(|client, bearer| authorized(client.put(&url), bearer).json(&meta))?,
            )?;
            read_json::<ObjectMeta>(response)?
        }
        _ => read_json::<ObjectMeta>(expect_success(response)?)?,
    };

    if signed.signed_put_url.is_empty() {
        return Err(Error::Remote(format!(
            "no signed upload url for {}",
            job.name
        )));
    }

    let file = File::open(&job.path).with_path(&job.path)?;
    let reader = ProgressReader::new(file, progress.job(&job.name, Some(job.size)));
    let response = session
        .client()
        .put(&signed.signed_put_url)
        .header(CONTENT_LENGTH, job.size)
        .body(Body::sized(reader, job.size))
        .send()?;
    expect_success(response)?;
    Ok(UploadOutcome::Uploaded)
}
