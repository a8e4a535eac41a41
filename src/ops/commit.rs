use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fs::write_atomic;
use crate::json;
use crate::ops::diff::status_of;
use crate::ops::scan::{stage_keys, working_document};
use crate::repo::Repo;
use crate::types::Status;

/// name of the marker written by checkpoint commits
pub const CHECKPOINT_KEY: &str = "checkpoint.json";

/// what a commit recorded
#[derive(Debug, Default)]
pub struct CommitSummary {
    pub status: Status,
    /// objects newly copied into the pool
    pub pooled: usize,
}

/// record the working copy as the new pristine document
///
/// objects are pooled before the pristine rename, which is the single point
/// at which the commit becomes visible.
pub fn commit(repo: &Repo, message: &str, checkpoint: bool) -> Result<CommitSummary> {
    let _lock = repo.lock()?;

    if checkpoint {
        write_checkpoint(repo)?;
    }

    let pristine = repo.pristine()?;
    let working = working_document(repo)?;
    let status = status_of(&pristine, &working);

    let mut pooled = 0;
    for key in status.new.iter().chain(status.changed.iter()) {
        let Some(expected) = working.document.get(key).and_then(|v| v.object()) else {
            continue;
        };
        if repo.pool().contains(&expected) {
            continue;
        }
        let path = repo.working_path(key)?;
        let actual = repo.pool().put(&path)?;
        if actual != expected {
            return Err(Error::Conflict(format!("commit: {key} changed while committing")));
        }
        debug!(key = %key, digest = %actual, "pooled object");
        pooled += 1;
    }

    repo.write_commit_message(message)?;

    // the working document is the next pristine as a whole; replaying the
    // diff as a merge patch would drop nulls inside inline values
    repo.write_pristine(&working.document)?;
    repo.clear_staged()?;

    info!(
        new = status.new.len(),
        changed = status.changed.len(),
        removed = status.removed.len(),
        pooled,
        "committed"
    );
    Ok(CommitSummary { status, pooled })
}

fn write_checkpoint(repo: &Repo) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| Error::Malformed {
            what: "timestamp",
            message: e.to_string(),
        })?;
    let path = repo.working_path(CHECKPOINT_KEY)?;
    write_atomic(&path, &json::to_canonical_vec(&json!({ "major": now })))?;
    stage_keys(repo, &[CHECKPOINT_KEY.to_string()], true)?;
    Ok(())
}
