use std::collections::BTreeSet;

use tracing::warn;

use crate::error::Result;
use crate::hash::Hash;
use crate::repo::Repo;

/// fsck report
#[derive(Debug, Default)]
pub struct FsckReport {
    /// objects checked
    pub objects_checked: usize,
    /// pristine keys whose object does not hash to its name
    pub corrupt_objects: Vec<ObjectProblem>,
    /// pristine keys whose object is absent from the pool
    pub missing_objects: Vec<ObjectProblem>,
    /// pool entries no pristine key refers to
    pub dangling_objects: Vec<Hash>,
}

impl FsckReport {
    pub fn is_ok(&self) -> bool {
        self.corrupt_objects.is_empty() && self.missing_objects.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectProblem {
    pub hash: Hash,
    pub key: String,
}

/// verify every object the pristine document refers to
///
/// the pool may be shared, so dangling entries are reported but never removed.
pub fn check_objects(repo: &Repo) -> Result<FsckReport> {
    let pristine = repo.pristine()?;
    let mut report = FsckReport::default();
    let mut referenced = BTreeSet::new();

    for (key, hash) in pristine.objects() {
        referenced.insert(hash);
        report.objects_checked += 1;

        if !repo.pool().contains(&hash) {
            report.missing_objects.push(ObjectProblem {
                hash,
                key: key.clone(),
            });
        } else if !repo.pool().verify(&hash)? {
            warn!(key = %key, digest = %hash, "corrupt object");
            report.corrupt_objects.push(ObjectProblem {
                hash,
                key: key.clone(),
            });
        }
    }

    for hash in repo.pool().list()? {
        if !referenced.contains(&hash) {
            report.dangling_objects.push(hash);
        }
    }

    Ok(report)
}
