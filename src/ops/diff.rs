use serde_json::Value;

use crate::error::Result;
use crate::json::create_merge_patch;
use crate::ops::scan::{working_document, WorkingCopy};
use crate::repo::Repo;
use crate::types::{State, Status};

/// merge-patch turning one state into another
pub fn diff_states(from: &State, to: &State) -> Value {
    create_merge_patch(&from.to_value(), &to.to_value())
}

/// merge-patch from the pristine document to the working copy
pub fn diff(repo: &Repo) -> Result<Value> {
    let pristine = repo.pristine()?;
    let working = working_document(repo)?;
    Ok(diff_states(&pristine, &working.document))
}

/// working copy changes split by kind
pub fn status(repo: &Repo) -> Result<Status> {
    let pristine = repo.pristine()?;
    let working = working_document(repo)?;
    Ok(status_of(&pristine, &working))
}

/// compared key by key, so inline values holding nulls count as changed
/// rather than removed
pub(crate) fn status_of(pristine: &State, working: &WorkingCopy) -> Status {
    let mut status = Status {
        untracked: working.untracked.clone(),
        ..Default::default()
    };
    for (key, value) in working.document.iter() {
        match pristine.get(key) {
            None => status.new.push(key.clone()),
            Some(old) if old != value => status.changed.push(key.clone()),
            Some(_) => {}
        }
    }
    status.removed = pristine
        .keys()
        .filter(|key| !working.document.contains_key(key))
        .cloned()
        .collect();
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::stage;
    use crate::ops::commit;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_empty_repo_is_clean() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        let status = status(&repo).unwrap();
        assert!(status.is_clean());
        assert!(status.untracked.is_empty());
        assert_eq!(diff(&repo).unwrap(), json!({}));
    }

    #[test]
    fn test_status_kinds() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        fs::write(dir.path().join("keep"), "1").unwrap();
        fs::write(dir.path().join("change"), "1").unwrap();
        fs::write(dir.path().join("drop"), "1").unwrap();
        stage(&repo, &[], false).unwrap();
        commit(&repo, "first", false).unwrap();

        fs::write(dir.path().join("change"), "2").unwrap();
        fs::remove_file(dir.path().join("drop")).unwrap();
        fs::write(dir.path().join("added.json"), r#"{"a":1}"#).unwrap();
        fs::write(dir.path().join("loose"), "x").unwrap();
        stage(&repo, &["added.json".to_string()], false).unwrap();

        let status = status(&repo).unwrap();
        assert_eq!(status.new, vec!["added.json"]);
        assert_eq!(status.changed, vec!["change"]);
        assert_eq!(status.removed, vec!["drop"]);
        assert_eq!(status.untracked, vec!["loose"]);

        let patch = diff(&repo).unwrap();
        assert_eq!(patch["drop"], Value::Null);
        assert_eq!(patch["added.json"], json!({"a": 1}));
    }

    #[test]
    fn test_null_inside_inline_value_is_a_change() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        fs::write(dir.path().join("run.json"), r#"{"a":1,"b":1}"#).unwrap();
        stage(&repo, &[], false).unwrap();
        commit(&repo, "first", false).unwrap();

        fs::write(dir.path().join("run.json"), r#"{"a":null,"b":1}"#).unwrap();
        let status = status(&repo).unwrap();
        assert_eq!(status.changed, vec!["run.json"]);
        assert!(status.removed.is_empty());
    }
}
