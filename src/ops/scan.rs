use std::path::Path;

use glob::{MatchOptions, Pattern};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::hash_file;
use crate::json;
use crate::repo::Repo;
use crate::types::{is_json_key, is_reserved, Staged, StagedEntry, State, StateValue, SPEC_KEY};

/// the working copy as a state document
#[derive(Clone, Debug, Default)]
pub struct WorkingCopy {
    pub document: State,
    /// files on disk that are neither committed nor staged
    pub untracked: Vec<String>,
}

/// walk the working copy and build its state document
///
/// tracked json files are parsed and embedded; everything else contributes
/// its digest.
pub fn working_document(repo: &Repo) -> Result<WorkingCopy> {
    let pristine = repo.pristine()?;
    let staged = repo.staged()?;
    working_document_with(repo, &pristine, &staged)
}

pub(crate) fn working_document_with(
    repo: &Repo,
    pristine: &State,
    staged: &Staged,
) -> Result<WorkingCopy> {
    let mut working = WorkingCopy::default();
    if let Some(spec) = pristine.get(SPEC_KEY) {
        working.document.insert(SPEC_KEY, spec.clone());
    }

    for (key, path) in walk_files(repo.root())? {
        let staged_entry = staged.get(&key);
        let pristine_value = pristine.get(&key);
        if staged_entry.is_none() && pristine_value.is_none() {
            working.untracked.push(key);
            continue;
        }

        let value = if embeds_inline(&key, pristine_value, staged_entry) {
            let bytes = std::fs::read(&path).with_path(&path)?;
            StateValue::Inline(json::parse(&bytes, &key)?)
        } else {
            StateValue::ObjectRef(hash_file(&path)?)
        };
        working.document.insert(key, value);
    }

    Ok(working)
}

fn embeds_inline(key: &str, pristine: Option<&StateValue>, staged: Option<&StagedEntry>) -> bool {
    if staged.is_some_and(|s| s.force_object) {
        return false;
    }
    match pristine {
        Some(StateValue::Inline(_)) => true,
        Some(_) => false,
        None => is_json_key(key),
    }
}

/// record the digests of matching files as staged additions
///
/// an empty glob list or `["."]` stages every file of the working copy.
/// returns the keys that were staged.
pub fn stage(repo: &Repo, globs: &[String], force_object: bool) -> Result<Vec<String>> {
    let matcher = KeyMatcher::new(globs)?;
    let mut staged = repo.staged()?;
    let mut added = Vec::new();

    for (key, path) in walk_files(repo.root())? {
        if !matcher.matches(&key) {
            continue;
        }
        record(&mut staged, &key, &path, force_object)?;
        added.push(key);
    }

    repo.write_staged(&staged)?;
    Ok(added)
}

/// stage files by exact key; keys are never read as globs
///
/// keys without a file in the working copy are passed over.
pub fn stage_keys(repo: &Repo, keys: &[String], force_object: bool) -> Result<Vec<String>> {
    let mut staged = repo.staged()?;
    let mut added = Vec::new();
    for key in keys {
        if is_reserved(key) {
            continue;
        }
        let path = repo.working_path(key)?;
        if !path.is_file() {
            debug!(key = %key, "nothing to stage");
            continue;
        }
        record(&mut staged, key, &path, force_object)?;
        added.push(key.clone());
    }
    repo.write_staged(&staged)?;
    Ok(added)
}

fn record(staged: &mut Staged, key: &str, path: &Path, force_object: bool) -> Result<()> {
    let hash = hash_file(path)?;
    debug!(key = %key, digest = %hash, force_object, "staging");
    staged.insert(
        key.to_string(),
        StagedEntry {
            sha: hash.to_hex(),
            force_object,
        },
    );
    Ok(())
}

struct KeyMatcher {
    all: bool,
    patterns: Vec<(String, Pattern)>,
}

impl KeyMatcher {
    fn new(globs: &[String]) -> Result<Self> {
        let all = globs.is_empty() || globs.iter().any(|g| g == "." || g == "./");
        let patterns = globs
            .iter()
            .map(|g| {
                let g = g.trim_start_matches("./").trim_end_matches('/').to_string();
                Pattern::new(&g)
                    .map(|p| (g.clone(), p))
                    .map_err(|e| Error::InvalidGlob {
                        pattern: g.clone(),
                        message: e.to_string(),
                    })
            })
            .collect::<Result<_>>()?;
        Ok(Self { all, patterns })
    }

    fn matches(&self, key: &str) -> bool {
        if self.all {
            return true;
        }
        let options = MatchOptions {
            require_literal_separator: false,
            ..Default::default()
        };
        self.patterns.iter().any(|(raw, pattern)| {
            pattern.matches_with(key, options)
                || key
                    .strip_prefix(raw.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// every non-reserved file below `root`, as (key, path), sorted by key
pub(crate) fn walk_files(root: &Path) -> Result<Vec<(String, std::path::PathBuf)>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_reserved_entry(root, e));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            Error::Io {
                path,
                source: e.into(),
            }
        })?;
        let is_file = entry.file_type().is_file()
            || (entry.file_type().is_symlink() && entry.path().is_file());
        if !is_file {
            continue;
        }
        if let Some(key) = key_for(root, entry.path()) {
            files.push((key, entry.into_path()));
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn is_reserved_entry(root: &Path, entry: &DirEntry) -> bool {
    entry.depth() > 0 && key_for(root, entry.path()).is_some_and(|k| is_reserved(&k))
}

fn key_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}
