//! partial-tree selection over state documents
//!
//! a fragment is a comma separated list of key prefixes; a leading `-`
//! excludes. prefixes match whole path segments, so `app` selects
//! `app/run.json` but not `apps/run.json`. the `#spec` key is never
//! filtered out.

use std::fmt;

use crate::error::Result;
use crate::json::merge_patch;
use crate::types::{State, SPEC_KEY};

/// how `merge` combines an overlay with its base
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergeMode {
    /// selected base keys are dropped and replaced by the overlay
    #[default]
    Replace,
    /// the overlay is applied to the selected base as a merge-patch
    Merge,
}

/// parsed fragment selector
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fragment {
    positives: Vec<String>,
    negatives: Vec<String>,
}

impl Fragment {
    pub fn parse(spec: &str) -> Self {
        let mut fragment = Self::default();
        for token in spec.split(',').map(str::trim) {
            let (negative, token) = match token.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, token),
            };
            let token = token.trim_matches('/');
            if token.is_empty() {
                continue;
            }
            if negative {
                fragment.negatives.push(token.to_string());
            } else {
                fragment.positives.push(token.to_string());
            }
        }
        fragment
    }

    /// true when the fragment selects everything
    pub fn is_empty(&self) -> bool {
        self.positives.is_empty() && self.negatives.is_empty()
    }

    pub fn positives(&self) -> &[String] {
        &self.positives
    }

    pub fn negatives(&self) -> &[String] {
        &self.negatives
    }

    pub fn matches(&self, key: &str) -> bool {
        if key == SPEC_KEY {
            return true;
        }
        let included =
            self.positives.is_empty() || self.positives.iter().any(|p| has_prefix(key, p));
        included && !self.negatives.iter().any(|n| has_prefix(key, n))
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<String> = self
            .positives
            .iter()
            .cloned()
            .chain(self.negatives.iter().map(|n| format!("-{n}")))
            .collect();
        write!(f, "{}", tokens.join(","))
    }
}

/// `key` is `prefix` itself or lives below it
pub(crate) fn has_prefix(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn replace_prefix(key: &str, from: &str, to: &str) -> String {
    format!("{to}{}", &key[from.len()..])
}

/// restrict a state to the keys a fragment selects
pub fn filter(state: &State, fragment: &Fragment) -> State {
    state
        .iter()
        .filter(|(k, _)| fragment.matches(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// rename matched top-level prefixes one-to-one
///
/// only applies when both sides name the same number of prefixes; otherwise
/// the state is returned unchanged.
pub fn rename(state: &State, src: &Fragment, dst: &Fragment) -> State {
    if src.positives.is_empty() || src.positives.len() != dst.positives.len() {
        return state.clone();
    }
    state
        .iter()
        .map(|(k, v)| {
            let renamed = src
                .positives
                .iter()
                .zip(&dst.positives)
                .find(|(from, _)| has_prefix(k, from))
                .map(|(from, to)| replace_prefix(k, from, to))
                .unwrap_or_else(|| k.clone());
            (renamed, v.clone())
        })
        .collect()
}

/// combine `overlay` into `base`, scoped by the source and destination fragments
pub fn merge(
    base: &State,
    overlay: &State,
    src: &Fragment,
    dst: &Fragment,
    mode: MergeMode,
) -> Result<State> {
    let renames = !src.positives.is_empty() && src.positives.len() == dst.positives.len();

    // nothing to bring in: a pure move inside the base
    if renames && overlay_is_empty(overlay) {
        return Ok(rename(base, src, dst));
    }

    match mode {
        MergeMode::Replace => Ok(merge_replace(base, overlay, src, dst, renames)),
        MergeMode::Merge => merge_patch_mode(base, overlay, src, dst),
    }
}

fn overlay_is_empty(overlay: &State) -> bool {
    overlay.keys().all(|k| k == SPEC_KEY)
}

fn merge_replace(
    base: &State,
    overlay: &State,
    src: &Fragment,
    dst: &Fragment,
    renames: bool,
) -> State {
    if src.positives.is_empty() {
        return filter(&filter(overlay, src), dst);
    }

    let mut result = base.clone();
    let dropped: &[String] = if dst.positives.is_empty() {
        &src.positives
    } else {
        &dst.positives
    };
    result.retain(|k, _| k == SPEC_KEY || !dropped.iter().any(|p| has_prefix(k, p)));

    let mut incoming = filter(overlay, src);
    if renames {
        incoming = rename(&incoming, src, dst);
    }
    for (key, value) in incoming {
        if key != SPEC_KEY {
            result.insert(key, value);
        }
    }

    result.retain(|k, _| !dst.negatives.iter().any(|n| has_prefix(k, n)));
    result
}

fn merge_patch_mode(base: &State, overlay: &State, src: &Fragment, dst: &Fragment) -> Result<State> {
    let mut incoming = filter(overlay, src);
    incoming = rename(&incoming, src, dst);

    let selected = filter(base, dst);
    let merged = State::from_value(merge_patch(&selected.to_value(), &incoming.to_value()))?;

    let mut result: State = base
        .iter()
        .filter(|(k, _)| !selected.contains_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, value) in merged {
        result.insert(key, value);
    }
    Ok(result)
}
