//! which state keys a signature covers

use std::collections::BTreeSet;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{State, SPEC_KEY};

/// file names never signed unless asked for
pub const DEFAULT_EXCLUDE: [&str; 2] = ["src.json", "pvs.json"];

/// signature file name inside a part
pub const PVS_FILE: &str = "pvs.json";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// selector embedded in the protected header as `pvs`
///
/// patterns are relative to `part`; `*` stays within one path segment and
/// `**` crosses segments. exclude always wins over include.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignMatch {
    #[serde(default)]
    pub part: String,
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl SignMatch {
    /// everything under `part` but the default excludes
    pub fn for_part(part: &str) -> Self {
        Self {
            part: part.trim_matches('/').to_string(),
            include: vec!["**".to_string()],
            exclude: DEFAULT_EXCLUDE.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// state key of this part's signature file
    pub fn pvs_key(&self) -> String {
        if self.part.is_empty() {
            PVS_FILE.to_string()
        } else {
            format!("{}/{PVS_FILE}", self.part)
        }
    }

    /// `key` relative to the part, if it lies under it
    fn relative<'k>(&self, key: &'k str) -> Option<&'k str> {
        if self.part.is_empty() {
            return Some(key);
        }
        key.strip_prefix(self.part.as_str())?.strip_prefix('/')
    }

    /// split the keys of `state` under the part by coverage
    pub fn classify(&self, state: &State) -> Result<Coverage> {
        let include = compile(&self.include)?;
        let exclude = compile(&self.exclude)?;

        let mut coverage = Coverage::default();
        for key in state.keys() {
            if key == SPEC_KEY {
                continue;
            }
            let Some(rel) = self.relative(key) else {
                continue;
            };
            let hit = |patterns: &[Pattern]| patterns.iter().any(|p| p.matches_with(rel, MATCH_OPTIONS));
            if hit(&exclude) {
                coverage.excluded.insert(key.clone());
            } else if hit(&include) {
                coverage.protected.insert(key.clone());
            } else {
                coverage.not_seen.insert(key.clone());
            }
        }
        Ok(coverage)
    }

    /// the sub-state that gets signed
    pub fn payload(&self, state: &State) -> Result<State> {
        let coverage = self.classify(state)?;
        Ok(state
            .iter()
            .filter(|(k, _)| coverage.protected.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| Error::InvalidGlob {
                pattern: p.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

/// keys under a part, by how a signature treats them
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Coverage {
    pub protected: BTreeSet<String>,
    pub excluded: BTreeSet<String>,
    pub not_seen: BTreeSet<String>,
}
