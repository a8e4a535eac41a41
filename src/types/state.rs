use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::hash::{is_digest, Hash};
use crate::json;

/// key holding the schema tag of a state document
pub const SPEC_KEY: &str = "#spec";

/// schema tag written by `init`
pub const DEFAULT_SPEC: &str = "pantavisor-service-system@1";

/// directories in a working copy that never hold state
pub const RESERVED_PREFIXES: [&str; 2] = [".pvr", ".pv"];

/// true for keys under `.pvr/` or `.pv/`
pub fn is_reserved(key: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|prefix| {
        key == *prefix
            || key
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// keys whose files are parsed and embedded rather than pooled
pub fn is_json_key(key: &str) -> bool {
    key.ends_with(".json")
}

/// one value of a state document
#[derive(Clone, Debug, PartialEq)]
pub enum StateValue {
    /// the `#spec` schema tag
    Spec(String),
    /// a digest naming a pool object
    ObjectRef(Hash),
    /// a json subtree embedded in the document
    Inline(Value),
}

impl StateValue {
    /// discriminate a raw json value by key and shape
    pub fn classify(key: &str, value: Value) -> Result<Self> {
        if key == SPEC_KEY {
            return match value {
                Value::String(s) => Ok(StateValue::Spec(s)),
                other => Err(Error::Malformed {
                    what: "state",
                    message: format!("{SPEC_KEY} must be a string, found {other}"),
                }),
            };
        }
        match value {
            Value::String(s) if is_digest(&s) => Ok(StateValue::ObjectRef(Hash::from_hex(&s)?)),
            other => Ok(StateValue::Inline(other)),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            StateValue::Spec(s) => Value::String(s.clone()),
            StateValue::ObjectRef(hash) => Value::String(hash.to_hex()),
            StateValue::Inline(v) => v.clone(),
        }
    }

    pub fn object(&self) -> Option<Hash> {
        match self {
            StateValue::ObjectRef(hash) => Some(*hash),
            _ => None,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, StateValue::Inline(_))
    }
}

/// a state document: relative keys mapped to tagged values
#[derive(Clone, Debug, Default, PartialEq)]
pub struct State {
    entries: BTreeMap<String, StateValue>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// a document holding only the schema tag
    pub fn with_spec(spec: impl Into<String>) -> Self {
        let mut state = Self::new();
        state
            .entries
            .insert(SPEC_KEY.to_string(), StateValue::Spec(spec.into()));
        state
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let map = json::expect_object(value, "state document")?;
        Self::from_map(map)
    }

    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (key, value) in map {
            let value = StateValue::classify(&key, value)?;
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }

    pub fn from_slice(bytes: &[u8], context: &str) -> Result<Self> {
        Self::from_value(json::parse(bytes, context)?)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    pub fn to_canonical(&self) -> Vec<u8> {
        json::to_canonical_vec(&self.to_value())
    }

    pub fn to_pretty(&self) -> Result<Vec<u8>> {
        json::to_pretty_vec(&self.to_value())
    }

    /// schema tag, if present
    pub fn spec(&self) -> Option<&str> {
        match self.entries.get(SPEC_KEY) {
            Some(StateValue::Spec(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: StateValue) -> Option<StateValue> {
        self.entries.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<StateValue> {
        self.entries.remove(key)
    }

    pub fn retain(&mut self, f: impl FnMut(&String, &mut StateValue) -> bool) {
        self.entries.retain(f)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StateValue)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// keys holding object references, with their digests
    pub fn objects(&self) -> impl Iterator<Item = (&String, Hash)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.object().map(|h| (k, h)))
    }

    /// distinct digests referenced by the document
    pub fn digests(&self) -> BTreeSet<Hash> {
        self.objects().map(|(_, h)| h).collect()
    }
}

impl FromIterator<(String, StateValue)> for State {
    fn from_iter<I: IntoIterator<Item = (String, StateValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for State {
    type Item = (String, StateValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, StateValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// a file recorded by `add`, waiting for commit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedEntry {
    #[serde(rename = "Sha")]
    pub sha: String,
    #[serde(rename = "ForceObject", default)]
    pub force_object: bool,
}

/// staged additions keyed by working copy path
pub type Staged = BTreeMap<String, StagedEntry>;

/// working copy changes against the pristine document
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub new: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    pub untracked: Vec<String>,
}

impl Status {
    /// true when nothing would be committed
    pub fn is_clean(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DIGEST: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_classification() {
        let state = State::from_value(json!({
            "#spec": "pantavisor-service-system@1",
            "bsp/kernel.img": DIGEST,
            "bsp/run.json": {"linux": "kernel.img"},
            "note.txt": "short",
        }))
        .unwrap();

        assert_eq!(state.spec(), Some(DEFAULT_SPEC));
        assert_eq!(
            state.get("bsp/kernel.img"),
            Some(&StateValue::ObjectRef(Hash::from_hex(DIGEST).unwrap()))
        );
        assert!(state.get("bsp/run.json").unwrap().is_inline());
        assert!(state.get("note.txt").unwrap().is_inline());
        assert_eq!(state.digests().len(), 1);
    }

    #[test]
    fn test_spec_must_be_string() {
        let err = State::from_value(json!({"#spec": 1})).unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[test]
    fn test_document_must_be_object() {
        assert!(matches!(
            State::from_slice(b"[]", "json"),
            Err(Error::NotObject(_))
        ));
    }

    #[test]
    fn test_canonical_roundtrip_keeps_tags() {
        let src = format!(r##"{{"b.json":{{"z":1.50,"a":null}},"#spec":"x","a":"{DIGEST}"}}"##);
        let state = State::from_slice(src.as_bytes(), "json").unwrap();
        let bytes = state.to_canonical();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            format!(r##"{{"#spec":"x","a":"{DIGEST}","b.json":{{"a":null,"z":1.50}}}}"##)
        );
        assert_eq!(State::from_slice(&bytes, "json").unwrap(), state);
    }

    #[test]
    fn test_reserved_keys() {
        assert!(is_reserved(".pvr/json"));
        assert!(is_reserved(".pv/link"));
        assert!(is_reserved(".pvr"));
        assert!(!is_reserved(".pvrx/file"));
        assert!(!is_reserved("a/.pvr/json"));
    }

    #[test]
    fn test_staged_entry_field_names() {
        let mut staged = Staged::new();
        staged.insert(
            "a".into(),
            StagedEntry {
                sha: DIGEST.into(),
                force_object: true,
            },
        );
        let v = serde_json::to_value(&staged).unwrap();
        assert_eq!(v, json!({"a": {"Sha": DIGEST, "ForceObject": true}}));
    }
}
