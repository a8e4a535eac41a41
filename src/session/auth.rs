use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::fs::write_atomic_with_suffix;

const AUTH_SPEC: &str = "1";

/// a parsed `WWW-Authenticate` challenge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub realm: String,
    /// authentication endpoints from `ph-aeps`, in order
    pub endpoints: Vec<String>,
    pub scope: Option<String>,
    /// set when the server refuses the token outright; refresh is not attempted
    pub error: Option<String>,
}

impl Challenge {
    /// parse a `JWT` or `Bearer` challenge
    pub fn parse(header: &str) -> Result<Self> {
        let (scheme, params) = split_challenge(header)?;
        if !scheme.eq_ignore_ascii_case("jwt") && !scheme.eq_ignore_ascii_case("bearer") {
            return Err(Error::Challenge(format!("unsupported scheme in {header:?}")));
        }

        let realm = params
            .get("realm")
            .cloned()
            .ok_or_else(|| Error::Challenge(format!("no realm in {header:?}")))?;
        let endpoints: Vec<String> = params
            .get("ph-aeps")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if endpoints.is_empty() {
            return Err(Error::Challenge(format!("no ph-aeps in {header:?}")));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            realm,
            endpoints,
            scope: params.get("scope").cloned(),
            error: params.get("error").cloned(),
        })
    }

    /// the endpoint used for refresh and login
    pub fn endpoint(&self) -> &str {
        &self.endpoints[0]
    }

    /// key under which tokens for this challenge are stored
    pub fn store_key(&self) -> String {
        store_key(self.endpoint(), &self.realm)
    }
}

pub fn store_key(endpoint: &str, realm: &str) -> String {
    format!("{endpoint} realm={realm}")
}

/// scheme and lowercased parameters of any `WWW-Authenticate` value
pub(crate) fn split_challenge(header: &str) -> Result<(String, BTreeMap<String, String>)> {
    let header = header.trim();
    let (scheme, rest) = header
        .split_once(char::is_whitespace)
        .unwrap_or((header, ""));
    let params =
        parse_params(rest).map_err(|msg| Error::Challenge(format!("{msg} in {header:?}")))?;
    Ok((scheme.to_string(), params))
}

/// `k=v, k="quoted, value"` parameters of a challenge
fn parse_params(input: &str) -> std::result::Result<BTreeMap<String, String>, String> {
    let mut params = BTreeMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(params);
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            name.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(format!("parameter {name:?} without value"));
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    c => value.push(c),
                }
            }
            if !closed {
                return Err("unterminated quoted value".to_string());
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        params.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
}

/// access and refresh token for one endpoint/realm
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(rename = "access-token")]
    pub access_token: String,
    #[serde(rename = "refresh-token", default)]
    pub refresh_token: String,
}

/// on-disk token cache, `<config-dir>/auth.json`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStore {
    pub spec: String,
    #[serde(default)]
    pub tokens: BTreeMap<String, TokenPair>,
    #[serde(skip)]
    path: PathBuf,
}

impl AuthStore {
    pub fn path(config_dir: &Path) -> PathBuf {
        config_dir.join("auth.json")
    }

    /// load the store, or start an empty one
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = Self::path(config_dir);
        let mut store = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<AuthStore>(&bytes)
                .map_err(|e| Error::json(path.display().to_string(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AuthStore {
                spec: AUTH_SPEC.to_string(),
                tokens: BTreeMap::new(),
                path: PathBuf::new(),
            },
            Err(e) => return Err(e).with_path(&path),
        };
        store.path = path;
        Ok(store)
    }

    pub fn get(&self, key: &str) -> Option<&TokenPair> {
        self.tokens.get(key)
    }

    pub fn insert(&mut self, key: String, tokens: TokenPair) {
        self.tokens.insert(key, tokens);
    }

    pub fn remove(&mut self, key: &str) -> Option<TokenPair> {
        self.tokens.remove(key)
    }

    /// persist through `auth.json.tmp` and a rename
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_path(dir)?;
        }
        let content = serde_json::to_vec_pretty(self).map_err(|e| Error::json("auth store", e))?;
        write_atomic_with_suffix(&self.path, &content, ".tmp")
    }
}
