//! remote endpoints: discovery, state and object metadata

use std::path::{Path, PathBuf};

use reqwest::blocking::Response;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::fragment::Fragment;
use crate::hash::Hash;
use crate::object::ObjectPool;
use crate::repo::Repo;
use crate::session::{expect_success, Session};
use crate::types::State;

/// discovery document name under a remote url
pub const DISCOVERY: &str = ".pvrremote";

/// header that tells a materialised link from a stored object
pub const OBJECT_TYPE_HEADER: &str = "Pantahub-Object-Type";

/// the remote's `.pvrremote` document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteInfo {
    #[serde(default)]
    pub pvr_spec: String,
    pub json_get_url: String,
    /// key the posted state is wrapped under; empty means `post`
    #[serde(default)]
    pub json_key: String,
    pub objects_endpoint: String,
    pub post_url: String,
    #[serde(default)]
    pub post_fields: Vec<String>,
    #[serde(default)]
    pub post_fields_opt: Vec<String>,
}

impl RemoteInfo {
    pub fn post_key(&self) -> &str {
        if self.json_key.is_empty() {
            "post"
        } else {
            &self.json_key
        }
    }

    pub fn object_url(&self, hash: &Hash) -> String {
        format!("{}/{}", self.objects_endpoint.trim_end_matches('/'), hash)
    }
}

/// object metadata exchanged with the objects endpoint
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    #[serde(rename = "objectname", default)]
    pub object_name: String,
    #[serde(rename = "sha256sum", default)]
    pub sha256sum: String,
    /// decimal byte count
    #[serde(default)]
    pub size: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    #[serde(rename = "signed-puturl", default, skip_serializing_if = "String::is_empty")]
    pub signed_put_url: String,
    #[serde(rename = "signed-geturl", default, skip_serializing_if = "String::is_empty")]
    pub signed_get_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub now: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expire_time: String,
}

impl ObjectMeta {
    /// upload request for an object
    pub fn for_upload(name: &str, hash: &Hash, size: u64) -> Self {
        Self {
            object_name: name.to_string(),
            sha256sum: hash.to_hex(),
            size: size.to_string(),
            mime_type: "application/octet-stream".to_string(),
            ..Self::default()
        }
    }
}

/// where a remote operation goes
#[derive(Clone, Debug)]
pub enum Target {
    Http(Url),
    Local(LocalRemote),
}

/// a directory with a `json` state and an object pool
#[derive(Clone, Debug)]
pub struct LocalRemote {
    pub json_path: PathBuf,
    pub pool: ObjectPool,
}

impl LocalRemote {
    /// a pvr checkout or a bare `json` + `objects/` directory
    pub fn open(path: &Path) -> Result<Self> {
        if path.join(crate::repo::META_DIR).join("json").is_file() {
            let repo = Repo::open(path)?;
            return Ok(Self {
                json_path: repo.json_path(),
                pool: repo.pool().clone(),
            });
        }
        let json_path = path.join("json");
        if json_path.is_file() {
            return Ok(Self {
                json_path,
                pool: ObjectPool::open_or_create(path.join("objects"))?,
            });
        }
        Err(Error::Missing(format!("no state document under {}", path.display())))
    }

    pub fn state(&self) -> Result<State> {
        let bytes = std::fs::read(&self.json_path).map_err(|source| Error::Io {
            path: self.json_path.clone(),
            source,
        })?;
        State::from_slice(&bytes, &self.json_path.display().to_string())
    }
}

impl Target {
    /// split `<url-or-path>[#fragment]`
    pub fn parse(spec: &str) -> Result<(Self, Fragment)> {
        let (location, fragment) = match spec.split_once('#') {
            Some((loc, frag)) => (loc, Fragment::parse(frag)),
            None => (spec, Fragment::default()),
        };
        if location.is_empty() {
            return Err(Error::InvalidUrl {
                url: spec.to_string(),
                message: "empty remote".into(),
            });
        }

        match Url::parse(location) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok((Target::Http(url), fragment)),
            Ok(url) if url.scheme() == "file" => {
                let path = url.to_file_path().map_err(|_| Error::InvalidUrl {
                    url: location.to_string(),
                    message: "not a local path".into(),
                })?;
                Ok((Target::Local(LocalRemote::open(&path)?), fragment))
            }
            Ok(url) => Err(Error::InvalidUrl {
                url: location.to_string(),
                message: format!("unsupported scheme {}", url.scheme()),
            }),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok((Target::Local(LocalRemote::open(Path::new(location))?), fragment))
            }
            Err(e) => Err(Error::InvalidUrl {
                url: location.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

/// an http remote after discovery
pub struct Remote<'s> {
    session: &'s Session,
    url: Url,
    info: RemoteInfo,
}

impl<'s> Remote<'s> {
    /// fetch `<url>/.pvrremote`
    pub fn discover(session: &'s Session, url: &Url) -> Result<Self> {
        let discovery = format!("{}/{DISCOVERY}", url.as_str().trim_end_matches('/'));
        debug!(url = %discovery, "discovering remote");
        let response = expect_success(session.send(|client, bearer| {
            authorized(client.get(&discovery), bearer)
        })?)?;
        let info: RemoteInfo = read_json(response)?;
        Ok(Self {
            session,
            url: url.clone(),
            info,
        })
    }

    /// a remote whose endpoints are already known
    pub fn with_info(session: &'s Session, url: Url, info: RemoteInfo) -> Self {
        Self { session, url, info }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn info(&self) -> &RemoteInfo {
        &self.info
    }

    pub fn session(&self) -> &'s Session {
        self.session
    }

    /// the remote's current state; `None` when it has none yet
    pub fn state(&self) -> Result<Option<State>> {
        let url = &self.info.json_get_url;
        let response = self
            .session
            .send(|client, bearer| authorized(client.get(url), bearer))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success(response)?;
        let bytes = response.bytes()?;
        State::from_slice(&bytes, url).map(Some)
    }

    /// metadata, including the signed download url, of one object
    pub fn object_meta(&self, hash: &Hash) -> Result<ObjectMeta> {
        let url = self.info.object_url(hash);
        let response = expect_success(
            self.session
                .send(|client, bearer| authorized(client.get(&url), bearer))?,
        )?;
        read_json(response)
    }
}

pub(crate) fn authorized(
    request: reqwest::blocking::RequestBuilder,
    bearer: Option<&str>,
) -> reqwest::blocking::RequestBuilder {
    match bearer {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let url = response.url().to_string();
    let bytes = response.bytes()?;
    serde_json::from_slice(&bytes).map_err(|e| Error::json(url, e))
}

/// value of `Pantahub-Object-Type`, if sent
pub(crate) fn object_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(OBJECT_TYPE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
