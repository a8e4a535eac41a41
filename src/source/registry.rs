//! docker registry v2 client: manifests and layer blobs

use std::collections::BTreeSet;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::object::ObjectPool;
use crate::session::{expect_success, split_challenge, Credentials};
use crate::source::reference::ImageRef;
use crate::transport::{run_jobs, Job, Progress, ProgressReader, DOWNLOAD_WORKERS};

pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";

pub const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// which manifest format the layers were read from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestSchema {
    V2,
    Oci,
    /// legacy `fsLayers`, listed newest first on the wire
    V1,
}

/// an image manifest narrowed down to one platform
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedManifest {
    /// `Docker-Content-Digest` of the requested reference
    pub digest: String,
    /// layer digests, base layer first
    pub layers: Vec<Hash>,
    pub schema: ManifestSchema,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<PlatformDescriptor>,
    #[serde(default)]
    fs_layers: Vec<FsLayer>,
}

#[derive(Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Deserialize)]
struct PlatformDescriptor {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Deserialize)]
struct Platform {
    architecture: String,
    #[serde(default)]
    variant: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FsLayer {
    blob_sum: String,
}

#[derive(Deserialize)]
struct TokenReply {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// read-only client for one image repository
pub struct RegistryClient<'a> {
    client: &'a Client,
    image: ImageRef,
    credentials: Option<Credentials>,
    // full Authorization header value once negotiated
    authorization: Mutex<Option<String>>,
}

struct BlobJob {
    name: String,
    hash: Hash,
}

impl Job for BlobJob {
    fn name(&self) -> &str {
        &self.name
    }
}

impl<'a> RegistryClient<'a> {
    pub fn new(client: &'a Client, image: ImageRef, credentials: Option<Credentials>) -> Self {
        Self {
            client,
            image,
            credentials,
            authorization: Mutex::new(None),
        }
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    /// fetch the manifest for the reference and pick the layers for `arch`
    ///
    /// `arch` is a docker platform like `arm64` or `arm/v7`.
    pub fn manifest(&self, arch: &str) -> Result<ResolvedManifest> {
        let (raw, digest) = self.fetch_manifest(&self.image.manifest_reference())?;

        if !raw.manifests.is_empty() {
            let entry = select_platform(&raw.manifests, arch);
            debug!(image = %self.image, arch, entry = %entry.digest, "selected platform manifest");
            let (inner, _) = self.fetch_manifest(&entry.digest)?;
            if !inner.manifests.is_empty() {
                return Err(Error::Malformed {
                    what: "image manifest",
                    message: format!("nested manifest list for {}", self.image),
                });
            }
            return Ok(ResolvedManifest {
                digest,
                ..resolve_layers(inner)?
            });
        }

        Ok(ResolvedManifest {
            digest,
            ..resolve_layers(raw)?
        })
    }

    fn fetch_manifest(&self, reference: &str) -> Result<(RawManifest, String)> {
        let url = format!("{}/manifests/{reference}", self.image.base_url());
        let accept = [MANIFEST_V2, MANIFEST_LIST, OCI_MANIFEST, OCI_INDEX, MANIFEST_V1].join(", ");
        let response = self.get(&url, Some(&accept))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::Missing(format!("image {} ({reference})", self.image)));
        }
        let response = expect_success(response)?;
        let header_digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes()?;
        let digest =
            header_digest.unwrap_or_else(|| format!("sha256:{}", Hash::of_bytes(&body)));
        let raw: RawManifest = serde_json::from_slice(&body)
            .map_err(|e| Error::json(format!("manifest of {}", self.image), e))?;
        Ok((raw, digest))
    }

    /// download every layer into `pool`, verifying each digest
    pub fn fetch_layers(
        &self,
        manifest: &ResolvedManifest,
        pool: &ObjectPool,
        progress: &Progress,
    ) -> Result<u64> {
        let mut seen = BTreeSet::new();
        let jobs: Vec<BlobJob> = manifest
            .layers
            .iter()
            .filter(|hash| seen.insert(**hash))
            .map(|hash| BlobJob {
                name: format!("sha256:{hash}"),
                hash: *hash,
            })
            .collect();
        info!(image = %self.image, layers = jobs.len(), "downloading layers");

        let sizes = run_jobs(jobs, DOWNLOAD_WORKERS, |job| {
            if pool.ensure_valid(&job.hash)? {
                progress.finished(&job.name, "cached");
                return Ok(0);
            }
            let url = format!("{}/blobs/{}", self.image.base_url(), job.name);
            let response = expect_success(self.get(&url, None)?)?;
            let total = response.content_length();
            let mut reader = ProgressReader::new(response, progress.job(&job.name, total));
            let bytes = pool.put_expected(&job.hash, &mut reader)?;
            progress.finished(&job.name, "downloaded");
            Ok(bytes)
        })?;
        Ok(sizes.into_iter().sum())
    }

    /// GET with the negotiated authorization, answering one challenge
    fn get(&self, url: &str, accept: Option<&str>) -> Result<Response> {
        let send = |authorization: Option<&str>| {
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if let Some(authorization) = authorization {
                request = request.header(AUTHORIZATION, authorization);
            }
            request.send()
        };

        let current = self.authorization.lock().ok().and_then(|a| a.clone());
        let response = send(current.as_deref())?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let Some(challenge) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            return expect_success(response);
        };

        let authorization = self.authenticate(&challenge)?;
        if let Ok(mut slot) = self.authorization.lock() {
            *slot = Some(authorization.clone());
        }
        Ok(send(Some(&authorization))?)
    }

    fn authenticate(&self, challenge: &str) -> Result<String> {
        let (scheme, params) = split_challenge(challenge)?;

        if scheme.eq_ignore_ascii_case("basic") {
            let creds = self.credentials.as_ref().ok_or_else(|| {
                Error::Auth(format!("registry {} wants credentials", self.image.domain))
            })?;
            let raw = format!("{}:{}", creds.username, creds.password);
            return Ok(format!("Basic {}", STANDARD.encode(raw)));
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(Error::Challenge(format!("unsupported scheme in {challenge:?}")));
        }

        let realm = params
            .get("realm")
            .ok_or_else(|| Error::Challenge(format!("no realm in {challenge:?}")))?;
        let mut url = Url::parse(realm).map_err(|e| Error::InvalidUrl {
            url: realm.clone(),
            message: e.to_string(),
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = params.get("service") {
                query.append_pair("service", service);
            }
            let scope = params
                .get("scope")
                .cloned()
                .unwrap_or_else(|| self.image.pull_scope());
            query.append_pair("scope", &scope);
        }

        debug!(realm = %realm, image = %self.image, "requesting registry token");
        let mut request = self.client.get(url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request.send()?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Auth(format!("registry token for {} refused", self.image)));
        }
        let reply: TokenReply = expect_success(response)?.json()?;
        reply
            .token
            .or(reply.access_token)
            .map(|token| format!("Bearer {token}"))
            .ok_or_else(|| Error::Auth(format!("no token issued for {}", self.image)))
    }
}

fn select_platform<'m>(entries: &'m [PlatformDescriptor], arch: &str) -> &'m PlatformDescriptor {
    let (want_arch, want_variant) = match arch.split_once('/') {
        Some((a, v)) => (a, Some(v)),
        None => (arch, None),
    };
    entries
        .iter()
        .find(|entry| {
            entry.platform.as_ref().is_some_and(|p| {
                p.architecture == want_arch
                    && (want_variant.is_none() || p.variant.as_deref() == want_variant)
            })
        })
        .unwrap_or(&entries[0])
}

fn resolve_layers(raw: RawManifest) -> Result<ResolvedManifest> {
    let media_type = raw.media_type.as_deref().unwrap_or_default();
    let (schema, digests): (ManifestSchema, Vec<String>) = if raw.schema_version == 1 {
        let newest_first = raw.fs_layers.into_iter().map(|l| l.blob_sum);
        (ManifestSchema::V1, newest_first.rev().collect())
    } else if media_type == OCI_MANIFEST {
        (
            ManifestSchema::Oci,
            raw.layers.into_iter().map(|l| l.digest).collect(),
        )
    } else {
        (
            ManifestSchema::V2,
            raw.layers.into_iter().map(|l| l.digest).collect(),
        )
    };

    if digests.is_empty() {
        return Err(Error::Malformed {
            what: "image manifest",
            message: "no layers".into(),
        });
    }
    let layers = digests
        .iter()
        .map(|d| Hash::from_prefixed(d))
        .collect::<Result<Vec<_>>>()?;
    Ok(ResolvedManifest {
        digest: String::new(),
        layers,
        schema,
    })
}
