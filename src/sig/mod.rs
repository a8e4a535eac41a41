//! signing parts of the state with detached JWS (`pvs.json`)

mod jws;
mod scope;
mod x509;

pub use jws::{DetachedJws, Jwk, ProtectedHeader, SigningKey, PVS_SPEC, PVS_TYPE};
pub use scope::{Coverage, SignMatch, DEFAULT_EXCLUDE, PVS_FILE};
pub use x509::{load_roots, read_pem_certs, verify_chain, SYSTEM_STORE};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use jsonwebtoken::DecodingKey;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::{ensure_parent_dir, write_atomic};
use crate::json;
use crate::ops::stage_keys;
use crate::repo::Repo;
use crate::types::StateValue;

#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    /// pem bundle whose certificates go into `x5c`, leaf first
    pub x5c: Option<PathBuf>,
    pub extra_headers: Map<String, Value>,
}

/// what a signature is checked against
#[derive(Debug, Clone)]
pub enum VerifyKey {
    /// rsa public key or certificate pem
    PublicKey(PathBuf),
    /// ca bundle validating the `x5c` chain, or [`SYSTEM_STORE`]
    CaStore(String),
}

/// keys under a signed part, by coverage
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySummary {
    pub protected: Vec<String>,
    pub excluded: Vec<String>,
    pub not_seen: Vec<String>,
    #[serde(rename = "fullJSONWebSignature", skip_serializing_if = "Vec::is_empty")]
    pub full_jws: Vec<Value>,
}

impl VerifySummary {
    /// union with another summary; anything protected by either is no
    /// longer reported as excluded or unseen
    pub fn merge(&mut self, other: VerifySummary) {
        let union = |a: &mut Vec<String>, b: Vec<String>| {
            let set: BTreeSet<String> = a.drain(..).chain(b).collect();
            *a = set.into_iter().collect();
        };
        union(&mut self.protected, other.protected);
        union(&mut self.excluded, other.excluded);
        union(&mut self.not_seen, other.not_seen);

        let protected: BTreeSet<&String> = self.protected.iter().collect();
        self.excluded.retain(|k| !protected.contains(k));
        self.not_seen.retain(|k| !protected.contains(k));
        self.full_jws.extend(other.full_jws);
    }
}

/// sign the pristine keys `selector` picks and stage `<part>/pvs.json`
///
/// returns the key of the written signature.
pub fn sign(repo: &Repo, private_key: &Path, selector: &SignMatch, opts: &SignOptions) -> Result<String> {
    let pem = std::fs::read(private_key).with_path(private_key)?;
    let key = SigningKey::from_pem(&pem)?;

    let mut header = ProtectedHeader::new(selector.clone()).with_extra(&opts.extra_headers)?;
    if let Some(bundle) = &opts.x5c {
        header.x5c = Some(x509::encode_x5c(&read_pem_certs(bundle)?));
    }

    let pristine = repo.pristine()?;
    let payload = selector.payload(&pristine)?;
    if payload.is_empty() {
        return Err(Error::Missing(format!(
            "nothing to sign under {:?}",
            selector.part
        )));
    }
    let jws = key.sign_detached(header, &payload.to_canonical())?;

    let pvs_key = selector.pvs_key();
    let path = repo.working_path(&pvs_key)?;
    ensure_parent_dir(&path)?;
    write_atomic(&path, &json::to_pretty_vec(&jws.to_value())?)?;
    stage_keys(repo, std::slice::from_ref(&pvs_key), false)?;

    info!(signature = %pvs_key, keys = payload.len(), "signed");
    Ok(pvs_key)
}

/// check the signature at `pvs_key` against the current pristine state
pub fn verify(repo: &Repo, key: &VerifyKey, pvs_key: &str, with_payload: bool) -> Result<VerifySummary> {
    let pristine = repo.pristine()?;
    let document = match pristine.get(pvs_key) {
        Some(StateValue::Inline(value)) => value.clone(),
        Some(_) => {
            return Err(Error::Signature(format!("{pvs_key} is not a signature document")))
        }
        None => {
            let path = repo.working_path(pvs_key)?;
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::Missing(format!("signature {pvs_key}")))
                }
                Err(e) => return Err(e).with_path(&path),
            };
            json::parse(&bytes, pvs_key)?
        }
    };

    let jws = DetachedJws::from_value(document)?;
    let header = jws.header()?;
    let payload = header.pvs.payload(&pristine)?.to_canonical();

    let decoding = decoding_key(key, &header)?;
    jws.verify(&payload, &decoding)?;

    let coverage = header.pvs.classify(&pristine)?;
    Ok(VerifySummary {
        protected: coverage.protected.into_iter().collect(),
        excluded: coverage.excluded.into_iter().collect(),
        not_seen: coverage.not_seen.into_iter().collect(),
        full_jws: if with_payload {
            vec![jws.with_payload(&payload)]
        } else {
            Vec::new()
        },
    })
}

/// verify every `pvs.json` in the pristine state and merge the summaries
pub fn verify_all(repo: &Repo, key: &VerifyKey, with_payload: bool) -> Result<VerifySummary> {
    let pristine = repo.pristine()?;
    let signatures: Vec<String> = pristine
        .keys()
        .filter(|k| k.as_str() == PVS_FILE || k.ends_with(&format!("/{PVS_FILE}")))
        .cloned()
        .collect();
    if signatures.is_empty() {
        return Err(Error::Missing("no signatures in state".into()));
    }

    let mut summary = VerifySummary::default();
    for pvs_key in signatures {
        summary.merge(verify(repo, key, &pvs_key, with_payload)?);
    }
    Ok(summary)
}

fn decoding_key(key: &VerifyKey, header: &ProtectedHeader) -> Result<DecodingKey> {
    match key {
        VerifyKey::PublicKey(path) => {
            let pem = std::fs::read(path).with_path(path)?;
            if let Ok(certs) = x509::pem_certs(&pem) {
                let leaf = x509_parser::parse_x509_certificate(&certs[0])
                    .map_err(|e| Error::Signature(format!("bad certificate: {e}")))?
                    .1;
                return Ok(DecodingKey::from_rsa_der(
                    &leaf.public_key().subject_public_key.data,
                ));
            }
            Ok(DecodingKey::from_rsa_pem(&pem)?)
        }
        VerifyKey::CaStore(store) => {
            let chain = header
                .x5c
                .as_ref()
                .ok_or_else(|| Error::Signature("signature carries no x5c chain".into()))?;
            let chain = x509::decode_x5c(chain)?;
            let roots = load_roots(store)?;
            Ok(DecodingKey::from_rsa_der(&verify_chain(&chain, &roots)?))
        }
    }
}
