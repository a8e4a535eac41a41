use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{Error, IoResultExt, Result};
use crate::fragment::has_prefix;
use crate::fs::{ensure_parent_dir, write_atomic};
use crate::hash::hash_file;
use crate::json;
use crate::ops::scan::stage_keys;
use crate::repo::Repo;
use crate::tools::{parse_root_hash, ToolBox};
use crate::types::{State, StateValue};

/// directory below a container holding verity manifests
pub const DM_DIR: &str = "_dm";

/// run.json fields that may name a volume
const VOLUME_FIELDS: [&str; 3] = ["modules", "firmware", "root-volume"];

/// sidecar manifest for a dm-verity protected volume
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmManifest {
    #[serde(rename = "type")]
    pub kind: String,
    pub data_device: String,
    pub hash_device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

impl DmManifest {
    pub fn new(volume: &str) -> Self {
        Self {
            kind: "dm-verity".to_string(),
            data_device: volume.to_string(),
            hash_device: format!("{volume}.hash"),
            root_hash: None,
            salt: None,
        }
    }
}

/// result of hashing one volume
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmVolume {
    pub container: String,
    pub volume: String,
    pub root_hash: String,
}

fn manifest_key(container: &str, volume: &str) -> String {
    format!("{container}/{DM_DIR}/{volume}.json")
}

/// protect `<container>/<volume>` with dm-verity and rewire the container to use it
pub fn dm_convert(
    repo: &Repo,
    tools: &dyn ToolBox,
    container: &str,
    volume: &str,
) -> Result<DmVolume> {
    let container = container.trim_matches('/');
    let key = manifest_key(container, volume);
    let pristine = repo.pristine()?;
    let manifest = load_manifest(repo, &pristine, &key)?.unwrap_or_else(|| DmManifest::new(volume));

    let result = regenerate(repo, tools, container, &key, manifest)?;

    let run_key = format!("{container}/run.json");
    let run_path = repo.working_path(&run_key)?;
    if run_path.is_file() {
        let mut run = read_object(&run_path, &run_key)?;
        mark_dm_volume(&mut run, volume);
        write_json(&run_path, &Value::Object(run))?;
        stage_keys(repo, &[run_key], false)?;
    }

    let src_key = format!("{container}/src.json");
    let src_path = repo.working_path(&src_key)?;
    let mut src = if src_path.is_file() {
        read_object(&src_path, &src_key)?
    } else {
        Map::new()
    };
    let enabled = src
        .entry("dm_enabled")
        .or_insert_with(|| Value::Object(Map::new()));
    if !enabled.is_object() {
        *enabled = Value::Object(Map::new());
    }
    if let Value::Object(map) = enabled {
        map.insert(volume.to_string(), Value::Bool(true));
    }
    write_json(&src_path, &Value::Object(src))?;
    stage_keys(repo, &[src_key], false)?;

    info!(container, volume, root_hash = %result.root_hash, "converted volume to dm-verity");
    Ok(result)
}

/// regenerate hash devices for every verity manifest under `prefix`
pub fn dm_apply(repo: &Repo, tools: &dyn ToolBox, prefix: &str) -> Result<Vec<DmVolume>> {
    let prefix = prefix.trim_matches('/');
    let pristine = repo.pristine()?;
    let mut applied = Vec::new();

    let keys: Vec<String> = pristine
        .keys()
        .filter(|k| prefix.is_empty() || has_prefix(k, prefix))
        .filter(|k| split_manifest_key(k).is_some())
        .cloned()
        .collect();

    for key in keys {
        let Some((container, _)) = split_manifest_key(&key) else {
            continue;
        };
        let manifest = load_manifest(repo, &pristine, &key)?
            .ok_or_else(|| Error::Missing(format!("dm manifest {key}")))?;
        applied.push(regenerate(repo, tools, container, &key, manifest)?);
    }
    Ok(applied)
}

/// `<container>/_dm/<volume>.json` split into (container, volume)
fn split_manifest_key(key: &str) -> Option<(&str, &str)> {
    let (container, rest) = key.split_once(&format!("/{DM_DIR}/"))?;
    let volume = rest.strip_suffix(".json")?;
    (!container.is_empty() && !volume.is_empty() && !volume.contains('/'))
        .then_some((container, volume))
}

fn load_manifest(repo: &Repo, pristine: &State, key: &str) -> Result<Option<DmManifest>> {
    let path = repo.working_path(key)?;
    let value = if path.is_file() {
        let bytes = std::fs::read(&path).with_path(&path)?;
        json::parse(&bytes, key)?
    } else {
        match pristine.get(key) {
            Some(StateValue::Inline(v)) => v.clone(),
            _ => return Ok(None),
        }
    };
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| Error::json(key, e))
}

fn regenerate(
    repo: &Repo,
    tools: &dyn ToolBox,
    container: &str,
    key: &str,
    mut manifest: DmManifest,
) -> Result<DmVolume> {
    let data_key = format!("{container}/{}", manifest.data_device);
    let hash_key = format!("{container}/{}", manifest.hash_device);
    let data = repo.working_path(&data_key)?;
    let hash = repo.working_path(&hash_key)?;
    if !data.is_file() {
        return Err(Error::Missing(format!("data device {data_key}")));
    }

    let salt = match &manifest.salt {
        Some(salt) => salt.clone(),
        None => hash_file(&data)?.to_hex(),
    };
    let report = tools.verity_format(&data, &hash, &salt)?;
    let root_hash = parse_root_hash(&report)?;

    manifest.salt = Some(salt);
    manifest.root_hash = Some(root_hash.clone());
    let manifest_path = repo.working_path(key)?;
    ensure_parent_dir(&manifest_path)?;
    let value = serde_json::to_value(&manifest).map_err(|e| Error::json(key, e))?;
    write_json(&manifest_path, &value)?;

    stage_keys(repo, &[hash_key], true)?;
    stage_keys(repo, &[key.to_string()], false)?;

    Ok(DmVolume {
        container: container.to_string(),
        volume: manifest.data_device,
        root_hash,
    })
}

/// rewrite every reference to `volume` in a run.json as `dm:<volume>`
fn mark_dm_volume(run: &mut Map<String, Value>, volume: &str) {
    let dm = format!("dm:{volume}");
    for field in VOLUME_FIELDS {
        if let Some(value) = run.get_mut(field) {
            if value.as_str() == Some(volume) {
                *value = Value::String(dm.clone());
            }
        }
    }
    if let Some(Value::Array(volumes)) = run.get_mut("volumes") {
        for value in volumes.iter_mut() {
            if value.as_str() == Some(volume) {
                *value = Value::String(dm.clone());
            }
        }
    }
}

fn read_object(path: &Path, key: &str) -> Result<Map<String, Value>> {
    let bytes = std::fs::read(path).with_path(path)?;
    json::parse_object(&bytes, key)
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    write_atomic(path, &json::to_pretty_vec(value)?)
}
