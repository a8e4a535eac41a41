//! layers from a local docker daemon via `docker save`

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tar::Archive;
use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result};
use crate::tools::ToolBox;

/// layers of a saved image plus the digest identifying it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedImage {
    /// layer tarballs, base layer first
    pub layers: Vec<PathBuf>,
    pub digest: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SaveManifest {
    layers: Vec<String>,
}

/// true when the daemon is reachable and already has `image`
pub fn has_image(tools: &dyn ToolBox, image: &str) -> bool {
    tools.docker_available() && tools.docker_inspect(image).is_ok()
}

/// `docker save` `image` and unpack its layers under `scratch`
pub fn save_image(tools: &dyn ToolBox, image: &str, scratch: &Path) -> Result<SavedImage> {
    let info = tools.docker_inspect(image)?;
    let digest = image_digest(&info)
        .ok_or_else(|| Error::tool("docker", format!("no digest for {image}")))?;

    let tarball = scratch.join("image.tar");
    info!(image, "saving image from docker daemon");
    tools.docker_save(image, &tarball)?;

    let saved = scratch.join("saved");
    std::fs::create_dir_all(&saved).with_path(&saved)?;
    let file = File::open(&tarball).with_path(&tarball)?;
    Archive::new(file)
        .unpack(&saved)
        .map_err(|e| Error::Archive(format!("docker save of {image}: {e}")))?;

    let manifest_path = saved.join("manifest.json");
    let bytes = std::fs::read(&manifest_path).with_path(&manifest_path)?;
    let manifests: Vec<SaveManifest> =
        serde_json::from_slice(&bytes).map_err(|e| Error::json("docker save manifest", e))?;
    let manifest = manifests.into_iter().next().ok_or_else(|| Error::Malformed {
        what: "docker save manifest",
        message: format!("no images in save of {image}"),
    })?;

    let layers = manifest
        .layers
        .iter()
        .map(|layer| {
            let path = saved.join(layer);
            if !path.starts_with(&saved) || layer.split('/').any(|c| c == "..") {
                return Err(Error::Malformed {
                    what: "docker save manifest",
                    message: format!("layer {layer:?} outside the archive"),
                });
            }
            Ok(path)
        })
        .collect::<Result<Vec<_>>>()?;
    debug!(image, layers = layers.len(), digest = %digest, "saved image");

    Ok(SavedImage { layers, digest })
}

/// registry digest if the image was pulled from one, else its local id
fn image_digest(info: &Value) -> Option<String> {
    let repo_digest = info
        .get("RepoDigests")
        .and_then(Value::as_array)
        .and_then(|digests| digests.first())
        .and_then(Value::as_str)
        .and_then(|d| d.split_once('@'))
        .map(|(_, digest)| digest.to_string());
    repo_digest.or_else(|| info.get("Id").and_then(Value::as_str).map(str::to_string))
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::tools::fake::FakeTools;
    use std::collections::BTreeMap;

    /// a daemon holding prebuilt `docker save` tarballs
    pub struct FakeDocker {
        pub tools: FakeTools,
        pub images: BTreeMap<String, (Value, Vec<u8>)>,
    }

    impl ToolBox for FakeDocker {
        fn verity_format(&self, data: &Path, hash: &Path, salt: &str) -> Result<String> {
            self.tools.verity_format(data, hash, salt)
        }

        fn mksquashfs(&self, src: &Path, dst: &Path, compression: &str) -> Result<()> {
            self.tools.mksquashfs(src, dst, compression)
        }

        fn mknod_whiteout(&self, path: &Path) -> Result<()> {
            self.tools.mknod_whiteout(path)
        }

        fn docker_available(&self) -> bool {
            true
        }

        fn docker_save(&self, image: &str, dst: &Path) -> Result<()> {
            let (_, tarball) = self
                .images
                .get(image)
                .ok_or_else(|| Error::tool("docker", format!("no image {image}")))?;
            std::fs::write(dst, tarball).with_path(dst)
        }

        fn docker_inspect(&self, image: &str) -> Result<Value> {
            self.images
                .get(image)
                .map(|(info, _)| info.clone())
                .ok_or_else(|| Error::tool("docker", format!("no image {image}")))
        }
    }

    /// a legacy `docker save` tarball with one `<id>/layer.tar` per layer
    pub fn save_tarball(layers: &[Vec<u8>]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let names: Vec<String> = (0..layers.len()).map(|i| format!("l{i}/layer.tar")).collect();
        let manifest = serde_json::json!([{"Config": "cfg.json", "RepoTags": ["demo:1"], "Layers": names}]);
        let manifest = manifest.to_string();

        let mut append = |path: &str, data: &[u8]| {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(1_600_000_000);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, path, data).unwrap();
        };
        append("manifest.json", manifest.as_bytes());
        for (name, layer) in names.iter().zip(layers) {
            append(name, layer);
        }
        builder.into_inner().unwrap()
    }
}
