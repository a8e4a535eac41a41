//! container image layers to a squashfs root filesystem
//!
//! an image reference is resolved against its registry (or a local docker
//! daemon that already has it), the layers are stacked into a scratch tree
//! and the tree is packed with `mksquashfs`. the result lands next to a
//! sidecar holding the manifest digest it was built from.

mod docker;
mod layers;
mod reference;
mod registry;

pub use docker::{has_image, save_image, SavedImage};
pub use layers::{open_layer, LayerStats, RootfsBuilder, OPAQUE_MARKER, WHITEOUT_PREFIX};
pub use reference::{ImageRef, DEFAULT_DOMAIN, DEFAULT_TAG, DOCKER_HUB_HOST};
pub use registry::{ManifestSchema, RegistryClient, ResolvedManifest, DIGEST_HEADER};

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{IoResultExt, Result};
use crate::fs::write_atomic;
use crate::object::ObjectPool;
use crate::ops::stage_keys;
use crate::repo::Repo;
use crate::session::{Credentials, Session};
use crate::tools::ToolBox;
use crate::transport::Progress;

pub const ROOTFS_IMAGE: &str = "root.squashfs";
pub const DIGEST_SIDECAR: &str = "root.squashfs.docker-digest";
pub const DEFAULT_COMPRESSION: &str = "xz";
/// binaries left behind by cross-architecture image builds
pub const DEFAULT_STRIP: &[&str] = &["usr/bin/qemu-arm-static"];

#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// docker platform to select from multi-arch lists, e.g. `arm/v7`
    pub arch: String,
    pub compression: String,
    pub strip: Vec<String>,
    pub credentials: Option<Credentials>,
    /// use a local docker daemon when it has the image
    pub prefer_local: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            arch: host_arch().to_string(),
            compression: DEFAULT_COMPRESSION.to_string(),
            strip: DEFAULT_STRIP.iter().map(|s| s.to_string()).collect(),
            credentials: None,
            prefer_local: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Registry,
    Docker,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootfsResult {
    pub image: PathBuf,
    pub sidecar: PathBuf,
    pub digest: String,
    pub origin: Origin,
    pub stats: LayerStats,
}

/// docker's name for the architecture this binary runs on
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

/// build `dest/root.squashfs` and its digest sidecar from `reference`
pub fn pull_rootfs(
    session: &Session,
    tools: &dyn ToolBox,
    reference: &str,
    dest: &Path,
    opts: &SourceOptions,
    progress: &Progress,
) -> Result<RootfsResult> {
    let image = ImageRef::parse(reference)?;
    std::fs::create_dir_all(dest).with_path(dest)?;

    let scratch = tempfile::Builder::new()
        .prefix(".pvr-rootfs-")
        .tempdir_in(dest)
        .with_path(dest)?;
    let _cleanup = session.cleanup().register(scratch.path());

    let (layer_paths, digest, origin) = if opts.prefer_local && has_image(tools, reference) {
        let saved = save_image(tools, reference, scratch.path())?;
        (saved.layers, saved.digest, Origin::Docker)
    } else {
        let registry = RegistryClient::new(session.client(), image, opts.credentials.clone());
        let manifest = registry.manifest(&opts.arch)?;
        let blobs = ObjectPool::open_or_create(scratch.path().join("blobs"))?;
        registry.fetch_layers(&manifest, &blobs, progress)?;
        let paths = manifest
            .layers
            .iter()
            .map(|hash| blobs.object_path(hash))
            .collect();
        (paths, manifest.digest, Origin::Registry)
    };

    let rootfs = scratch.path().join("rootfs");
    let mut builder = RootfsBuilder::new(&rootfs)?;
    for layer in &layer_paths {
        builder.apply(layer)?;
    }
    let stats = builder.finish(&opts.strip)?;

    let staged_image = scratch.path().join(ROOTFS_IMAGE);
    tools.mksquashfs(&rootfs, &staged_image, &opts.compression)?;

    let image_path = dest.join(ROOTFS_IMAGE);
    std::fs::rename(&staged_image, &image_path).with_path(&image_path)?;
    let sidecar = dest.join(DIGEST_SIDECAR);
    write_atomic(&sidecar, digest.as_bytes())?;

    info!(
        reference,
        digest = %digest,
        origin = ?origin,
        entries = stats.entries,
        "built {}",
        image_path.display()
    );
    Ok(RootfsResult {
        image: image_path,
        sidecar,
        digest,
        origin,
        stats,
    })
}

/// pull `reference` into `<container>/` of the working copy and stage it
pub fn install_rootfs(
    session: &Session,
    tools: &dyn ToolBox,
    repo: &Repo,
    container: &str,
    reference: &str,
    opts: &SourceOptions,
    progress: &Progress,
) -> Result<RootfsResult> {
    let dest = repo.working_path(container)?;
    let result = pull_rootfs(session, tools, reference, &dest, opts, progress)?;
    let container = container.trim_end_matches('/');
    stage_keys(
        repo,
        &[
            format!("{container}/{ROOTFS_IMAGE}"),
            format!("{container}/{DIGEST_SIDECAR}"),
        ],
        false,
    )?;
    Ok(result)
}
