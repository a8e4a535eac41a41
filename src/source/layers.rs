//! stacking image layers into a root filesystem tree

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};

/// marks a directory whose lower-layer contents are hidden
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";
/// prefix of a file that deletes its lower-layer namesake
pub const WHITEOUT_PREFIX: &str = ".wh.";

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LayerStats {
    pub entries: usize,
    pub whiteouts: usize,
    /// device nodes that could not be created without privileges
    pub skipped: usize,
}

/// applies layers in order onto one root directory
pub struct RootfsBuilder {
    root: PathBuf,
    // tar mtimes of directories, restored once all layers are in
    dir_mtimes: BTreeMap<PathBuf, u64>,
    stats: LayerStats,
}

impl RootfsBuilder {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).with_path(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            dir_mtimes: BTreeMap::new(),
            stats: LayerStats::default(),
        })
    }

    /// apply one layer tarball (plain, gzip or zstd)
    ///
    /// whiteouts are resolved against the lower layers first, then the
    /// layer's own entries are unpacked.
    pub fn apply(&mut self, layer: &Path) -> Result<()> {
        debug!(layer = %layer.display(), "applying layer");
        self.remove_whited_out(layer)?;
        self.unpack(layer)
    }

    fn remove_whited_out(&mut self, layer: &Path) -> Result<()> {
        let mut archive = Archive::new(open_layer(layer)?);
        for entry in archive.entries().map_err(|e| archive_error(layer, e))? {
            let entry = entry.map_err(|e| archive_error(layer, e))?;
            let Some(rel) = entry.path().ok().and_then(|p| normalize(&p)) else {
                continue;
            };
            let Some(name) = rel.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let parent = self.root.join(rel.parent().unwrap_or(Path::new("")));

            if name == OPAQUE_MARKER {
                self.stats.whiteouts += 1;
                clear_dir(&parent)?;
            } else if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                self.stats.whiteouts += 1;
                remove_any(&parent.join(hidden))?;
            }
        }
        Ok(())
    }

    fn unpack(&mut self, layer: &Path) -> Result<()> {
        let mut archive = Archive::new(open_layer(layer)?);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_unpack_xattrs(true);
        archive.set_overwrite(true);
        archive.set_preserve_ownerships(nix::unistd::geteuid().is_root());

        for entry in archive.entries().map_err(|e| archive_error(layer, e))? {
            let mut entry = entry.map_err(|e| archive_error(layer, e))?;
            let Some(rel) = entry.path().ok().and_then(|p| normalize(&p)) else {
                warn!(layer = %layer.display(), "skipping entry outside the root");
                continue;
            };
            let is_whiteout = rel
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(WHITEOUT_PREFIX));
            if is_whiteout || rel.as_os_str().is_empty() {
                continue;
            }

            let kind = entry.header().entry_type();
            let target = self.root.join(&rel);
            replace_conflicting(&target, kind)?;

            match entry.unpack_in(&self.root) {
                Ok(_) => {}
                Err(e) if is_device(kind) && e.kind() == std::io::ErrorKind::PermissionDenied => {
                    warn!(path = %rel.display(), "cannot create device node, skipping");
                    self.stats.skipped += 1;
                    continue;
                }
                Err(e) => return Err(archive_error(layer, e)),
            }
            if kind == EntryType::Directory {
                let mtime = entry.header().mtime().unwrap_or(0);
                self.dir_mtimes.insert(rel, mtime);
            }
            self.stats.entries += 1;
        }
        Ok(())
    }

    /// drop the strip list and pin directory timestamps
    pub fn finish(self, strip: &[String]) -> Result<LayerStats> {
        for path in strip {
            let Some(rel) = normalize(Path::new(path)) else {
                continue;
            };
            let target = self.root.join(rel);
            if std::fs::symlink_metadata(&target).is_ok() {
                debug!(path = %path, "stripping from rootfs");
                remove_any(&target)?;
            }
        }

        // deepest first so restoring a parent is not undone by its children
        for (rel, mtime) in self.dir_mtimes.iter().rev() {
            let dir = self.root.join(rel);
            if dir.is_dir() {
                let time = FileTime::from_unix_time(*mtime as i64, 0);
                filetime::set_file_mtime(&dir, time).with_path(&dir)?;
            }
        }
        Ok(self.stats)
    }
}

/// open a layer, sniffing its compression from the first bytes
pub fn open_layer(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).with_path(path)?;
    let mut reader = BufReader::new(file);
    let (is_gzip, is_zstd) = {
        let head = reader.fill_buf().with_path(path)?;
        (head.starts_with(GZIP_MAGIC), head.starts_with(ZSTD_MAGIC))
    };

    if is_gzip {
        Ok(Box::new(GzDecoder::new(reader)))
    } else if is_zstd {
        let decoder = zstd::stream::read::Decoder::with_buffer(reader).with_path(path)?;
        Ok(Box::new(decoder))
    } else {
        Ok(Box::new(reader))
    }
}

/// relative path inside the root, or None for entries that would escape it
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn is_device(kind: EntryType) -> bool {
    matches!(kind, EntryType::Char | EntryType::Block | EntryType::Fifo)
}

/// a file replacing a directory (or the reverse) needs the old one gone
fn replace_conflicting(target: &Path, kind: EntryType) -> Result<()> {
    let Ok(meta) = std::fs::symlink_metadata(target) else {
        return Ok(());
    };
    let wants_dir = kind == EntryType::Directory;
    if meta.is_dir() && !wants_dir {
        std::fs::remove_dir_all(target).with_path(target)?;
    } else if !meta.is_dir() && wants_dir {
        std::fs::remove_file(target).with_path(target)?;
    }
    Ok(())
}

fn remove_any(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path).with_path(path),
        Ok(_) => std::fs::remove_file(path).with_path(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_path(path),
    }
}

fn clear_dir(dir: &Path) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_path(dir),
    };
    for entry in entries {
        let entry = entry.with_path(dir)?;
        remove_any(&entry.path())?;
    }
    Ok(())
}

/// tar wraps the failing syscall as the source of its own error
fn archive_error(layer: &Path, e: std::io::Error) -> Error {
    let mut message = format!("layer {}: {e}", layer.display());
    let mut source = std::error::Error::source(&e);
    while let Some(cause) = source {
        message.push_str(&format!(": {cause}"));
        source = cause.source();
    }
    Error::Archive(message)
}


#[cfg(test)]
mod tests {
    use super::testutil::{gzip, layer_tar};
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::tempdir;

    fn write_layer(dir: &Path, name: &str, bytes: Vec<u8>) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn tree(root: &Path) -> Vec<String> {
        walkdir::WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .map(|e| {
                let e = e.unwrap();
                e.path().strip_prefix(root).unwrap().display().to_string()
            })
            .collect()
    }

    #[test]
    fn test_layers_with_whiteouts() {
        let dir = tempdir().unwrap();
        let base = write_layer(
            dir.path(),
            "base.tar.gz",
            gzip(&layer_tar(&[
                ("etc", None),
                ("etc/os-release", Some("base")),
                ("etc/old.conf", Some("old")),
                ("var", None),
                ("var/cache", None),
                ("var/cache/a", Some("a")),
                ("usr", None),
                ("usr/bin", None),
                ("usr/bin/qemu-arm-static", Some("qemu")),
            ])),
        );
        let top = write_layer(
            dir.path(),
            "top.tar",
            layer_tar(&[
                ("etc/.wh.old.conf", Some("")),
                ("etc/os-release", Some("top")),
                ("var/cache/.wh..wh..opq", Some("")),
                ("var/cache/b", Some("b")),
            ]),
        );

        let root = dir.path().join("rootfs");
        let mut builder = RootfsBuilder::new(&root).unwrap();
        builder.apply(&base).unwrap();
        builder.apply(&top).unwrap();
        let stats = builder
            .finish(&["usr/bin/qemu-arm-static".to_string()])
            .unwrap();

        assert_eq!(stats.whiteouts, 2);
        assert_eq!(
            tree(&root),
            [
                "etc",
                "etc/os-release",
                "usr",
                "usr/bin",
                "var",
                "var/cache",
                "var/cache/b",
            ]
        );
        assert_eq!(std::fs::read_to_string(root.join("etc/os-release")).unwrap(), "top");
        // directory times come from the tarball, not the extraction
        let meta = std::fs::metadata(root.join("var/cache")).unwrap();
        assert_eq!(meta.mtime(), 1_600_000_000);
    }

    #[test]
    fn test_file_replaces_directory() {
        let dir = tempdir().unwrap();
        let lower = write_layer(
            dir.path(),
            "lower.tar",
            layer_tar(&[("opt", None), ("opt/x", Some("x"))]),
        );
        let upper = write_layer(dir.path(), "upper.tar", layer_tar(&[("opt", Some("file"))]));

        let root = dir.path().join("rootfs");
        let mut builder = RootfsBuilder::new(&root).unwrap();
        builder.apply(&lower).unwrap();
        builder.apply(&upper).unwrap();
        builder.finish(&[]).unwrap();
        assert_eq!(std::fs::read_to_string(root.join("opt")).unwrap(), "file");
    }

    #[test]
    fn test_unpack_failure_names_the_cause() {
        let dir = tempdir().unwrap();
        // `a` is a file by the time `a/b` needs it as a directory
        let layer = write_layer(
            dir.path(),
            "bad.tar",
            layer_tar(&[("a", Some("file")), ("a/b", Some("child"))]),
        );
        let root = dir.path().join("rootfs");
        let mut builder = RootfsBuilder::new(&root).unwrap();
        match builder.apply(&layer) {
            Err(Error::Archive(message)) => {
                assert!(message.contains("bad.tar"), "{message}");
                assert!(message.contains("os error"), "{message}");
            }
            other => panic!("expected archive error, got {other:?}"),
        }
    }

    #[test]
    fn test_open_layer_sniffs_compression() {
        let dir = tempdir().unwrap();
        let tar = layer_tar(&[("f", Some("data"))]);
        let zst = zstd::encode_all(&tar[..], 3).unwrap();
        for (name, bytes) in [("a.tar", tar.clone()), ("a.tgz", gzip(&tar)), ("a.zst", zst)] {
            let path = write_layer(dir.path(), name, bytes);
            let mut out = Vec::new();
            open_layer(&path).unwrap().read_to_end(&mut out).unwrap();
            assert_eq!(out, tar, "{name}");
        }
    }

    #[test]
    fn test_normalize_rejects_escapes() {
        assert_eq!(normalize(Path::new("./a/b")), Some(PathBuf::from("a/b")));
        assert_eq!(normalize(Path::new("../a")), None);
        assert_eq!(normalize(Path::new("/etc")), None);
    }
}
