use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::fs::{
    copy_with_attributes, ensure_parent_dir, files_equal, read_symlink_target, FileMetadata,
    FileType,
};
use crate::tools::ToolBox;

/// what `mk_overlay` put into the upper tree
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OverlaySummary {
    pub whiteouts: Vec<String>,
    pub copied: Vec<String>,
}

/// build an overlayfs upper tree that turns `lower` into `target`
///
/// entries only in `lower` become whiteouts; entries only in `target`, or
/// whose content differs, are copied with their attributes.
pub fn mk_overlay(
    tools: &dyn ToolBox,
    lower: &Path,
    target: &Path,
    out: &Path,
) -> Result<OverlaySummary> {
    let mut summary = OverlaySummary::default();
    std::fs::create_dir_all(out).map_err(|e| Error::Io {
        path: out.to_path_buf(),
        source: e,
    })?;

    let mut walker = WalkDir::new(lower).sort_by_file_name().min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(walk_error(lower))?;
        let rel = relative(lower, entry.path())?;
        if std::fs::symlink_metadata(target.join(&rel)).is_ok() {
            continue;
        }
        let dst = out.join(&rel);
        ensure_parent_dir(&dst)?;
        tools.mknod_whiteout(&dst)?;
        debug!(path = %rel.display(), "whiteout");
        summary.whiteouts.push(key(&rel));
        if entry.file_type().is_dir() {
            walker.skip_current_dir();
        }
    }

    for entry in WalkDir::new(target).sort_by_file_name().min_depth(1) {
        let entry = entry.map_err(walk_error(target))?;
        let rel = relative(target, entry.path())?;
        if !differs(&lower.join(&rel), entry.path())? {
            continue;
        }
        copy_with_attributes(entry.path(), &out.join(&rel))?;
        if !entry.file_type().is_dir() {
            debug!(path = %rel.display(), "copied");
            summary.copied.push(key(&rel));
        }
    }

    Ok(summary)
}

fn differs(lower: &Path, target: &Path) -> Result<bool> {
    let Ok(lower_meta) = FileMetadata::from_path(lower) else {
        return Ok(true);
    };
    let target_meta = FileMetadata::from_path(target)?;
    if lower_meta.file_type != target_meta.file_type {
        return Ok(true);
    }
    match target_meta.file_type {
        // directories are created as their children need them
        FileType::Directory => Ok(false),
        FileType::Regular => Ok(!files_equal(lower, target)?),
        FileType::Symlink => Ok(read_symlink_target(lower)? != read_symlink_target(target)?),
        FileType::CharDevice | FileType::Other => Ok(true),
    }
}

fn relative(root: &Path, path: &Path) -> Result<PathBuf> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|_| Error::Malformed {
            what: "overlay path",
            message: format!("{} is outside {}", path.display(), root.display()),
        })
}

fn key(rel: &Path) -> String {
    rel.to_string_lossy().into_owned()
}

fn walk_error(root: &Path) -> impl Fn(walkdir::Error) -> Error + '_ {
    move |e| Error::Io {
        path: e.path().unwrap_or(root).to_path_buf(),
        source: e.into(),
    }
}
