use std::fs::{self, File, Permissions};
use std::io::Write;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};
use tracing::warn;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::read::{read_symlink_target, read_xattrs, FileMetadata, FileType, Xattr};

/// write `content` to `path` atomically: `<path>.new`, fsync, rename
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    write_atomic_with_suffix(path, content, ".new")
}

/// atomic write staging through `<path><suffix>`
pub fn write_atomic_with_suffix(path: &Path, content: &[u8], suffix: &str) -> Result<()> {
    let mut staged = path.as_os_str().to_owned();
    staged.push(suffix);
    let staged = PathBuf::from(staged);

    {
        let mut file = File::create(&staged).with_path(&staged)?;
        file.write_all(content).with_path(&staged)?;
        file.sync_all().with_path(&staged)?;
    }

    fs::rename(&staged, path).with_path(path)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// create every missing directory leading to `path`
///
/// fails with `PathCollision` if a non-directory sits where a directory is needed.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let mut current = PathBuf::new();
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) if meta.file_type().is_symlink() && current.is_dir() => {}
            Ok(_) => return Err(Error::PathCollision(current)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir(&current).with_path(&current)?;
            }
            Err(e) => {
                return Err(Error::Io {
                    path: current,
                    source: e,
                })
            }
        }
    }
    Ok(())
}

/// unlink a file or symlink if present; directories are a collision
pub fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(Error::PathCollision(path.to_path_buf())),
        Ok(_) => fs::remove_file(path).with_path(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// create an overlayfs whiteout (char device 0/0)
pub fn create_whiteout(path: &Path) -> Result<()> {
    remove_existing(path)?;

    let dev = makedev(0, 0);
    mknod(path, SFlag::S_IFCHR, Mode::from_bits_truncate(0o000), dev).map_err(|e| {
        if e == nix::errno::Errno::EPERM {
            Error::DeviceNodePermission(path.to_path_buf())
        } else {
            Error::Io {
                path: path.to_path_buf(),
                source: std::io::Error::from(e),
            }
        }
    })
}

/// apply metadata (ownership, mode, xattrs) to an existing path
pub fn apply_metadata(path: &Path, uid: u32, gid: u32, mode: u32, xattrs: &[Xattr]) -> Result<()> {
    // xattrs first, while we still have write permission
    for xattr in xattrs {
        if let Err(e) = xattr::set(path, &xattr.name, &xattr.value) {
            // trusted.* and security.* need privileges; keep going without them
            warn!(path = %path.display(), xattr = %xattr.name, error = %e, "failed to set xattr");
        }
    }

    // skip chown when it matches the current user to avoid permission errors
    let current_uid = nix::unistd::getuid().as_raw();
    let current_gid = nix::unistd::getgid().as_raw();
    if uid != current_uid || gid != current_gid {
        if let Err(e) = chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))) {
            if nix::unistd::geteuid().is_root() {
                return Err(Error::Io {
                    path: path.to_path_buf(),
                    source: std::io::Error::from(e),
                });
            }
        }
    }

    // mode last, it might remove write permission
    fs::set_permissions(path, Permissions::from_mode(mode & 0o7777)).with_path(path)?;

    Ok(())
}

/// copy a file, symlink or directory node preserving mode, ownership, xattrs and mtime
pub fn copy_with_attributes(src: &Path, dst: &Path) -> Result<()> {
    let meta = FileMetadata::from_path(src)?;
    ensure_parent_dir(dst)?;

    match meta.file_type {
        FileType::Symlink => {
            remove_existing(dst)?;
            let target = read_symlink_target(src)?;
            symlink(&target, dst).with_path(dst)?;
            return Ok(());
        }
        FileType::Directory => {
            if !dst.is_dir() {
                remove_existing(dst)?;
                fs::create_dir(dst).with_path(dst)?;
            }
        }
        FileType::Regular => {
            remove_existing(dst)?;
            fs::copy(src, dst).with_path(dst)?;
        }
        FileType::CharDevice | FileType::Other => {
            return Err(Error::Malformed {
                what: "overlay source",
                message: format!("{} is not a regular file, directory or symlink", src.display()),
            })
        }
    }

    let xattrs = read_xattrs(src)?;
    apply_metadata(dst, meta.uid, meta.gid, meta.mode, &xattrs)?;

    let std_meta = fs::symlink_metadata(src).with_path(src)?;
    let mtime = FileTime::from_last_modification_time(&std_meta);
    let atime = FileTime::from_last_access_time(&std_meta);
    filetime::set_file_times(dst, atime, mtime).with_path(dst)?;
    Ok(())
}

/// sync a directory to disk
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::tempdir;

    fn current_ids() -> (u32, u32) {
        (
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("json");
        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"{\"a\":1}").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"{\"a\":1}");
        assert!(!dir.path().join("json.new").exists());
    }

    #[test]
    fn test_write_atomic_custom_suffix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("auth.json");
        write_atomic_with_suffix(&path, b"{}", ".tmp").unwrap();
        assert!(path.is_file());
        assert!(!dir.path().join("auth.json.tmp").exists());
    }

    #[test]
    fn test_ensure_parent_dir_creates_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/c/file");
        ensure_parent_dir(&path).unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
    }

    #[test]
    fn test_ensure_parent_dir_collision() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), "file").unwrap();
        let result = ensure_parent_dir(&dir.path().join("a/b/file"));
        assert!(matches!(result, Err(Error::PathCollision(_))));
    }

    #[test]
    fn test_remove_existing_refuses_directory() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        assert!(matches!(remove_existing(&sub), Err(Error::PathCollision(_))));
        // absent is fine
        remove_existing(&dir.path().join("absent")).unwrap();
    }

    #[test]
    fn test_apply_metadata_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        let (uid, gid) = current_ids();
        fs::write(&path, "content").unwrap();

        apply_metadata(&path, uid, gid, 0o600, &[]).unwrap();

        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o600);
    }

    #[test]
    fn test_copy_with_attributes_keeps_mode_and_mtime() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("out/nested/dst");
        fs::write(&src, "payload").unwrap();
        fs::set_permissions(&src, Permissions::from_mode(0o750)).unwrap();
        filetime::set_file_mtime(&src, FileTime::from_unix_time(1_000_000, 0)).unwrap();

        copy_with_attributes(&src, &dst).unwrap();

        let meta = fs::metadata(&dst).unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "payload");
        assert_eq!(meta.mode() & 0o777, 0o750);
        assert_eq!(meta.mtime(), 1_000_000);
    }

    #[test]
    fn test_whiteout_requires_privileges_or_succeeds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wh");
        match create_whiteout(&path) {
            Ok(()) => {
                let meta = FileMetadata::from_path(&path).unwrap();
                assert!(meta.is_whiteout());
            }
            Err(Error::DeviceNodePermission(p)) => assert_eq!(p, path),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
