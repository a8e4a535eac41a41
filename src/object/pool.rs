use std::fs::{self, File, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::libc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::fs::{fsync_dir, remove_existing};
use crate::hash::{hash_file, hash_reader, is_digest, Hash, HashingWriter, STREAM_BUFFER};

/// mode of pool entries and of hard-linked checkouts
const OBJECT_MODE: u32 = 0o644;
const LINKED_MODE: u32 = 0o444;

/// content-addressed blob store: one file per SHA-256 digest
///
/// writes go to a `<digest>.new` staging file that is renamed into place,
/// so readers never observe a partial object and concurrent writers of the
/// same digest are harmless.
#[derive(Clone, Debug)]
pub struct ObjectPool {
    dir: PathBuf,
}

impl ObjectPool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// open the pool, creating its directory if needed
    pub fn open_or_create(dir: impl Into<PathBuf>) -> Result<Self> {
        let pool = Self::new(dir);
        match fs::metadata(&pool.dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::CorruptState(
                    pool.dir.clone(),
                    "object pool is not a directory".into(),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&pool.dir).with_path(&pool.dir)?;
            }
            Err(e) => return Err(e).with_path(&pool.dir),
        }
        Ok(pool)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn object_path(&self, hash: &Hash) -> PathBuf {
        self.dir.join(hash.to_hex())
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.object_path(hash).is_file()
    }

    /// size in bytes of a pooled object
    pub fn size(&self, hash: &Hash) -> Result<u64> {
        let path = self.object_path(hash);
        Ok(self.entry_metadata(hash, &path)?.len())
    }

    pub fn open(&self, hash: &Hash) -> Result<File> {
        let path = self.object_path(hash);
        self.entry_metadata(hash, &path)?;
        File::open(&path).with_path(&path)
    }

    fn entry_metadata(&self, hash: &Hash, path: &Path) -> Result<fs::Metadata> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => Err(Error::CorruptState(
                path.to_path_buf(),
                "pool entry is a directory".into(),
            )),
            Ok(meta) => Ok(meta),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::ObjectNotFound(*hash)),
            Err(e) => Err(e).with_path(path),
        }
    }

    /// copy a working file into the pool, returning its digest
    ///
    /// idempotent when the digest is already present. a file that changes
    /// while being copied is a `Conflict`.
    pub fn put(&self, path: &Path) -> Result<Hash> {
        let hash = hash_file(path)?;
        if self.contains(&hash) {
            debug!(digest = %hash, "object already pooled");
            return Ok(hash);
        }

        let mut file = File::open(path).with_path(path)?;
        let (staged, actual) = self.stage(&hash, &mut file)?;
        if actual != hash {
            return Err(Error::Conflict(format!(
                "{} changed while being copied",
                path.display()
            )));
        }
        self.commit_staged(staged, &hash)?;
        Ok(hash)
    }

    /// add content from a reader whose digest is not known up front
    pub fn put_reader<R: Read>(&self, reader: &mut R) -> Result<Hash> {
        let staged = tempfile::Builder::new()
            .prefix(".new-")
            .tempfile_in(&self.dir)
            .with_path(&self.dir)?;
        let (staged, hash) = self.fill(staged, reader)?;
        if self.contains(&hash) {
            return Ok(hash);
        }
        self.commit_staged(staged, &hash)?;
        Ok(hash)
    }

    /// add content that must hash to `expected`; returns the byte count
    pub fn put_expected<R: Read>(&self, expected: &Hash, reader: &mut R) -> Result<u64> {
        let (staged, actual) = self.stage(expected, reader)?;
        if actual != *expected {
            return Err(Error::CorruptObject {
                expected: *expected,
                actual,
            });
        }
        let len = staged.as_file().metadata().with_path(staged.path())?.len();
        self.commit_staged(staged, expected)?;
        Ok(len)
    }

    fn stage<R: Read>(&self, hash: &Hash, reader: &mut R) -> Result<(NamedTempFile, Hash)> {
        let staged = tempfile::Builder::new()
            .prefix(&format!("{}.new", hash.to_hex()))
            .tempfile_in(&self.dir)
            .with_path(&self.dir)?;
        self.fill(staged, reader)
    }

    fn fill<R: Read>(&self, staged: NamedTempFile, reader: &mut R) -> Result<(NamedTempFile, Hash)> {
        let path = staged.path().to_path_buf();
        let mut writer = HashingWriter::new(staged);
        copy_buffered(reader, &mut writer).with_path(&path)?;
        let (staged, hash) = writer.finish();
        staged.as_file().sync_all().with_path(&path)?;
        Ok((staged, hash))
    }

    fn commit_staged(&self, staged: NamedTempFile, hash: &Hash) -> Result<()> {
        let dest = self.object_path(hash);
        fs::set_permissions(staged.path(), Permissions::from_mode(OBJECT_MODE))
            .with_path(staged.path())?;
        staged.persist(&dest).map_err(|e| Error::Io {
            path: dest.clone(),
            source: e.error,
        })?;
        fsync_dir(&self.dir)?;
        debug!(digest = %hash, "object pooled");
        Ok(())
    }

    /// true when the entry exists and hashes to its name
    pub fn verify(&self, hash: &Hash) -> Result<bool> {
        let mut file = match self.open(hash) {
            Ok(file) => file,
            Err(Error::ObjectNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let path = self.object_path(hash);
        let (actual, _) = hash_reader(&mut file).with_path(&path)?;
        Ok(actual == *hash)
    }

    /// verify an entry, deleting it when corrupt so it can be fetched again
    pub fn ensure_valid(&self, hash: &Hash) -> Result<bool> {
        if self.verify(hash)? {
            return Ok(true);
        }
        let path = self.object_path(hash);
        if path.is_file() {
            warn!(digest = %hash, "removing corrupt pool entry");
            fs::remove_file(&path).with_path(&path)?;
        }
        Ok(false)
    }

    /// hard-link an object to `dst`, read-only; falls back to a verified copy across devices
    pub fn link_out(&self, hash: &Hash, dst: &Path) -> Result<()> {
        let src = self.object_path(hash);
        self.entry_metadata(hash, &src)?;
        remove_existing(dst)?;

        match fs::hard_link(&src, dst) {
            Ok(()) => {
                fs::set_permissions(dst, Permissions::from_mode(LINKED_MODE)).with_path(dst)?;
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                self.copy_out(hash, dst)?;
                fs::set_permissions(dst, Permissions::from_mode(LINKED_MODE)).with_path(dst)
            }
            Err(e) => Err(e).with_path(dst),
        }
    }

    /// copy an object to `dst`, verifying the digest of what was written
    pub fn copy_out(&self, hash: &Hash, dst: &Path) -> Result<()> {
        let mut src = self.open(hash)?;
        remove_existing(dst)?;

        let out = File::create(dst).with_path(dst)?;
        let mut writer = HashingWriter::new(out);
        copy_buffered(&mut src, &mut writer).with_path(dst)?;
        let (out, actual) = writer.finish();
        out.sync_all().with_path(dst)?;

        if actual != *hash {
            fs::remove_file(dst).with_path(dst)?;
            let pooled = self.object_path(hash);
            warn!(digest = %hash, "removing corrupt pool entry");
            fs::remove_file(&pooled).with_path(&pooled)?;
            return Err(Error::CorruptObject {
                expected: *hash,
                actual,
            });
        }
        Ok(())
    }

    /// digests of every committed entry, sorted
    pub fn list(&self) -> Result<Vec<Hash>> {
        let mut hashes = Vec::new();
        for entry in fs::read_dir(&self.dir).with_path(&self.dir)? {
            let entry = entry.with_path(&self.dir)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_digest(name) {
                hashes.push(Hash::from_hex(name)?);
            }
        }
        hashes.sort();
        Ok(hashes)
    }
}

fn copy_buffered<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<u64> {
    let mut buf = vec![0u8; STREAM_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::tempdir;

    fn test_pool() -> (tempfile::TempDir, ObjectPool) {
        let dir = tempdir().unwrap();
        let pool = ObjectPool::open_or_create(dir.path().join("objects")).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_put_is_idempotent() {
        let (dir, pool) = test_pool();
        let file = dir.path().join("kernel.img");
        fs::write(&file, vec![0u8; 100 * 1024]).unwrap();

        let h1 = pool.put(&file).unwrap();
        let h2 = pool.put(&file).unwrap();

        assert_eq!(h1, h2);
        assert!(pool.contains(&h1));
        assert_eq!(pool.list().unwrap(), vec![h1]);
        assert_eq!(pool.size(&h1).unwrap(), 100 * 1024);
        // no staging files left behind
        assert_eq!(fs::read_dir(pool.dir()).unwrap().count(), 1);
    }

    #[test]
    fn test_put_expected_rejects_mismatch() {
        let (_dir, pool) = test_pool();
        let wrong = Hash::of_bytes(b"other");

        let err = pool.put_expected(&wrong, &mut &b"hello"[..]).unwrap_err();
        assert!(matches!(err, Error::CorruptObject { .. }));
        assert!(!pool.contains(&wrong));
        assert!(pool.list().unwrap().is_empty());

        let right = Hash::of_bytes(b"hello");
        assert_eq!(pool.put_expected(&right, &mut &b"hello"[..]).unwrap(), 5);
        assert!(pool.verify(&right).unwrap());
    }

    #[test]
    fn test_put_reader() {
        let (_dir, pool) = test_pool();
        let hash = pool.put_reader(&mut &b"stream"[..]).unwrap();
        assert_eq!(hash, Hash::of_bytes(b"stream"));
        assert_eq!(fs::read(pool.object_path(&hash)).unwrap(), b"stream");
    }

    #[test]
    fn test_link_out_read_only() {
        let (dir, pool) = test_pool();
        let hash = pool.put_reader(&mut &b"linked"[..]).unwrap();
        let dst = dir.path().join("out");
        fs::write(&dst, "stale").unwrap();

        pool.link_out(&hash, &dst).unwrap();

        let meta = fs::metadata(&dst).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o444);
        assert_eq!(meta.ino(), fs::metadata(pool.object_path(&hash)).unwrap().ino());
        assert_eq!(fs::read(&dst).unwrap(), b"linked");
    }

    #[test]
    fn test_copy_out_detects_corruption() {
        let (dir, pool) = test_pool();
        let hash = pool.put_reader(&mut &b"good"[..]).unwrap();
        let path = pool.object_path(&hash);
        fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();
        fs::write(&path, "evil").unwrap();

        let dst = dir.path().join("copy");
        let err = pool.copy_out(&hash, &dst).unwrap_err();
        assert!(matches!(err, Error::CorruptObject { .. }));
        assert!(!dst.exists());
        // corrupt entry is dropped so it can be fetched again
        assert!(!pool.contains(&hash));
    }

    #[test]
    fn test_ensure_valid_removes_corrupt_entry() {
        let (_dir, pool) = test_pool();
        let hash = Hash::of_bytes(b"expected");
        fs::write(pool.object_path(&hash), "actual").unwrap();

        assert!(!pool.ensure_valid(&hash).unwrap());
        assert!(!pool.contains(&hash));
        assert!(!pool.ensure_valid(&hash).unwrap());
    }

    #[test]
    fn test_directory_entry_is_corrupt_state() {
        let (_dir, pool) = test_pool();
        let hash = Hash::of_bytes(b"x");
        fs::create_dir(pool.object_path(&hash)).unwrap();
        assert!(matches!(pool.verify(&hash), Err(Error::CorruptState(..))));
    }

    #[test]
    fn test_missing_object() {
        let (_dir, pool) = test_pool();
        let hash = Hash::of_bytes(b"absent");
        assert!(matches!(pool.open(&hash), Err(Error::ObjectNotFound(_))));
        assert!(!pool.verify(&hash).unwrap());
    }
}
