use std::fs::{File, OpenOptions};
use std::path::{Component, Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::config::RepoConfig;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{remove_existing, write_atomic};
use crate::json;
use crate::object::ObjectPool;
use crate::types::{Staged, State, DEFAULT_SPEC};

/// name of the metadata directory at the top of a working copy
pub const META_DIR: &str = ".pvr";

/// a pvr repository: a working copy plus its `.pvr` metadata
pub struct Repo {
    root: PathBuf,
    config: RepoConfig,
    pool: ObjectPool,
}

impl Repo {
    /// initialize a new repository at the given path
    pub fn init(root: &Path) -> Result<Self> {
        Self::init_with_pool(root, None)
    }

    /// initialize, optionally pointing the object pool at a shared directory
    pub fn init_with_pool(root: &Path, objects_dir: Option<PathBuf>) -> Result<Self> {
        let meta = root.join(META_DIR);
        if meta.join("json").exists() {
            return Err(Error::RepoExists(root.to_path_buf()));
        }
        std::fs::create_dir_all(&meta).with_path(&meta)?;

        let config = RepoConfig {
            objects_dir,
            ..Default::default()
        };
        if config.objects_dir.is_some() {
            config.save(&meta.join("config"))?;
        }
        let pool = ObjectPool::open_or_create(pool_dir(&meta, &config))?;

        let repo = Self {
            root: root.to_path_buf(),
            config,
            pool,
        };
        repo.write_pristine(&State::with_spec(DEFAULT_SPEC))?;
        debug!(root = %root.display(), "initialized repository");
        Ok(repo)
    }

    /// open an existing repository
    pub fn open(root: &Path) -> Result<Self> {
        let meta = root.join(META_DIR);
        if !meta.is_dir() {
            return Err(Error::NoRepo(root.to_path_buf()));
        }
        let json_path = meta.join("json");
        if json_path.is_dir() {
            return Err(Error::CorruptState(
                json_path,
                "pristine document is a directory".into(),
            ));
        }

        let config = RepoConfig::load(&meta.join("config"))?;
        let pool = ObjectPool::open_or_create(pool_dir(&meta, &config))?;

        Ok(Self {
            root: root.to_path_buf(),
            config,
            pool,
        })
    }

    /// open the nearest repository at or above `start`
    pub fn find(start: &Path) -> Result<Self> {
        for dir in start.ancestors() {
            if dir.join(META_DIR).is_dir() {
                return Self::open(dir);
            }
        }
        Err(Error::NoRepo(start.to_path_buf()))
    }

    /// working copy root
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_path(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    /// pristine document
    pub fn json_path(&self) -> PathBuf {
        self.meta_path().join("json")
    }

    /// staged additions
    pub fn staged_path(&self) -> PathBuf {
        self.meta_path().join("new")
    }

    pub fn config_path(&self) -> PathBuf {
        self.meta_path().join("config")
    }

    pub fn commitmsg_path(&self) -> PathBuf {
        self.meta_path().join("commitmsg")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.meta_path().join("lock")
    }

    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RepoConfig {
        &mut self.config
    }

    pub fn save_config(&self) -> Result<()> {
        self.config.save(&self.config_path())
    }

    /// map a state key to its place in the working copy
    ///
    /// keys must be relative and may not climb out of the root.
    pub fn working_path(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let valid = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(Error::Malformed {
                what: "state key",
                message: format!("{key:?} is not a relative path"),
            });
        }
        Ok(self.root.join(rel))
    }

    /// the committed state; an absent document is an empty one
    pub fn pristine(&self) -> Result<State> {
        let path = self.json_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(State::with_spec(DEFAULT_SPEC))
            }
            Err(e) => return Err(e).with_path(&path),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::Missing(format!("empty state document {}", path.display())));
        }
        let state = State::from_slice(&bytes, &path.display().to_string())?;
        if state.spec().is_none() {
            return Err(Error::Missing(format!("#spec in {}", path.display())));
        }
        Ok(state)
    }

    /// replace the pristine document atomically
    pub fn write_pristine(&self, state: &State) -> Result<()> {
        write_atomic(&self.json_path(), &state.to_canonical())
    }

    pub fn staged(&self) -> Result<Staged> {
        let path = self.staged_path();
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::json(path.display().to_string(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Staged::new()),
            Err(e) => Err(e).with_path(&path),
        }
    }

    pub fn write_staged(&self, staged: &Staged) -> Result<()> {
        let value = serde_json::to_value(staged).map_err(|e| Error::json("staged", e))?;
        write_atomic(&self.staged_path(), &json::to_canonical_vec(&value))
    }

    pub fn clear_staged(&self) -> Result<()> {
        remove_existing(&self.staged_path())
    }

    /// message of the last commit, if any
    pub fn commit_message(&self) -> Result<Option<String>> {
        let path = self.commitmsg_path();
        match std::fs::read_to_string(&path) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_path(&path),
        }
    }

    pub fn write_commit_message(&self, message: &str) -> Result<()> {
        write_atomic(&self.commitmsg_path(), message.as_bytes())
    }

    /// exclusive `flock` on `.pvr/lock`, held until the guard drops
    ///
    /// another process holding it is `Error::LockContention`.
    pub fn lock(&self) -> Result<RepoLock> {
        self.try_lock()?.ok_or(Error::LockContention)
    }

    /// like [`Repo::lock`], but `None` while someone else holds the lock
    pub fn try_lock(&self) -> Result<Option<RepoLock>> {
        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_path(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                debug!(repo = %self.root.display(), "locked");
                Ok(Some(RepoLock { _flock: flock }))
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(std::io::Error::from(errno)).with_path(&path),
        }
    }
}

fn pool_dir(meta: &Path, config: &RepoConfig) -> PathBuf {
    match &config.objects_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => meta.parent().unwrap_or(meta).join(dir),
        None => meta.join("objects"),
    }
}

/// a held repository lock
pub struct RepoLock {
    _flock: Flock<File>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SPEC_KEY;
    use tempfile::tempdir;

    fn test_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_repo_init() {
        let (dir, repo) = test_repo();
        let root = dir.path().join("repo");

        assert!(root.join(".pvr/objects").is_dir());
        assert_eq!(
            std::fs::read_to_string(root.join(".pvr/json")).unwrap(),
            r##"{"#spec":"pantavisor-service-system@1"}"##
        );
        assert!(repo.pool().list().unwrap().is_empty());
        assert!(repo.staged().unwrap().is_empty());
    }

    #[test]
    fn test_repo_init_already_exists() {
        let (dir, _repo) = test_repo();
        let result = Repo::init(&dir.path().join("repo"));
        assert!(matches!(result, Err(Error::RepoExists(_))));
    }

    #[test]
    fn test_repo_open_not_found() {
        let dir = tempdir().unwrap();
        let result = Repo::open(&dir.path().join("nonexistent"));
        assert!(matches!(result, Err(Error::NoRepo(_))));
    }

    #[test]
    fn test_open_rejects_directory_metadata() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".pvr/json")).unwrap();
        let result = Repo::open(dir.path());
        assert!(matches!(result, Err(Error::CorruptState(..))));
    }

    #[test]
    fn test_absent_pristine_is_default() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".pvr")).unwrap();
        let repo = Repo::open(dir.path()).unwrap();
        let state = repo.pristine().unwrap();
        assert_eq!(state.spec(), Some(DEFAULT_SPEC));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_pristine_without_spec_is_missing() {
        let (_dir, repo) = test_repo();
        std::fs::write(repo.json_path(), "{}").unwrap();
        assert!(matches!(repo.pristine(), Err(Error::Missing(_))));
        std::fs::write(repo.json_path(), "").unwrap();
        assert!(matches!(repo.pristine(), Err(Error::Missing(_))));
    }

    #[test]
    fn test_find_from_subdirectory() {
        let (dir, _repo) = test_repo();
        let nested = dir.path().join("repo/a/b");
        std::fs::create_dir_all(&nested).unwrap();
        let found = Repo::find(&nested).unwrap();
        assert_eq!(found.root(), dir.path().join("repo"));
        assert!(found.pristine().unwrap().contains_key(SPEC_KEY));
    }

    #[test]
    fn test_working_path_rejects_escapes() {
        let (_dir, repo) = test_repo();
        assert!(repo.working_path("bsp/run.json").is_ok());
        assert!(repo.working_path("../etc/passwd").is_err());
        assert!(repo.working_path("/etc/passwd").is_err());
        assert!(repo.working_path("").is_err());
    }

    #[test]
    fn test_shared_pool() {
        let dir = tempdir().unwrap();
        let shared = dir.path().join("shared-objects");
        let repo = Repo::init_with_pool(&dir.path().join("repo"), Some(shared.clone())).unwrap();
        assert_eq!(repo.pool().dir(), shared);

        let reopened = Repo::open(&dir.path().join("repo")).unwrap();
        assert_eq!(reopened.pool().dir(), shared);
    }

    #[test]
    fn test_commit_message_roundtrip() {
        let (_dir, repo) = test_repo();
        assert_eq!(repo.commit_message().unwrap(), None);
        repo.write_commit_message("m").unwrap();
        assert_eq!(repo.commit_message().unwrap().as_deref(), Some("m"));
    }

    #[test]
    fn test_second_locker_is_turned_away() {
        let (_dir, repo) = test_repo();
        let other = Repo::open(repo.root()).unwrap();

        let held = repo.lock().unwrap();
        assert!(other.try_lock().unwrap().is_none());
        assert!(matches!(other.lock(), Err(Error::LockContention)));

        drop(held);
        assert!(other.try_lock().unwrap().is_some());
        // the lock file is left in place between runs
        assert!(repo.lock_path().is_file());
    }
}
