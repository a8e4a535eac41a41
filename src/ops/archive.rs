use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result};
use crate::fragment::{filter, Fragment};
use crate::hash::{is_digest, Hash};
use crate::object::ObjectPool;
use crate::repo::Repo;
use crate::session::CleanupRegistry;
use crate::types::State;

const JSON_ENTRY: &str = "json";
const OBJECTS_DIR: &str = "objects";

/// what an export or import moved
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub objects: usize,
    pub state: bool,
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "gz" || e == "tgz")
}

/// write the pristine document and its objects to a tarball
///
/// `json` is always the first entry so a streaming reader can validate the
/// document before consuming any object.
pub fn export(
    repo: &Repo,
    parts: &Fragment,
    dst: &Path,
    cleanup: &CleanupRegistry,
) -> Result<ArchiveSummary> {
    let state = filter(&repo.pristine()?, parts);
    let dir = dst
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let staged = tempfile::Builder::new()
        .prefix(".pvr-export")
        .tempfile_in(dir)
        .with_path(dir)?;
    let _guard = cleanup.register(staged.path());
    let file = staged.reopen().with_path(staged.path())?;

    let objects = if is_gzip(dst) {
        let encoder = GzEncoder::new(file, Compression::default());
        let encoder = write_archive(encoder, &state, repo.pool())?;
        encoder.finish().with_path(dst)?.sync_all().with_path(dst)?;
        state.digests().len()
    } else {
        let file = write_archive(file, &state, repo.pool())?;
        file.sync_all().with_path(dst)?;
        state.digests().len()
    };

    staged.persist(dst).map_err(|e| Error::Io {
        path: dst.to_path_buf(),
        source: e.error,
    })?;
    info!(path = %dst.display(), objects, "exported");
    Ok(ArchiveSummary {
        objects,
        state: true,
    })
}

fn write_archive<W: Write>(out: W, state: &State, pool: &ObjectPool) -> Result<W> {
    let mut builder = Builder::new(out);
    builder.mode(tar::HeaderMode::Deterministic);

    let json = state.to_canonical();
    let mut header = entry_header(json.len() as u64);
    builder
        .append_data(&mut header, JSON_ENTRY, json.as_slice())
        .map_err(archive_io)?;

    for hash in state.digests() {
        let size = pool.size(&hash)?;
        let file = pool.open(&hash)?;
        let mut header = entry_header(size);
        let name = format!("{OBJECTS_DIR}/{}", hash.to_hex());
        builder
            .append_data(&mut header, &name, file)
            .map_err(archive_io)?;
        debug!(digest = %hash, "archived object");
    }

    builder.into_inner().map_err(archive_io)
}

fn entry_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    header
}

fn archive_io(e: io::Error) -> Error {
    Error::Archive(e.to_string())
}

/// load a tarball written by `export` into the repository
///
/// objects are verified against their names as they are written; the
/// pristine document is replaced last, once every object it names is pooled.
pub fn import(repo: &Repo, src: &Path) -> Result<ArchiveSummary> {
    let _lock = repo.lock()?;
    let file = File::open(src).with_path(src)?;
    let reader: Box<dyn Read> = if is_gzip(src) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut archive = Archive::new(reader);
    let mut summary = ArchiveSummary::default();
    let mut document: Option<State> = None;

    for entry in archive.entries().map_err(archive_io)? {
        let mut entry = entry.map_err(archive_io)?;
        let path = entry.path().map_err(archive_io)?.into_owned();
        let name = entry_name(&path)?;

        if entry.header().entry_type().is_dir() {
            continue;
        }

        match classify(&name)? {
            Entry::Json => {
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes).map_err(archive_io)?;
                document = Some(State::from_slice(&bytes, "archive json")?);
                summary.state = true;
            }
            Entry::Object(hash) => {
                if repo.pool().ensure_valid(&hash)? {
                    continue;
                }
                repo.pool().put_expected(&hash, &mut entry)?;
                summary.objects += 1;
            }
        }
    }

    if let Some(state) = document {
        for (key, hash) in state.objects() {
            if !repo.pool().contains(&hash) {
                return Err(Error::Missing(format!("object {hash} for {key}")));
            }
        }
        repo.write_pristine(&state)?;
    }

    info!(path = %src.display(), objects = summary.objects, "imported");
    Ok(summary)
}

enum Entry {
    Json,
    Object(Hash),
}

fn entry_name(path: &Path) -> Result<String> {
    let parts: Option<Vec<&str>> = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();
    parts
        .map(|p| p.join("/"))
        .ok_or_else(|| Error::Archive(format!("unsafe entry {}", path.display())))
}

fn classify(name: &str) -> Result<Entry> {
    let name = name.strip_prefix(".pvr/").unwrap_or(name);
    if name == JSON_ENTRY {
        return Ok(Entry::Json);
    }
    if name == OBJECTS_DIR {
        return Err(Error::Archive(format!("unexpected entry {name}")));
    }
    match name.strip_prefix("objects/") {
        Some(hex) if is_digest(hex) => Ok(Entry::Object(Hash::from_hex(hex)?)),
        _ => Err(Error::Archive(format!("unexpected entry {name}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{commit, stage};
    use std::fs;
    use tempfile::tempdir;

    fn source_repo(dir: &Path) -> Repo {
        let repo = Repo::init(dir).unwrap();
        fs::create_dir_all(dir.join("app")).unwrap();
        fs::create_dir_all(dir.join("bsp")).unwrap();
        fs::write(dir.join("app/root.squashfs"), vec![9u8; 10_000]).unwrap();
        fs::write(dir.join("app/run.json"), r#"{"n":12345678901234567890}"#).unwrap();
        fs::write(dir.join("bsp/kernel.img"), vec![0u8; 2048]).unwrap();
        stage(&repo, &[], false).unwrap();
        commit(&repo, "m", false).unwrap();
        repo
    }

    fn entry_names(path: &Path, gz: bool) -> Vec<String> {
        let file = File::open(path).unwrap();
        let reader: Box<dyn Read> = if gz {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let mut archive = Archive::new(reader);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn test_export_import_roundtrip() {
        let dir = tempdir().unwrap();
        let src = source_repo(&dir.path().join("src"));
        let tarball = dir.path().join("state.tgz");

        let exported = export(
            &src,
            &Fragment::parse(""),
            &tarball,
            &CleanupRegistry::new(),
        )
        .unwrap();
        assert_eq!(exported.objects, 2);

        let names = entry_names(&tarball, true);
        assert_eq!(names[0], "json");
        assert_eq!(names.len(), 3);
        assert!(names[1..].iter().all(|n| n.starts_with("objects/")));

        let dst = Repo::init(&dir.path().join("dst")).unwrap();
        let imported = import(&dst, &tarball).unwrap();
        assert_eq!(imported.objects, 2);
        assert_eq!(
            fs::read(dst.json_path()).unwrap(),
            fs::read(src.json_path()).unwrap()
        );
        for hash in dst.pristine().unwrap().digests() {
            assert!(dst.pool().verify(&hash).unwrap());
        }
    }

    #[test]
    fn test_export_fragment_plain_tar() {
        let dir = tempdir().unwrap();
        let src = source_repo(&dir.path().join("src"));
        let tarball = dir.path().join("bsp.tar");

        let exported = export(
            &src,
            &Fragment::parse("bsp"),
            &tarball,
            &CleanupRegistry::new(),
        )
        .unwrap();
        assert_eq!(exported.objects, 1);

        let dst = Repo::init(&dir.path().join("dst")).unwrap();
        import(&dst, &tarball).unwrap();
        let state = dst.pristine().unwrap();
        let keys: Vec<&String> = state.keys().collect();
        assert_eq!(keys, ["#spec", "bsp/kernel.img"]);
    }

    #[test]
    fn test_export_is_deterministic() {
        let dir = tempdir().unwrap();
        let src = source_repo(&dir.path().join("src"));
        let a = dir.path().join("a.tar");
        let b = dir.path().join("b.tar");
        let all = Fragment::parse("");
        export(&src, &all, &a, &CleanupRegistry::new()).unwrap();
        export(&src, &all, &b, &CleanupRegistry::new()).unwrap();
        assert_eq!(fs::read(a).unwrap(), fs::read(b).unwrap());
    }

    #[test]
    fn test_import_rejects_unknown_entries() {
        let dir = tempdir().unwrap();
        let tarball = dir.path().join("bad.tar");
        let mut builder = Builder::new(File::create(&tarball).unwrap());
        let mut header = entry_header(3);
        builder
            .append_data(&mut header, "etc/passwd", &b"x:0"[..])
            .unwrap();
        builder.into_inner().unwrap();

        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        assert!(matches!(import(&repo, &tarball), Err(Error::Archive(_))));
    }

    #[test]
    fn test_import_rejects_corrupt_object() {
        let dir = tempdir().unwrap();
        let tarball = dir.path().join("bad.tar");
        let claimed = Hash::of_bytes(b"claimed");
        let mut builder = Builder::new(File::create(&tarball).unwrap());
        let mut header = entry_header(6);
        builder
            .append_data(
                &mut header,
                format!("objects/{}", claimed.to_hex()),
                &b"actual"[..],
            )
            .unwrap();
        builder.into_inner().unwrap();

        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        let err = import(&repo, &tarball).unwrap_err();
        assert!(matches!(err, Error::CorruptObject { .. }));
        assert!(!repo.pool().contains(&claimed));
    }
}
