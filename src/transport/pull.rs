//! fetch, get and clone from a remote

use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};
use crate::fragment::{filter, merge, Fragment, MergeMode};
use crate::object::ObjectPool;
use crate::ops::{reset, ResetOptions};
use crate::repo::Repo;
use crate::session::Session;
use crate::transport::download::{download_objects, DownloadSummary};
use crate::transport::local::{fetch_local, TransferStats};
use crate::transport::progress::Progress;
use crate::transport::remote::{Remote, Target};
use crate::types::State;

/// get options
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub mode: MergeMode,
    /// where the fetched parts land; defaults to the parts named in the url
    pub into: Option<Fragment>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// the remote state, narrowed to the requested parts
    pub state: State,
    pub parts: Fragment,
    pub download: DownloadSummary,
    pub local: Option<TransferStats>,
}

/// download the objects of a remote state into `pool` without touching any checkout
pub fn fetch(
    session: &Session,
    pool: &ObjectPool,
    target: &str,
    progress: &Progress,
) -> Result<FetchResult> {
    let (target, parts) = Target::parse(target)?;
    match target {
        Target::Local(local) => {
            let state = filter(&local.state()?, &parts);
            let stats = fetch_local(&local, pool, &state)?;
            Ok(FetchResult {
                state,
                parts,
                local: Some(stats),
                ..FetchResult::default()
            })
        }
        Target::Http(url) => {
            let remote = Remote::discover(session, &url)?;
            let state = remote
                .state()?
                .ok_or_else(|| Error::Missing(format!("no state at {url}")))?;
            let state = filter(&state, &parts);
            let download = download_objects(&remote, pool, &state, progress)?;
            Ok(FetchResult {
                state,
                parts,
                download,
                local: None,
            })
        }
    }
}

/// fetch and merge into the pristine document; the working tree is untouched
pub fn get(
    session: &Session,
    repo: &Repo,
    target: &str,
    opts: &GetOptions,
    progress: &Progress,
) -> Result<FetchResult> {
    let fetched = fetch(session, repo.pool(), target, progress)?;

    let _lock = repo.lock()?;
    let dst = opts.into.as_ref().unwrap_or(&fetched.parts);
    let merged = merge(&repo.pristine()?, &fetched.state, &fetched.parts, dst, opts.mode)?;
    repo.write_pristine(&merged)?;
    info!(keys = merged.len(), "pristine updated");
    Ok(fetched)
}

/// create a repository at `dest` from a remote and check it out
pub fn clone(session: &Session, target: &str, dest: &Path, progress: &Progress) -> Result<Repo> {
    let fresh = !dest.exists();
    let guard = fresh.then(|| session.cleanup().register(dest));

    let mut repo = Repo::init(dest)?;
    let location = target.split_once('#').map_or(target, |(loc, _)| loc);
    repo.config_mut().default_get_url = Some(location.to_string());
    repo.config_mut().default_put_url = Some(location.to_string());
    repo.save_config()?;

    get(session, &repo, target, &GetOptions::default(), progress)?;
    reset(&repo, ResetOptions::default())?;

    drop(guard);
    info!(path = %dest.display(), "cloned");
    Ok(repo)
}
