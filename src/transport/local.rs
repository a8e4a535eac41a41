//! remotes that are plain directories on this machine

use std::collections::BTreeSet;
use std::fs;

use tracing::debug;

use crate::error::Result;
use crate::fs::write_atomic;
use crate::hash::Hash;
use crate::object::ObjectPool;
use crate::transport::remote::LocalRemote;
use crate::types::State;

/// transfer statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    pub copied: usize,
    pub hardlinked: usize,
    pub skipped: usize,
    pub bytes_transferred: u64,
}

/// copy every object `state` references from `src` into `dst`
pub fn copy_objects(src: &ObjectPool, dst: &ObjectPool, state: &State) -> Result<TransferStats> {
    let mut stats = TransferStats::default();
    let mut seen = BTreeSet::new();
    for (_, hash) in state.objects() {
        if seen.insert(hash) {
            copy_object(src, dst, &hash, &mut stats)?;
        }
    }
    debug!(
        copied = stats.copied,
        hardlinked = stats.hardlinked,
        skipped = stats.skipped,
        "local objects transferred"
    );
    Ok(stats)
}

fn copy_object(src: &ObjectPool, dst: &ObjectPool, hash: &Hash, stats: &mut TransferStats) -> Result<()> {
    if dst.ensure_valid(hash)? {
        stats.skipped += 1;
        return Ok(());
    }

    // a link shares the source's bytes, so only sound entries are linked;
    // anything else goes through the verified copy and fails there
    if src.verify(hash)? && fs::hard_link(src.object_path(hash), dst.object_path(hash)).is_ok() {
        stats.hardlinked += 1;
        return Ok(());
    }
    let mut file = src.open(hash)?;
    stats.bytes_transferred += dst.put_expected(hash, &mut file)?;
    stats.copied += 1;
    Ok(())
}

/// write `state` and its objects into a local remote
pub fn push_local(pool: &ObjectPool, remote: &LocalRemote, state: &State) -> Result<TransferStats> {
    let stats = copy_objects(pool, &remote.pool, state)?;
    write_atomic(&remote.json_path, &state.to_canonical())?;
    Ok(stats)
}

/// read a local remote's state and copy its objects into `pool`
pub fn fetch_local(remote: &LocalRemote, pool: &ObjectPool, state: &State) -> Result<TransferStats> {
    copy_objects(&remote.pool, pool, state)
}
