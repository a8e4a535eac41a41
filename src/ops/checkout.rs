use tracing::{debug, info};

use crate::error::Result;
use crate::fs::{ensure_parent_dir, remove_existing, write_atomic};
use crate::json;
use crate::repo::Repo;
use crate::types::{State, StateValue};

/// reset options
#[derive(Clone, Copy, Debug, Default)]
pub struct ResetOptions {
    /// hard-link objects out of the pool, read-only
    pub hardlink: bool,
    /// write inline json canonically instead of pretty
    pub canonical: bool,
}

/// materialise the pristine document into the working copy
pub fn reset(repo: &Repo, opts: ResetOptions) -> Result<()> {
    let _lock = repo.lock()?;
    let pristine = repo.pristine()?;
    checkout_state(repo, &pristine, opts)?;
    repo.clear_staged()?;
    info!(keys = pristine.len(), "working copy reset");
    Ok(())
}

/// write every key of `state` into the working copy
///
/// a non-directory where a directory is needed, or a directory where a
/// file goes, is fatal.
pub fn checkout_state(repo: &Repo, state: &State, opts: ResetOptions) -> Result<()> {
    for (key, value) in state.iter() {
        let path = match value {
            StateValue::Spec(_) => continue,
            _ => repo.working_path(key)?,
        };
        ensure_parent_dir(&path)?;

        match value {
            StateValue::Spec(_) => {}
            StateValue::Inline(v) => {
                let content = if opts.hardlink || opts.canonical {
                    json::to_canonical_vec(v)
                } else {
                    json::to_pretty_vec(v)?
                };
                remove_existing(&path)?;
                write_atomic(&path, &content)?;
            }
            StateValue::ObjectRef(hash) => {
                if opts.hardlink {
                    repo.pool().link_out(hash, &path)?;
                } else {
                    repo.pool().copy_out(hash, &path)?;
                }
            }
        }
        debug!(key = %key, "checked out");
    }
    Ok(())
}
