//! high-level operations on pvr repositories

mod archive;
mod checkout;
mod commit;
mod diff;
mod dm;
mod fsck;
mod overlay;
mod scan;

pub use archive::{export, import, ArchiveSummary};
pub use checkout::{checkout_state, reset, ResetOptions};
pub use commit::{commit, CommitSummary, CHECKPOINT_KEY};
pub use diff::{diff, diff_states, status};
pub use dm::{dm_apply, dm_convert, DmManifest, DmVolume, DM_DIR};
pub use fsck::{check_objects, FsckReport, ObjectProblem};
pub use overlay::{mk_overlay, OverlaySummary};
pub use scan::{stage, stage_keys, working_document, WorkingCopy};

pub(crate) use diff::status_of;
pub(crate) use scan::working_document_with;
