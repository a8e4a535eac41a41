pub mod read;
pub mod write;

pub use read::{files_equal, read_symlink_target, read_xattrs, FileMetadata, FileType, Xattr};
pub use write::{
    apply_metadata, copy_with_attributes, create_whiteout, ensure_parent_dir, fsync_dir,
    remove_existing, write_atomic, write_atomic_with_suffix,
};
