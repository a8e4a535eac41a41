//! pvr - versioned device state
//!
//! a content-addressed repository of the system state of an embedded device.
//! the whole state is one canonical JSON document; leaves are either inline
//! JSON or SHA-256 digests of opaque files kept in an object pool.
//!
//! # Core concepts
//!
//! - **State**: the JSON document, keyed by relative path, with a `#spec` key
//! - **Object**: an opaque file named by the SHA-256 of its content
//! - **Pristine**: the last committed state, kept in `.pvr/json`
//! - **Working copy**: the files under the repository root
//! - **Fragment**: a comma separated selector of key prefixes, `-` excludes
//!
//! # Example usage
//!
//! ```no_run
//! use pvr::{ops, Repo};
//! use std::path::Path;
//!
//! // initialize a repository
//! let repo = Repo::init(Path::new("/path/to/device")).unwrap();
//!
//! // stage every file and commit it
//! ops::stage(&repo, &[], false).unwrap();
//! ops::commit(&repo, "initial state", false).unwrap();
//!
//! // rewrite the working copy from the pristine state
//! ops::reset(&repo, ops::ResetOptions::default()).unwrap();
//! ```

mod config;
mod error;
mod hash;
mod object;
mod repo;
mod tools;

pub mod fragment;
pub mod fs;
pub mod json;
pub mod ops;
pub mod session;
pub mod sig;
pub mod source;
pub mod transport;
pub mod types;

pub use config::{
    EnvConfig, GlobalConfig, ProxyMode, RepoConfig, DEFAULT_BASE_URL, DEFAULT_REPO_BASE_URL,
    MAX_REDIRECTS, USER_AGENT,
};
pub use error::{Error, ErrorKind, Result, TransferFailure};
pub use fragment::{Fragment, MergeMode};
pub use hash::{hash_file, is_digest, Hash};
pub use object::ObjectPool;
pub use repo::{Repo, RepoLock, META_DIR};
pub use tools::{parse_root_hash, SystemTools, ToolBox, DOCKER_SOCKET};
pub use types::{State, StateValue, Status};
