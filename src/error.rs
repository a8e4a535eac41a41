use std::fmt;
use std::path::PathBuf;

use crate::Hash;

/// error type for pvr operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("repository not found at {0}")]
    NoRepo(PathBuf),

    #[error("repository already exists at {0}")]
    RepoExists(PathBuf),

    #[error("malformed json in {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed {what}: {message}")]
    Malformed { what: &'static str, message: String },

    #[error("expected a json object: {0}")]
    NotObject(String),

    #[error("number out of range: {0}")]
    NumberOverflow(String),

    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),

    #[error("invalid glob pattern {pattern}: {message}")]
    InvalidGlob { pattern: String, message: String },

    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("corrupt object: expected {expected}, found {actual}")]
    CorruptObject { expected: Hash, actual: Hash },

    #[error("object not found: {0}")]
    ObjectNotFound(Hash),

    #[error("corrupt repository state at {0}: {1}")]
    CorruptState(PathBuf, String),

    #[error("path collision at {0}: a non-directory is in the way")]
    PathCollision(PathBuf),

    #[error("missing: {0}")]
    Missing(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed WWW-Authenticate header: {0}")]
    Challenge(String),

    #[error("remote {url} answered {status}: {message}")]
    HttpStatus {
        url: String,
        status: u16,
        message: String,
    },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("{failed} of {total} object transfers failed: {first}", failed = .failures.len(), first = FirstFailure(.failures))]
    Transfers {
        total: usize,
        failures: Vec<TransferFailure>,
    },

    #[error("external tool {tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("signature error: {0}")]
    Signature(String),

    #[error("jws error: {0}")]
    Jws(#[from] jsonwebtoken::errors::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("state changed during {0}")]
    Conflict(String),

    #[error("lock contention on repository")]
    LockContention,

    #[error("cannot create device node without privileges: {0}")]
    DeviceNodePermission(PathBuf),

    #[error("xattr error on {path}: {message}")]
    Xattr { path: PathBuf, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// one failed job out of a transfer batch
#[derive(Debug)]
pub struct TransferFailure {
    pub name: String,
    pub error: Error,
}

struct FirstFailure<'a>(&'a [TransferFailure]);

impl fmt::Display for FirstFailure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.first() {
            Some(failure) => write!(f, "{}: {}", failure.name, failure.error),
            None => write!(f, "no details"),
        }
    }
}

/// coarse failure classes, used for exit codes and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Malformed,
    Integrity,
    Missing,
    Authz,
    Remote,
    ExternalTool,
    Conflict,
    Cancelled,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Json { .. }
            | Error::Malformed { .. }
            | Error::NotObject(_)
            | Error::NumberOverflow(_)
            | Error::InvalidHashHex(_)
            | Error::InvalidGlob { .. }
            | Error::InvalidUrl { .. }
            | Error::Archive(_) => ErrorKind::Malformed,

            Error::CorruptObject { .. }
            | Error::CorruptState(..)
            | Error::PathCollision(_)
            | Error::Signature(_)
            | Error::Jws(_) => ErrorKind::Integrity,

            Error::NoRepo(_) | Error::ObjectNotFound(_) | Error::Missing(_) => ErrorKind::Missing,

            Error::Auth(_) | Error::Challenge(_) => ErrorKind::Authz,

            Error::HttpStatus { .. } | Error::Http(_) | Error::Remote(_) => ErrorKind::Remote,

            Error::Transfers { failures, .. } => failures
                .first()
                .map(|f| f.error.kind())
                .unwrap_or(ErrorKind::Remote),

            Error::Tool { .. } | Error::DeviceNodePermission(_) => ErrorKind::ExternalTool,

            Error::RepoExists(_) | Error::Conflict(_) | Error::LockContention => {
                ErrorKind::Conflict
            }

            Error::Cancelled => ErrorKind::Cancelled,

            Error::Io { .. } | Error::Xattr { .. } => ErrorKind::Io,
        }
    }

    /// process exit status for this error; never zero
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Malformed => 2,
            ErrorKind::Integrity => 3,
            ErrorKind::Missing => 4,
            ErrorKind::Authz => 5,
            ErrorKind::Remote => 6,
            ErrorKind::ExternalTool => 7,
            ErrorKind::Conflict => 8,
            ErrorKind::Cancelled => 130,
            ErrorKind::Io => 1,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Json {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_have_distinct_exit_codes() {
        let malformed = Error::NotObject("x".into());
        let missing = Error::Missing("json".into());
        let auth = Error::Auth("nope".into());
        let remote = Error::Remote("boom".into());

        let codes = [
            malformed.exit_code(),
            missing.exit_code(),
            auth.exit_code(),
            remote.exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            assert_ne!(*a, 0);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_transfers_takes_kind_of_first_failure() {
        let err = Error::Transfers {
            total: 3,
            failures: vec![TransferFailure {
                name: "bsp/kernel.img".into(),
                error: Error::CorruptObject {
                    expected: Hash::ZERO,
                    actual: Hash::ZERO,
                },
            }],
        };
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(err.to_string().contains("bsp/kernel.img"));
        assert!(err.to_string().starts_with("1 of 3"));
    }
}
