//! adapters for the external programs pvr drives
//!
//! everything that shells out goes through [`ToolBox`] so callers can swap
//! in fakes.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fs::create_whiteout;
use crate::json;

/// default docker daemon socket checked for the local image fallback
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

pub trait ToolBox: Send + Sync {
    /// build a dm-verity hash device for `data`; returns the tool's report
    fn verity_format(&self, data: &Path, hash: &Path, salt: &str) -> Result<String>;

    /// pack `src` into a squashfs image at `dst`
    fn mksquashfs(&self, src: &Path, dst: &Path, compression: &str) -> Result<()>;

    /// create an overlayfs whiteout at `path`
    fn mknod_whiteout(&self, path: &Path) -> Result<()>;

    /// true when a local docker daemon can be used
    fn docker_available(&self) -> bool;

    /// `docker save` an image to a tarball
    fn docker_save(&self, image: &str, dst: &Path) -> Result<()>;

    /// `docker inspect` an image
    fn docker_inspect(&self, image: &str) -> Result<Value>;
}

/// runs the real programs found on PATH
#[derive(Clone, Debug, Default)]
pub struct SystemTools {
    docker_socket: Option<PathBuf>,
}

impl SystemTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_docker_socket(mut self, socket: impl Into<PathBuf>) -> Self {
        self.docker_socket = Some(socket.into());
        self
    }

    fn locate(program: &str) -> Result<PathBuf> {
        which::which(program).map_err(|e| Error::tool(program, format!("not found on PATH: {e}")))
    }

    fn run(program: &str, cmd: &mut Command) -> Result<Output> {
        debug!(program, command = ?cmd, "running external tool");
        let output = cmd
            .output()
            .map_err(|e| Error::tool(program, format!("failed to start: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::tool(
                program,
                format!("exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(output)
    }
}

impl ToolBox for SystemTools {
    fn verity_format(&self, data: &Path, hash: &Path, salt: &str) -> Result<String> {
        let program = Self::locate("veritysetup")?;
        let output = Self::run(
            "veritysetup",
            Command::new(program)
                .arg("format")
                .arg(format!("--salt={salt}"))
                .arg(data)
                .arg(hash),
        )?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn mksquashfs(&self, src: &Path, dst: &Path, compression: &str) -> Result<()> {
        let program = Self::locate("mksquashfs")?;
        Self::run(
            "mksquashfs",
            Command::new(program)
                .arg(src)
                .arg(dst)
                .args(["-noappend", "-no-progress", "-comp", compression])
                // pins inode and superblock timestamps
                .env("SOURCE_DATE_EPOCH", "0"),
        )?;
        Ok(())
    }

    fn mknod_whiteout(&self, path: &Path) -> Result<()> {
        match create_whiteout(path) {
            Err(Error::DeviceNodePermission(p)) => {
                let Ok(program) = which::which("mknod") else {
                    return Err(Error::DeviceNodePermission(p));
                };
                // helpers like fakeroot intercept the external call
                Self::run(
                    "mknod",
                    Command::new(program).arg(path).args(["c", "0", "0"]),
                )
                .map_err(|_| Error::DeviceNodePermission(p))?;
                Ok(())
            }
            other => other,
        }
    }

    fn docker_available(&self) -> bool {
        let socket = self
            .docker_socket
            .clone()
            .unwrap_or_else(|| PathBuf::from(DOCKER_SOCKET));
        socket.exists() && which::which("docker").is_ok()
    }

    fn docker_save(&self, image: &str, dst: &Path) -> Result<()> {
        let program = Self::locate("docker")?;
        Self::run(
            "docker",
            Command::new(program).arg("save").arg("-o").arg(dst).arg(image),
        )?;
        Ok(())
    }

    fn docker_inspect(&self, image: &str) -> Result<Value> {
        let program = Self::locate("docker")?;
        let output = Self::run(
            "docker",
            Command::new(program).args(["image", "inspect", image]),
        )?;
        let value = json::parse(&output.stdout, "docker inspect")?;
        match value {
            Value::Array(mut items) if !items.is_empty() => Ok(items.swap_remove(0)),
            _ => Err(Error::tool("docker", format!("no image {image}"))),
        }
    }
}

/// pull the `Root hash:` value out of a verity tool report
pub fn parse_root_hash(report: &str) -> Result<String> {
    report
        .lines()
        .find_map(|line| line.trim().strip_prefix("Root hash:"))
        .map(|rest| rest.trim().to_string())
        .filter(|hash| !hash.is_empty() && hash.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or_else(|| Error::tool("veritysetup", "no root hash in output"))
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::hash::hash_file;
    use std::sync::Mutex;

    /// deterministic stand-in for the external programs
    #[derive(Default)]
    pub struct FakeTools {
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeTools {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ToolBox for FakeTools {
        fn verity_format(&self, data: &Path, hash: &Path, salt: &str) -> Result<String> {
            self.calls.lock().unwrap().push(format!("verity {}", data.display()));
            let digest = hash_file(data)?;
            let root = crate::hash::Hash::of_bytes(format!("{digest}{salt}").as_bytes());
            std::fs::write(hash, root.as_bytes()).unwrap();
            Ok(format!(
                "VERITY header information for {}\nSalt:            \t{salt}\nRoot hash:      \t{root}\n",
                hash.display()
            ))
        }

        fn mksquashfs(&self, src: &Path, dst: &Path, compression: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("mksquashfs {compression}"));
            // a sorted listing of the tree stands in for the image
            let mut listing = String::new();
            for entry in walkdir::WalkDir::new(src).sort_by_file_name() {
                let entry = entry.unwrap();
                listing.push_str(&entry.path().strip_prefix(src).unwrap().display().to_string());
                if entry.file_type().is_file() {
                    listing.push_str(&format!(" {}", hash_file(entry.path()).unwrap()));
                }
                listing.push('\n');
            }
            std::fs::write(dst, listing).unwrap();
            Ok(())
        }

        fn mknod_whiteout(&self, path: &Path) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("whiteout {}", path.display()));
            match create_whiteout(path) {
                // unprivileged test runs record a marker instead
                Err(Error::DeviceNodePermission(_)) => {
                    std::fs::write(path, "whiteout").unwrap();
                    Ok(())
                }
                other => other,
            }
        }

        fn docker_available(&self) -> bool {
            false
        }

        fn docker_save(&self, image: &str, _dst: &Path) -> Result<()> {
            Err(Error::tool("docker", format!("unavailable for {image}")))
        }

        fn docker_inspect(&self, image: &str) -> Result<Value> {
            Err(Error::tool("docker", format!("unavailable for {image}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_root_hash() {
        let report = "VERITY header information for x.hash\n\
                      UUID:            \t1234\n\
                      Hash type:       \t1\n\
                      Root hash:      \tabc123def\n\
                      Salt:            \t00ff\n";
        assert_eq!(parse_root_hash(report).unwrap(), "abc123def");
        assert!(matches!(parse_root_hash("nothing"), Err(Error::Tool { .. })));
        assert!(parse_root_hash("Root hash: zz").is_err());
    }

    #[test]
    fn test_missing_program_is_tool_error() {
        let err = SystemTools::locate("pvr-no-such-program").unwrap_err();
        assert!(matches!(err, Error::Tool { .. }));
    }
}
