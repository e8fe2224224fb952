//! Error taxonomy for the runtime core.
//!
//! Kinds, not type names: every fallible path in this crate resolves to one
//! of these variants so the CLI layer can map failures to the exit codes and
//! diagnostic lines required by the error handling design (argument errors,
//! permission errors, kernel errors, filesystem errors, transient mount
//! collisions, and helper-process failures never cross into user code —
//! they abort setup before `exec`).

use std::path::PathBuf;

/// A core operation failure. See the module docs for the taxonomy this maps
/// to spec §7.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// Malformed CLI, invalid volume-map syntax, disallowed source/target,
    /// conflicting flags.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Config file not root-owned, invalid effective uid/gid, mount target
    /// on an unauthorized device.
    #[error("permission denied: {0}")]
    Permission(String),

    /// mount/umount/unshare/chroot failure.
    #[error("kernel operation {op} failed: {source}")]
    Kernel {
        /// The operation that failed, e.g. "bind mount /a onto /b".
        op: String,
        #[source]
        source: nix::Error,
    },

    /// Image file missing, metadata file absent, destination directory
    /// non-creatable.
    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        /// The path the failing operation concerned.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Target already mounted; retries under `overwrite` were exhausted.
    #[error("mount target {0} still busy after retries")]
    TransientMountCollision(PathBuf),

    /// A shelled-out helper (`cp`, `mv`, `chmod`, `dd`, `mkfs.xfs`, `mount`)
    /// returned non-zero.
    #[error("helper process {program} failed: {detail}")]
    HelperProcess {
        /// The helper binary invoked.
        program: String,
        /// Exit status or spawn error detail.
        detail: String,
    },
}

impl CoreError {
    /// Wrap a `nix::Error` with the operation description that failed.
    pub fn kernel(op: impl Into<String>, source: nix::Error) -> Self {
        CoreError::Kernel {
            op: op.into(),
            source,
        }
    }

    /// Wrap a `std::io::Error` with the path it concerned.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, CoreError>;
