//! Performs one bind mount with the full two-step (bind, then remount with
//! flags) discipline spec §4.5 requires to actually establish
//! `NOSUID`/`NODEV`/`RDONLY` on a Linux bind mount.

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::config::{PropagationStyle, RuntimeConfig};
use crate::error::{CoreError, Result};
use crate::mount_list::MountList;

const OVERWRITE_RETRIES: u32 = 3;
const OVERWRITE_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Propagation mode override for a single bind mount, taking precedence
/// over [`RuntimeConfig::mount_propagation_style`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// `MS_SLAVE`.
    Slave,
    /// `MS_PRIVATE`.
    Private,
}

/// One bind-mount request.
#[derive(Debug, Clone)]
pub struct BindSpec {
    /// Host-side (or already-in-container) source path.
    pub source: PathBuf,
    /// Destination inside the container.
    pub target: PathBuf,
    /// Mount read-only after the bind.
    pub read_only: bool,
    /// Use `MS_REC` for both the bind and the propagation step.
    pub recursive: bool,
    /// Propagation override; falls back to the runtime config default.
    pub propagation: Option<Propagation>,
}

impl BindSpec {
    /// A plain read-write, non-recursive bind of `source` onto `target`.
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
            recursive: false,
            propagation: None,
        }
    }

    /// Mark this bind read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Mark this bind recursive.
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    fn is_dev(&self) -> bool {
        self.source == Path::new("/dev") || self.source.starts_with("/dev/")
    }
}

/// Perform a bind mount per the spec §4.5 sequence, tracking the result in
/// `mounts`.
pub fn bind_mount(
    config: &RuntimeConfig,
    mounts: &mut MountList,
    spec: &BindSpec,
    overwrite_allowed: bool,
) -> Result<()> {
    let target = std::fs::canonicalize(&spec.target).map_err(|e| CoreError::fs(spec.target.clone(), e))?;

    if mounts.find(&target) {
        if !overwrite_allowed {
            return Err(CoreError::TransientMountCollision(target));
        }
        let mut unmounted = false;
        for attempt in 0..OVERWRITE_RETRIES {
            mounts.unmount_tree(&target)?;
            if MountList::validate_unmounted(&target, false)? {
                unmounted = true;
                break;
            }
            if attempt + 1 < OVERWRITE_RETRIES {
                sleep(OVERWRITE_RETRY_DELAY);
            }
        }
        if !unmounted {
            return Err(CoreError::TransientMountCollision(target));
        }
    }

    let recursive_bind = spec.is_dev() || spec.recursive;
    let mut initial_flags = MsFlags::MS_BIND;
    if recursive_bind {
        initial_flags |= MsFlags::MS_REC;
    }

    mount(
        Some(spec.source.as_path()),
        &target,
        Option::<&str>::None,
        initial_flags,
        Option::<&str>::None,
    )
    .map_err(|e| CoreError::kernel(format!("bind mount {:?} onto {:?}", spec.source, target), e))?;

    mounts.insert(target.clone());

    let remount = (|| -> Result<()> {
        let mut remount_flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_NOSUID;
        if !spec.is_dev() {
            remount_flags |= MsFlags::MS_NODEV;
        }
        if spec.read_only {
            remount_flags |= MsFlags::MS_RDONLY;
        }
        if recursive_bind {
            remount_flags |= MsFlags::MS_REC;
        }
        mount(
            Option::<&str>::None,
            &target,
            Option::<&str>::None,
            remount_flags,
            Option::<&str>::None,
        )
        .map_err(|e| CoreError::kernel(format!("remount {target:?}"), e))?;

        let mut prop_flags = match spec.propagation.unwrap_or(match config.mount_propagation_style {
            PropagationStyle::Slave => Propagation::Slave,
            PropagationStyle::Private => Propagation::Private,
        }) {
            Propagation::Slave => MsFlags::MS_SLAVE,
            Propagation::Private => MsFlags::MS_PRIVATE,
        };
        if spec.is_dev() || spec.recursive {
            prop_flags = MsFlags::MS_PRIVATE;
        }
        if recursive_bind {
            prop_flags |= MsFlags::MS_REC;
        }
        mount(
            Option::<&str>::None,
            &target,
            Option::<&str>::None,
            prop_flags,
            Option::<&str>::None,
        )
        .map_err(|e| CoreError::kernel(format!("propagation mount {target:?}"), e))?;
        Ok(())
    })();

    if let Err(e) = remount {
        let _ = umount2(&target, MntFlags::MNT_DETACH);
        mounts.remove(&target);
        return Err(e);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_sources_are_detected() {
        let spec = BindSpec::new("/dev", "/mnt/dev");
        assert!(spec.is_dev());
        let spec = BindSpec::new("/dev/pts", "/mnt/pts");
        assert!(spec.is_dev());
        let spec = BindSpec::new("/home", "/mnt/home");
        assert!(!spec.is_dev());
    }

    #[test]
    fn builder_sets_flags() {
        let spec = BindSpec::new("/a", "/b").read_only().recursive();
        assert!(spec.read_only);
        assert!(spec.recursive);
    }
}
