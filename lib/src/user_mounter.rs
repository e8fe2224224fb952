//! Applies user-requested volume mounts (`setupVolumeMapMounts` with
//! `userRequested=1`): realpath/stat the source under the invoking user's
//! own identity, validate against the user rule set, then bind-mount or
//! build and loop-mount a per-node cache.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{self, Gid, Uid};

use crate::bind_mount::{self, BindSpec};
use crate::config::RuntimeConfig;
use crate::error::{CoreError, Result};
use crate::image_metadata::ImageFormat;
use crate::loop_mount;
use crate::mount_list::MountList;
use crate::task::Task;
use crate::validator::{self, RequestKind};
use crate::volume_map::{VolumeFlag, VolumeMapEntry};

struct AssumedIdentity {
    saved_euid: Uid,
    saved_egid: Gid,
    saved_groups: Vec<Gid>,
}

impl AssumedIdentity {
    fn assume(uid: u32, gid: u32, aux_gids: &[u32]) -> Result<Self> {
        let saved_euid = unistd::geteuid();
        let saved_egid = unistd::getegid();
        let saved_groups = unistd::getgroups().map_err(|e| CoreError::kernel("getgroups", e))?;

        let target_groups: Vec<Gid> = aux_gids.iter().map(|g| Gid::from_raw(*g)).collect();
        unistd::setgroups(&target_groups).map_err(|e| CoreError::kernel("setgroups", e))?;
        unistd::setegid(Gid::from_raw(gid)).map_err(|e| CoreError::kernel("setegid", e))?;
        unistd::seteuid(Uid::from_raw(uid)).map_err(|e| CoreError::kernel("seteuid", e))?;

        Ok(Self {
            saved_euid,
            saved_egid,
            saved_groups,
        })
    }

    fn restore(self) -> Result<()> {
        unistd::seteuid(self.saved_euid).map_err(|e| CoreError::kernel("seteuid restore", e))?;
        unistd::setegid(self.saved_egid).map_err(|e| CoreError::kernel("setegid restore", e))?;
        unistd::setgroups(&self.saved_groups).map_err(|e| CoreError::kernel("setgroups restore", e))?;
        Ok(())
    }
}

/// Realpath `from_buffer` as the target user, rejecting anything that is
/// not a directory. Restores the caller's identity before returning,
/// success or failure.
fn realpath_as_target_user(path: &Path, uid: u32, gid: u32, aux_gids: &[u32]) -> Result<PathBuf> {
    let identity = AssumedIdentity::assume(uid, gid, aux_gids)?;
    let result = (|| -> Result<PathBuf> {
        let real = fs::canonicalize(path).map_err(|e| CoreError::fs(path.to_path_buf(), e))?;
        let meta = fs::symlink_metadata(&real).map_err(|e| CoreError::fs(real.clone(), e))?;
        if !meta.is_dir() {
            return Err(CoreError::Permission(format!("{} is not a directory", real.display())));
        }
        Ok(real)
    })();
    identity.restore()?;
    result
}

fn hostname() -> String {
    unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Allocate a sparse backing file of `size` bytes under
/// `config.per_node_cache_path`, format it if `fstype == "xfs"`.
fn create_cache_backing_file(config: &RuntimeConfig, uid: u32, gid: u32, size: u64, fstype: &str) -> Result<PathBuf> {
    let prefix = format!("perNodeCache_uid{uid}_gid{gid}_{}.{fstype}.", hostname());
    let file = tempfile::Builder::new()
        .prefix(&prefix)
        .permissions(fs::Permissions::from_mode(0o600))
        .tempfile_in(&config.per_node_cache_path)
        .map_err(|e| CoreError::fs(config.per_node_cache_path.clone(), e))?;
    let (_, path) = file.keep().map_err(|e| CoreError::fs(config.per_node_cache_path.clone(), e.error))?;

    Task::new_and_run(
        format!("allocating {size} bytes for per-node cache {}", path.display()),
        config.dd_path.to_string_lossy().as_ref(),
        [
            "if=/dev/zero",
            &format!("of={}", path.display()),
            "bs=1",
            "count=0",
            &format!("seek={size}"),
        ],
    )
    .map_err(|e| {
        let _ = fs::remove_file(&path);
        e
    })?;

    if fstype == "xfs" {
        Task::new_and_run(
            format!("formatting per-node cache {} as xfs", path.display()),
            config.mkfs_xfs_path.to_string_lossy().as_ref(),
            [path.to_string_lossy().as_ref()],
        )
        .map_err(|e| {
            let _ = fs::remove_file(&path);
            e
        })?;
    }

    Ok(path)
}

/// Apply one user-requested volume map entry against the already-mounted
/// container.
#[allow(clippy::too_many_arguments)]
pub fn setup_volume_map_mount(
    config: &RuntimeConfig,
    mounts: &mut MountList,
    container_root: &Path,
    entry: &VolumeMapEntry,
    uid: u32,
    gid: u32,
    aux_gids: &[u32],
    create_to_device: Option<u64>,
) -> Result<()> {
    validator::validate(entry, RequestKind::User)?;

    let from_buffer = container_root.join(entry.source.trim_start_matches('/'));
    let to_buffer = container_root.join(entry.target.trim_start_matches('/'));

    let per_node_cache = entry.per_node_cache();

    let from_real = if per_node_cache.is_some() {
        from_buffer.clone()
    } else {
        realpath_as_target_user(&from_buffer, uid, gid, aux_gids)?
    };

    if !from_real.starts_with(container_root) && per_node_cache.is_none() {
        return Err(CoreError::Permission(
            "user bind source must resolve within the container root".to_string(),
        ));
    }

    if let Some(parent) = to_buffer.parent() {
        if !to_buffer.exists() {
            if let Some(dev) = create_to_device {
                let parent_dev = fs::metadata(parent).map_err(|e| CoreError::fs(parent.to_path_buf(), e))?.dev();
                if parent_dev != dev {
                    return Err(CoreError::Permission(format!(
                        "{} is not on the device authorized for mount-point creation",
                        parent.display()
                    )));
                }
                fs::create_dir_all(&to_buffer).map_err(|e| CoreError::fs(to_buffer.clone(), e))?;
            } else {
                return Err(CoreError::Filesystem {
                    path: to_buffer.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "mount target does not exist"),
                });
            }
        }
    }

    let to_real = fs::canonicalize(&to_buffer).map_err(|e| CoreError::fs(to_buffer.clone(), e))?;
    if !to_real.starts_with(container_root) {
        return Err(CoreError::Permission(
            "mount target must resolve within the container root".to_string(),
        ));
    }

    let target_dev = fs::metadata(&to_real).map_err(|e| CoreError::fs(to_real.clone(), e))?.dev();
    if !config.bind_mount_allowed_devices.contains(&target_dev) {
        return Err(CoreError::Permission(format!(
            "{} is not on a device authorized for bind-mount targets",
            to_real.display()
        )));
    }

    if let Some(cache) = per_node_cache {
        let backing = create_cache_backing_file(config, uid, gid, cache.cache_size, &cache.fstype)?;
        let result = (|| -> Result<()> {
            let meta = crate::image_metadata::ImageMetadata {
                identifier: "perNodeCache".to_string(),
                filename: backing.clone(),
                format: ImageFormat::Xfs,
                env: Vec::new(),
                entrypoint: None,
                workdir: None,
                volume: Vec::new(),
            };
            loop_mount::loop_mount(config, &meta, false)?;
            mounts.insert(to_real.clone());
            unistd::chown(&to_real, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
                .map_err(|e| CoreError::kernel("chown per-node cache mount point", e))?;
            Ok(())
        })();
        let _ = fs::remove_file(&backing);
        result?;
    } else {
        let spec = BindSpec {
            source: from_real,
            target: to_real,
            read_only: entry.has_flag(&VolumeFlag::ReadOnly),
            recursive: entry.has_flag(&VolumeFlag::Recursive),
            propagation: None,
        };
        bind_mount::bind_mount(config, mounts, &spec, true)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn rejects_entries_the_user_rules_forbid() {
        let cfg = RuntimeConfig::from_map(&BTreeMap::new());
        let mut mounts = MountList::parse().unwrap();
        let entry = crate::volume_map::VolumeMap::parse("/host:/etc/passwd:ro", false).unwrap().entries()[0].clone();
        let err = setup_volume_map_mount(&cfg, &mut mounts, Path::new("/tmp"), &entry, 1000, 1000, &[], None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Argument(_)));
    }
}
