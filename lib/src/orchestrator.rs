//! The two top-level entry points: the interactive `shifter` state machine
//! and the privileged prolog `setupRoot` entry. Both drive the same
//! underlying components; the prolog simply stops short of chroot/exec.

use std::path::Path;

use nix::mount::MsFlags;
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{chdir, chroot};

use crate::config::RuntimeConfig;
use crate::config_compare;
use crate::env_compose;
use crate::error::{CoreError, Result};
use crate::image_binder;
use crate::image_metadata::ImageMetadata;
use crate::loop_mount;
use crate::mount_list::MountList;
use crate::priv_drop;
use crate::site_stager;
use crate::volume_map::VolumeMap;

/// The request parameters shared by both entry points, already parsed out
/// of the CLI layer.
#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub image_identifier: String,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub aux_gids: Vec<u32>,
    pub user_volume_map: VolumeMap,
    pub nodespec: Option<String>,
}

/// Resolve the argv to exec. If `entrypoint_requested` and the image
/// declares one, the image entrypoint leads, followed by any user args;
/// otherwise user args are used directly; with neither, default to
/// `/bin/sh`.
pub fn calculate_args(entrypoint_requested: bool, image: &ImageMetadata, user_args: &[String]) -> Vec<String> {
    if entrypoint_requested {
        if let Some(entry) = &image.entrypoint {
            let mut args = vec![entry.clone()];
            args.extend(user_args.iter().cloned());
            return args;
        }
    }
    if !user_args.is_empty() {
        return user_args.to_vec();
    }
    vec!["/bin/sh".to_string()]
}

/// Everything from `UNSHARE_NS` through `SAVE_CONFIG` + `REMOUNT_RO`. This
/// is the part the prolog and the non-reuse interactive path share.
fn stage_container(config: &mut RuntimeConfig, mounts: &mut MountList, req: &SetupRequest, meta: &ImageMetadata) -> Result<()> {
    let root = config.udi_mount_point.clone();

    mounts.refresh()?;
    if mounts.find(&root) {
        mounts.unmount_tree(&root)?;
        let mut unmounted = false;
        for attempt in 0..10 {
            if MountList::validate_unmounted(&root, true)? {
                unmounted = true;
                break;
            }
            if attempt + 1 < 10 {
                std::thread::sleep(std::time::Duration::from_millis(300));
            }
        }
        if !unmounted {
            return Err(CoreError::TransientMountCollision(root));
        }
    }

    if meta.use_loop_mount() {
        loop_mount::loop_mount(config, meta, true)?;
    }

    std::fs::create_dir_all(&root).map_err(|e| CoreError::fs(root.clone(), e))?;
    nix::mount::mount(
        Some(config.rootfs_type.as_str()),
        &root,
        Some(config.rootfs_type.as_str()),
        MsFlags::empty(),
        Option::<&str>::None,
    )
    .map_err(|e| CoreError::kernel(format!("mount rootfs at {}", root.display()), e))?;
    mounts.insert(root.clone());

    nix::mount::mount(
        Option::<&str>::None,
        &root,
        Option::<&str>::None,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        Option::<&str>::None,
    )
    .map_err(|e| CoreError::kernel(format!("make {} private", root.display()), e))?;

    let root_dev = std::fs::metadata(&root).map_err(|e| CoreError::fs(root.clone(), e))?;
    let root_dev = std::os::unix::fs::MetadataExt::dev(&root_dev);
    config.bind_mount_allowed_devices.clear();
    config.bind_mount_allowed_devices.insert(root_dev);

    site_stager::create_skeleton(&root)?;
    site_stager::run_hook(config.site_pre_mount_hook.as_deref())?;
    let site_map = config.site_volume_map.clone();
    site_stager::apply_site_volume_map(config, mounts, &root, &site_map, root_dev)?;
    site_stager::run_hook(config.site_post_mount_hook.as_deref())?;
    site_stager::copy_host_network_files(&root)?;

    if let Some(overlay) = config.site_etc_dir.clone() {
        site_stager::populate_etc_static(&root, &overlay)?;
    } else if config.populate_etc_dynamically {
        site_stager::populate_etc_dynamic(&root, &req.username, req.uid, req.gid, config.allow_libc_pwd_calls)?;
    }
    site_stager::finalize_etc_core_files(&root)?;
    site_stager::create_empty_shadow(&root)?;
    site_stager::apply_group_filter(&root, &req.username, config.max_group_count)?;

    if let Some(overlay) = config.site_udiimage_overlay.clone() {
        site_stager::copy_udiimage_overlay(&root, &overlay)?;
    }
    if let Some(nodespec) = &req.nodespec {
        site_stager::write_hostsfile(&root, nodespec)?;
    }

    site_stager::mount_proc_and_bind_dev(config, mounts, &root)?;

    let image_root = if meta.use_loop_mount() {
        config.loop_mount_point.clone()
    } else {
        meta.filename.clone()
    };
    for rel in ["", "var", "opt"] {
        image_binder::bind_image_into_udi(config, mounts, &image_root, &root, Path::new(rel), false)?;
    }
    image_binder::bind_image_into_udi(config, mounts, &image_root, &root, Path::new("etc"), true)?;

    for entry in req.user_volume_map.entries() {
        crate::user_mounter::setup_volume_map_mount(
            config,
            mounts,
            &root,
            entry,
            req.uid,
            req.gid,
            &req.aux_gids,
            Some(*config.bind_mount_allowed_devices.iter().next().unwrap_or(&0)),
        )?;
    }

    config_compare::save_config(&root, &req.image_identifier, &req.username, &req.user_volume_map)?;

    if !config.mount_udi_root_writable {
        nix::mount::mount(
            Option::<&str>::None,
            &root,
            Option::<&str>::None,
            MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
            Option::<&str>::None,
        )
        .map_err(|e| CoreError::kernel(format!("remount {} read-only", root.display()), e))?;
    }

    Ok(())
}

/// Drop into the (already-staged) container root: chdir, chroot, chdir
/// `/`, then finish descending privilege.
fn chroot_and_drop(req: &SetupRequest, root: &Path) -> Result<()> {
    chdir(root).map_err(|e| CoreError::kernel("chdir container root", e))?;
    chroot(".").map_err(|e| CoreError::kernel("chroot", e))?;
    chdir("/").map_err(|e| CoreError::kernel("chdir /", e))?;
    priv_drop::drop_privileges(req.uid, req.gid, &req.aux_gids)
}

/// The privileged, once-per-node prolog entry. Runs everything through
/// `SAVE_CONFIG`/`REMOUNT_RO`, leaving the container assembled in the
/// global namespace for later unprivileged processes to chroot into.
pub fn run_prolog(config: &mut RuntimeConfig, mounts: &mut MountList, req: &SetupRequest, meta: &ImageMetadata) -> Result<()> {
    stage_container(config, mounts, req, meta)
}

/// The interactive entry. If a live container already matches this
/// request's identity, skips straight to chroot; otherwise stages a fresh
/// one first. Returns the resolved argv the caller should `exec`.
pub fn run_interactive(
    config: &mut RuntimeConfig,
    mounts: &mut MountList,
    req: &SetupRequest,
    meta: &ImageMetadata,
    entrypoint_requested: bool,
    user_args: &[String],
    workdir_override: Option<&str>,
) -> Result<(Vec<String>, Vec<(String, String)>)> {
    let root = config.udi_mount_point.clone();
    let reused = config_compare::matches_existing(&root, &req.image_identifier, &req.username, &req.user_volume_map)?;

    if !reused {
        unshare(CloneFlags::CLONE_NEWNS).map_err(|e| CoreError::kernel("unshare mount namespace", e))?;
        nix::mount::mount(
            Option::<&str>::None,
            Path::new("/"),
            Option::<&str>::None,
            MsFlags::MS_SLAVE | MsFlags::MS_REC,
            Option::<&str>::None,
        )
        .map_err(|e| CoreError::kernel("remount / as slave", e))?;
        stage_container(config, mounts, req, meta)?;
    }

    chroot_and_drop(req, &root)?;

    let args = calculate_args(entrypoint_requested, meta, user_args);

    let workdir = workdir_override
        .map(str::to_string)
        .or_else(|| meta.workdir.clone())
        .unwrap_or_else(|| "/".to_string());
    chdir(Path::new(&workdir)).map_err(|e| CoreError::kernel(format!("chdir workdir {workdir}"), e))?;

    let current_env: Vec<(String, String)> = std::env::vars().collect();
    let mut env = env_compose::compose(&current_env, meta, &config.site_env);
    env_compose::propagate_container_path(&mut env, "/usr/local/bin:/usr/bin:/bin");

    Ok((args, env))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_metadata::ImageFormat;

    fn image(entry: Option<&str>) -> ImageMetadata {
        ImageMetadata {
            identifier: "img".to_string(),
            filename: "/x".into(),
            format: ImageFormat::Vfs,
            env: Vec::new(),
            entrypoint: entry.map(str::to_string),
            workdir: None,
            volume: Vec::new(),
        }
    }

    #[test]
    fn entrypoint_leads_when_requested_and_declared() {
        let img = image(Some("/bin/myapp"));
        let args = calculate_args(true, &img, &["--flag".to_string()]);
        assert_eq!(args, vec!["/bin/myapp".to_string(), "--flag".to_string()]);
    }

    #[test]
    fn user_args_used_when_entrypoint_not_requested() {
        let img = image(Some("/bin/myapp"));
        let args = calculate_args(false, &img, &["/bin/bash".to_string()]);
        assert_eq!(args, vec!["/bin/bash".to_string()]);
    }

    #[test]
    fn defaults_to_bin_sh() {
        let img = image(None);
        let args = calculate_args(false, &img, &[]);
        assert_eq!(args, vec!["/bin/sh".to_string()]);
    }
}
