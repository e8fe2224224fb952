//! Prepares the freshly-mounted, still-empty container root: skeleton
//! directories, hooks, site volume mounts, `/etc` population, the group
//! file filter, the `/opt/udiImage` overlay, and the proc/sys/dev/tmp
//! mounts.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use nix::mount::MsFlags;
use nix::unistd::{Group, User};

use crate::bind_mount::{self, BindSpec};
use crate::config::RuntimeConfig;
use crate::error::{CoreError, Result};
use crate::mount_list::MountList;
use crate::task::Task;
use crate::validator::{self, RequestKind};
use crate::volume_map::VolumeMap;

const SKELETON_DIRS: &[&str] = &[
    "etc", "etc/udiImage", "opt", "opt/udiImage", "var", "var/spool", "var/run", "var/empty", "proc", "sys", "dev",
    "tmp",
];

/// Create the mandatory skeleton under `root`. `var/empty` is mode 0700,
/// `tmp` is mode 0777; everything else takes the process default.
pub fn create_skeleton(root: &Path) -> Result<()> {
    for rel in SKELETON_DIRS {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).map_err(|e| CoreError::fs(dir.clone(), e))?;
        let mode = match *rel {
            "var/empty" => Some(0o700),
            "tmp" => Some(0o777),
            _ => None,
        };
        if let Some(mode) = mode {
            fs::set_permissions(&dir, fs::Permissions::from_mode(mode)).map_err(|e| CoreError::fs(dir, e))?;
        }
    }
    Ok(())
}

/// Run a site hook script with `/bin/sh`. A non-zero exit is fatal.
pub fn run_hook(hook: Option<&Path>) -> Result<()> {
    let Some(hook) = hook else {
        return Ok(());
    };
    Task::new_and_run(
        format!("running site hook {}", hook.display()),
        "/bin/sh",
        [hook.to_string_lossy().as_ref()],
    )
}

/// Apply the site's VolumeMap against `root`, validating each entry with
/// the site rule set. `create_to_device` is the container-root device-id:
/// a mount-point parent may only be created on that device, and the
/// resolved target must land on a device in
/// `config.bind_mount_allowed_devices` before the bind-mount proceeds.
pub fn apply_site_volume_map(
    config: &RuntimeConfig,
    mounts: &mut MountList,
    root: &Path,
    map: &VolumeMap,
    create_to_device: u64,
) -> Result<()> {
    for entry in map.entries() {
        validator::validate(entry, RequestKind::Site)?;
        let source = Path::new(&entry.source);
        let target = root.join(entry.target.trim_start_matches('/'));
        if !target.exists() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| CoreError::fs(parent.to_path_buf(), e))?;
                let parent_dev = fs::metadata(parent).map_err(|e| CoreError::fs(parent.to_path_buf(), e))?.dev();
                if parent_dev != create_to_device {
                    return Err(CoreError::Permission(format!(
                        "{} is not on the device authorized for mount-point creation",
                        parent.display()
                    )));
                }
            }
            if source.is_dir() {
                fs::create_dir_all(&target).map_err(|e| CoreError::fs(target.clone(), e))?;
            } else {
                fs::write(&target, []).map_err(|e| CoreError::fs(target.clone(), e))?;
            }
        }
        let target_real = fs::canonicalize(&target).map_err(|e| CoreError::fs(target.clone(), e))?;
        let target_dev = fs::metadata(&target_real).map_err(|e| CoreError::fs(target_real.clone(), e))?.dev();
        if !config.bind_mount_allowed_devices.contains(&target_dev) {
            return Err(CoreError::Permission(format!(
                "{} is not on a device authorized for bind-mount targets",
                target_real.display()
            )));
        }
        let spec = BindSpec {
            source: source.to_path_buf(),
            target,
            read_only: entry.has_flag(&crate::volume_map::VolumeFlag::ReadOnly),
            recursive: entry.has_flag(&crate::volume_map::VolumeFlag::Recursive),
            propagation: None,
        };
        bind_mount::bind_mount(config, mounts, &spec, true)?;
    }
    Ok(())
}

/// Copy host `/etc/hosts` and `/etc/resolv.conf` into the container.
pub fn copy_host_network_files(root: &Path) -> Result<()> {
    for name in ["hosts", "resolv.conf"] {
        let src = Path::new("/etc").join(name);
        let dst = root.join("etc").join(name);
        if src.exists() {
            fs::copy(&src, &dst).map_err(|e| CoreError::fs(dst, e))?;
        }
    }
    Ok(())
}

/// Static branch: copy every file from `overlay` into `root/etc`, mode
/// 0644, refusing to overwrite anything already present.
pub fn populate_etc_static(root: &Path, overlay: &Path) -> Result<()> {
    let dest_etc = root.join("etc");
    for entry in fs::read_dir(overlay).map_err(|e| CoreError::fs(overlay.to_path_buf(), e))? {
        let entry = entry.map_err(|e| CoreError::fs(overlay.to_path_buf(), e))?;
        if !entry.file_type().map_err(|e| CoreError::fs(entry.path(), e))?.is_file() {
            continue;
        }
        let dest = dest_etc.join(entry.file_name());
        if dest.exists() {
            return Err(CoreError::Argument(format!(
                "refusing to overwrite existing {}",
                dest.display()
            )));
        }
        fs::copy(entry.path(), &dest).map_err(|e| CoreError::fs(dest.clone(), e))?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o644)).map_err(|e| CoreError::fs(dest, e))?;
    }
    Ok(())
}

fn passwd_line(username: &str, uid: u32, gid: u32, allow_libc: bool) -> String {
    if allow_libc {
        if let Ok(Some(user)) = User::from_uid(nix::unistd::Uid::from_raw(uid)) {
            return format!(
                "{}:x:{}:{}:{}:{}:{}",
                user.name,
                user.uid.as_raw(),
                user.gid.as_raw(),
                user.gecos.to_string_lossy(),
                user.dir.to_string_lossy(),
                user.shell.to_string_lossy()
            );
        }
    }
    format!("{username}:x:{uid}:{gid}::/home/{username}:/bin/sh")
}

fn group_line(username: &str, gid: u32, allow_libc: bool) -> String {
    if allow_libc {
        if let Ok(Some(group)) = Group::from_gid(nix::unistd::Gid::from_raw(gid)) {
            return format!("{}:x:{}:", group.name, group.gid.as_raw());
        }
    }
    format!("{username}:x:{gid}:")
}

/// Dynamic branch: synthesize `/etc/passwd`, `/etc/group`, `/etc/nsswitch.conf`
/// containing only the target user's and target group's entries.
pub fn populate_etc_dynamic(root: &Path, username: &str, uid: u32, gid: u32, allow_libc: bool) -> Result<()> {
    let etc = root.join("etc");
    let passwd = etc.join("passwd");
    let group = etc.join("group");
    let nsswitch = etc.join("nsswitch.conf");
    fs::write(&passwd, format!("{}\n", passwd_line(username, uid, gid, allow_libc)))
        .map_err(|e| CoreError::fs(passwd, e))?;
    fs::write(&group, format!("{}\n", group_line(username, gid, allow_libc))).map_err(|e| CoreError::fs(group, e))?;
    fs::write(
        &nsswitch,
        "passwd: files\ngroup: files\nhosts: files\nnetworks: files\nservices: files\n",
    )
    .map_err(|e| CoreError::fs(nsswitch, e))?;
    Ok(())
}

/// Fix up ownership/mode on the three files step 7 requires regardless of
/// which population branch ran.
pub fn finalize_etc_core_files(root: &Path) -> Result<()> {
    for name in ["passwd", "group", "nsswitch.conf"] {
        let path = root.join("etc").join(name);
        if !path.exists() {
            return Err(CoreError::Filesystem {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "required /etc file missing"),
            });
        }
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).map_err(|e| CoreError::fs(path, e))?;
    }
    Ok(())
}

/// Create an empty, root-owned `/etc/shadow`.
pub fn create_empty_shadow(root: &Path) -> Result<()> {
    let shadow = root.join("etc/shadow");
    fs::write(&shadow, []).map_err(|e| CoreError::fs(shadow, e))
}

/// Rewrite a `/etc/group`-format text so at most `max_group_count` entries
/// that contain `username` retain it as their sole member; every other
/// entry (over the limit, or never containing the user) is emitted with an
/// empty member list.
pub fn filter_group_file(text: &str, username: &str, max_group_count: usize) -> String {
    let mut kept = 0usize;
    let mut out = String::new();
    for line in text.lines() {
        let mut fields: Vec<&str> = line.splitn(4, ':').collect();
        if fields.len() < 4 {
            out.push_str(line);
            out.push('\n');
            continue;
        }
        let had_user = fields[3].split(',').any(|m| m == username);
        let new_members = if had_user && kept < max_group_count {
            kept += 1;
            username
        } else {
            ""
        };
        fields[3] = new_members;
        out.push_str(&fields.join(":"));
        out.push('\n');
    }
    out
}

/// Step 9: move `/etc/group` aside to `/etc/group.orig`, then write the
/// filtered version back to `/etc/group`.
pub fn apply_group_filter(root: &Path, username: &str, max_group_count: usize) -> Result<()> {
    let group = root.join("etc/group");
    let orig = root.join("etc/group.orig");
    fs::rename(&group, &orig).map_err(|e| CoreError::fs(group.clone(), e))?;
    let text = fs::read_to_string(&orig).map_err(|e| CoreError::fs(orig, e))?;
    let filtered = filter_group_file(&text, username, max_group_count);
    fs::write(&group, filtered).map_err(|e| CoreError::fs(group, e))
}

fn copy_tree_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(|e| CoreError::fs(dst.to_path_buf(), e))?;
    for entry in fs::read_dir(src).map_err(|e| CoreError::fs(src.to_path_buf(), e))? {
        let entry = entry.map_err(|e| CoreError::fs(src.to_path_buf(), e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| CoreError::fs(from.clone(), e))?;
        if file_type.is_dir() {
            copy_tree_recursive(&from, &to)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from).map_err(|e| CoreError::fs(from.clone(), e))?;
            std::os::unix::fs::symlink(&target, &to).map_err(|e| CoreError::fs(to, e))?;
        } else {
            fs::copy(&from, &to).map_err(|e| CoreError::fs(to, e))?;
        }
    }
    Ok(())
}

/// Copy the site's `/opt/udiImage` overlay into the container, recursively,
/// then make the copy world-readable-and-searchable.
pub fn copy_udiimage_overlay(root: &Path, overlay: &Path) -> Result<()> {
    let dest = root.join("opt/udiImage");
    copy_tree_recursive(overlay, &dest)?;
    Task::new_and_run(
        format!("chmod -R a+rX {}", dest.display()),
        "/bin/chmod",
        ["-R", "a+rX", dest.to_string_lossy().as_ref()],
    )
}

/// Parse a node spec `host1/N1 host2/N2 ...` and write `/var/hostsfile`
/// with `hostname` repeated `N` times per host, in the listed order.
pub fn write_hostsfile(root: &Path, nodespec: &str) -> Result<()> {
    let mut out = String::new();
    for token in nodespec.split_whitespace() {
        let (host, count) = token
            .split_once('/')
            .ok_or_else(|| CoreError::Argument(format!("malformed node spec entry: {token}")))?;
        let count: usize = count
            .parse()
            .map_err(|_| CoreError::Argument(format!("malformed node spec count: {token}")))?;
        for _ in 0..count {
            out.push_str(host);
            out.push('\n');
        }
    }
    let path = root.join("var/hostsfile");
    fs::write(&path, out).map_err(|e| CoreError::fs(path, e))
}

/// Mount `proc` at `root/proc`, then bind-mount host `/sys`, `/dev`,
/// `/tmp` at the corresponding container paths.
pub fn mount_proc_and_bind_dev(config: &RuntimeConfig, mounts: &mut MountList, root: &Path) -> Result<()> {
    let proc_target = root.join("proc");
    nix::mount::mount(
        Some("proc"),
        &proc_target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        Option::<&str>::None,
    )
    .map_err(|e| CoreError::kernel(format!("mount proc at {}", proc_target.display()), e))?;
    mounts.insert(proc_target);

    for name in ["sys", "dev", "tmp"] {
        let spec = BindSpec::new(Path::new("/").join(name), root.join(name));
        bind_mount::bind_mount(config, mounts, &spec, false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S3: group file filter.
    #[test]
    fn scenario_s3_group_filter() {
        let text = "root:x:0:\nusers:x:100:alice,bob\ndocker:x:999:bob\nwheel:x:10:\n";
        let filtered = filter_group_file(text, "bob", 1);
        assert_eq!(
            filtered,
            "root:x:0:\nusers:x:100:bob\ndocker:x:999:\nwheel:x:10:\n"
        );
    }

    #[test]
    fn group_filter_respects_zero_limit() {
        let text = "users:x:100:bob\n";
        let filtered = filter_group_file(text, "bob", 0);
        assert_eq!(filtered, "users:x:100:\n");
    }

    #[test]
    fn skeleton_creates_expected_tree() {
        let dir = tempfile::tempdir().unwrap();
        create_skeleton(dir.path()).unwrap();
        for rel in SKELETON_DIRS {
            assert!(dir.path().join(rel).is_dir(), "{rel} missing");
        }
        let tmp_mode = fs::metadata(dir.path().join("tmp")).unwrap().permissions().mode() & 0o777;
        assert_eq!(tmp_mode, 0o777);
    }

    #[test]
    fn hostsfile_expands_node_spec() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("var")).unwrap();
        write_hostsfile(dir.path(), "nid001/2 nid002/1").unwrap();
        let text = fs::read_to_string(dir.path().join("var/hostsfile")).unwrap();
        assert_eq!(text, "nid001\nnid001\nnid002\n");
    }

    #[test]
    fn dynamic_etc_population_writes_three_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        populate_etc_dynamic(dir.path(), "alice", 1000, 1000, false).unwrap();
        assert!(dir.path().join("etc/passwd").exists());
        assert!(dir.path().join("etc/group").exists());
        assert!(dir.path().join("etc/nsswitch.conf").exists());
        let passwd = fs::read_to_string(dir.path().join("etc/passwd")).unwrap();
        assert!(passwd.starts_with("alice:x:1000:1000"));
    }
}
