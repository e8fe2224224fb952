//! The bind-or-copy traversal that composes an image's read-mostly tree
//! into the container root, skipping anything the site stager already put
//! there.

use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;

use crate::bind_mount::{self, BindSpec};
use crate::config::RuntimeConfig;
use crate::error::{CoreError, Result};
use crate::input_filter::filter_input;
use crate::mount_list::MountList;

/// Regular files at or above this size are bind-mounted rather than
/// copied.
pub const FILE_SIZE_LIMIT: u64 = 5 * 1024 * 1024;

/// Bind (or, if `copy_mode`, recursively copy) the image subtree at
/// `relative` into the container root.
pub fn bind_image_into_udi(
    config: &RuntimeConfig,
    mounts: &mut MountList,
    image_root: &Path,
    container_root: &Path,
    relative: &Path,
    copy_mode: bool,
) -> Result<()> {
    let image_dir = image_root.join(relative);
    let container_dir = container_root.join(relative);

    let read_dir = match fs::read_dir(&image_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CoreError::fs(image_dir, e)),
    };

    for entry in read_dir {
        let entry = entry.map_err(|e| CoreError::fs(image_dir.clone(), e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "." || name == ".." {
            continue;
        }
        let filtered = filter_input(&name, false);
        if filtered.is_empty() {
            continue;
        }

        let container_path = container_dir.join(filtered.as_str());
        if container_path == *container_root {
            continue;
        }
        if container_path.symlink_metadata().is_ok() {
            continue;
        }

        let source_path = entry.path();
        let meta = match fs::symlink_metadata(&source_path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(CoreError::fs(source_path, e)),
        };
        let file_type = meta.file_type();

        if let Some(parent) = container_path.parent() {
            fs::create_dir_all(parent).map_err(|e| CoreError::fs(parent.to_path_buf(), e))?;
        }

        if file_type.is_symlink() {
            let link = fs::read_link(&source_path).map_err(|e| CoreError::fs(source_path.clone(), e))?;
            std::os::unix::fs::symlink(&link, &container_path).map_err(|e| CoreError::fs(container_path, e))?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&container_path).map_err(|e| CoreError::fs(container_path.clone(), e))?;
            if copy_mode {
                bind_image_into_udi(
                    config,
                    mounts,
                    image_root,
                    container_root,
                    &relative.join(filtered.as_str()),
                    true,
                )?;
            } else {
                let spec = BindSpec::new(source_path, container_path);
                bind_mount::bind_mount(config, mounts, &spec, false)?;
            }
        } else if file_type.is_file() {
            if copy_mode || meta.len() < FILE_SIZE_LIMIT {
                fs::copy(&source_path, &container_path).map_err(|e| CoreError::fs(container_path.clone(), e))?;
                fs::set_permissions(&container_path, fs::Permissions::from_mode(meta.mode()))
                    .map_err(|e| CoreError::fs(container_path, e))?;
            } else {
                fs::write(&container_path, []).map_err(|e| CoreError::fs(container_path.clone(), e))?;
                let spec = BindSpec::new(source_path, container_path);
                bind_mount::bind_mount(config, mounts, &spec, false)?;
            }
        } else if file_type.is_char_device() || file_type.is_block_device() || file_type.is_fifo() {
            continue;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::collections::BTreeMap;
    use std::io::Write;

    fn config() -> RuntimeConfig {
        RuntimeConfig::from_map(&BTreeMap::new())
    }

    #[test]
    fn copy_mode_copies_small_files_preserving_mode() {
        let image = tempfile::tempdir().unwrap();
        let container = tempfile::tempdir().unwrap();
        fs::create_dir_all(image.path().join("etc")).unwrap();
        let mut f = fs::File::create(image.path().join("etc/hostname")).unwrap();
        writeln!(f, "node01").unwrap();
        drop(f);
        fs::set_permissions(image.path().join("etc/hostname"), fs::Permissions::from_mode(0o640)).unwrap();

        let mut mounts = MountList::parse().unwrap_or_else(|_| {
            panic!("MountList::parse should succeed under /proc/self/mounts in test env")
        });
        let cfg = config();
        bind_image_into_udi(
            &cfg,
            &mut mounts,
            image.path(),
            container.path(),
            Path::new("etc"),
            true,
        )
        .unwrap();

        let copied = container.path().join("etc/hostname");
        assert!(copied.exists());
        assert_eq!(fs::read_to_string(copied).unwrap(), "node01\n");
    }

    #[test]
    fn skips_entries_already_present_in_container() {
        let image = tempfile::tempdir().unwrap();
        let container = tempfile::tempdir().unwrap();
        fs::create_dir_all(image.path().join("etc")).unwrap();
        fs::write(image.path().join("etc/passwd"), "image-version").unwrap();
        fs::create_dir_all(container.path().join("etc")).unwrap();
        fs::write(container.path().join("etc/passwd"), "site-version").unwrap();

        let mut mounts = MountList::parse().unwrap();
        let cfg = config();
        bind_image_into_udi(
            &cfg,
            &mut mounts,
            image.path(),
            container.path(),
            Path::new("etc"),
            true,
        )
        .unwrap();

        assert_eq!(
            fs::read_to_string(container.path().join("etc/passwd")).unwrap(),
            "site-version"
        );
    }

    #[test]
    fn missing_subtree_is_a_no_op() {
        let image = tempfile::tempdir().unwrap();
        let container = tempfile::tempdir().unwrap();
        let mut mounts = MountList::parse().unwrap();
        let cfg = config();
        bind_image_into_udi(
            &cfg,
            &mut mounts,
            image.path(),
            container.path(),
            Path::new("nonexistent"),
            true,
        )
        .unwrap();
    }
}
