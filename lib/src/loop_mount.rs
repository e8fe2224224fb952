//! Mounts an image file through a loop device onto the configured loop
//! mount point, dispatching on [`ImageFormat`].
//!
//! The loop attach itself requires privileges this process has already
//! dropped below by the time user volumes are processed, so it always goes
//! through the setuid-safe `mount` helper (spec §4.6) rather than a direct
//! `mount(2)` call.

use crate::config::RuntimeConfig;
use crate::error::{CoreError, Result};
use crate::image_metadata::{ImageFormat, ImageMetadata};
use crate::task::Task;

fn fstype_for(format: ImageFormat) -> Result<&'static str> {
    match format {
        ImageFormat::Ext4 => Ok("ext4"),
        ImageFormat::Squashfs => Ok("squashfs"),
        ImageFormat::Cramfs => Ok("cramfs"),
        ImageFormat::Xfs => Ok("xfs"),
        ImageFormat::Vfs | ImageFormat::Invalid => {
            Err(CoreError::Argument("format does not use loop mount".to_string()))
        }
    }
}

/// Whether this format is only ever mounted read-only (squashfs and cramfs
/// have no writable path at all).
fn force_read_only(format: ImageFormat) -> bool {
    matches!(format, ImageFormat::Squashfs | ImageFormat::Cramfs)
}

fn loop_options(format: ImageFormat, read_only: bool) -> String {
    let ro = read_only || force_read_only(format);
    let mut opts = if ro {
        "loop,ro,nosuid,nodev".to_string()
    } else {
        "loop,nosuid,nodev".to_string()
    };
    if format != ImageFormat::Xfs {
        opts.push_str(",autoclear");
    }
    opts
}

/// Loop-mount `meta`'s image file onto `config.loop_mount_point` via the
/// setuid-safe mount helper. `read_only` is advisory for formats that
/// support a writable loop mount; ignored where the format forbids it.
pub fn loop_mount(config: &RuntimeConfig, meta: &ImageMetadata, read_only: bool) -> Result<()> {
    if !meta.use_loop_mount() {
        return Err(CoreError::Argument(format!(
            "image {} does not require a loop mount",
            meta.identifier
        )));
    }
    let fstype = fstype_for(meta.format)?;
    let options = loop_options(meta.format, read_only);
    let target = config.loop_mount_point.to_string_lossy().into_owned();
    let source = meta.filename.to_string_lossy().into_owned();

    Task::new_and_run(
        format!("loop-mounting {source} ({fstype}) onto {target}"),
        config.mount_path.to_string_lossy().as_ref(),
        ["-o", options.as_str(), "-t", fstype, source.as_str(), target.as_str()],
    )
}

/// Detach the loop mount at `config.loop_mount_point`.
pub fn loop_unmount(config: &RuntimeConfig) -> Result<()> {
    let target = config.loop_mount_point.to_string_lossy().into_owned();
    Task::new_and_run(
        format!("unmounting loop mount at {target}"),
        "/bin/umount",
        [target.as_str()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squashfs_is_always_read_only() {
        assert_eq!(loop_options(ImageFormat::Squashfs, false), "loop,ro,nosuid,nodev,autoclear");
    }

    #[test]
    fn ext4_defaults_to_read_write() {
        assert_eq!(loop_options(ImageFormat::Ext4, false), "loop,nosuid,nodev,autoclear");
        assert_eq!(loop_options(ImageFormat::Ext4, true), "loop,ro,nosuid,nodev,autoclear");
    }

    #[test]
    fn xfs_never_gets_autoclear() {
        assert_eq!(loop_options(ImageFormat::Xfs, false), "loop,nosuid,nodev");
    }

    #[test]
    fn vfs_has_no_fstype() {
        assert!(fstype_for(ImageFormat::Vfs).is_err());
        assert!(fstype_for(ImageFormat::Invalid).is_err());
    }

    #[test]
    fn xfs_and_cramfs_fstypes() {
        assert_eq!(fstype_for(ImageFormat::Xfs).unwrap(), "xfs");
        assert_eq!(fstype_for(ImageFormat::Cramfs).unwrap(), "cramfs");
        assert!(force_read_only(ImageFormat::Cramfs));
        assert!(!force_read_only(ImageFormat::Xfs));
    }
}
