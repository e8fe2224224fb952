//! The populated configuration record the core consumes. Parsing the
//! on-disk configuration file's text grammar is out of scope (spec §1); a
//! `RuntimeConfig` is assumed to already be populated by that external
//! parser. [`RuntimeConfig::from_map`] is provided so the record is
//! exercisable from tests without a real config-file parser.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use crate::volume_map::VolumeMap;

/// Mount propagation style applied to the container root and, by default,
/// to bind mounts that don't specify their own propagation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationStyle {
    /// `MS_SLAVE`.
    Slave,
    /// `MS_PRIVATE`.
    Private,
}

/// Site-controlled environment layering, applied in order on top of the
/// image's own environment (spec §4.12).
#[derive(Debug, Clone, Default)]
pub struct SiteEnvLayers {
    /// Replace-or-insert entries (`NAME=VALUE`).
    pub set: Vec<String>,
    /// Append `:VALUE` to the existing value, or insert.
    pub append: Vec<String>,
    /// Prepend `VALUE:` to the existing value, or insert.
    pub prepend: Vec<String>,
    /// Remove these names if present.
    pub unset: Vec<String>,
}

/// Long-lived configuration, populated once from the (out-of-scope)
/// configuration file, plus the runtime-only attributes filled in as the
/// orchestrator progresses.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Where the container root is mounted.
    pub udi_mount_point: PathBuf,
    /// Where a loop-mounted image is first mounted before being bind-
    /// composed into the container root.
    pub loop_mount_point: PathBuf,
    /// Base directory under which `<identifier>.meta` and image files live.
    pub image_base_path: PathBuf,
    /// Filesystem type used for the container's tmpfs-like root.
    pub rootfs_type: String,
    /// Path to the `cp` helper.
    pub cp_path: PathBuf,
    /// Path to the `mv` helper.
    pub mv_path: PathBuf,
    /// Path to the `chmod` helper.
    pub chmod_path: PathBuf,
    /// Path to the `dd` helper.
    pub dd_path: PathBuf,
    /// Path to the `mkfs.xfs` helper.
    pub mkfs_xfs_path: PathBuf,
    /// Path to the setuid-safe `mount` helper.
    pub mount_path: PathBuf,
    /// Directory of files to copy verbatim into the container's `/etc`
    /// (static etc-population branch).
    pub site_etc_dir: Option<PathBuf>,
    /// Directory copied recursively into the container's `/opt/udiImage`.
    pub site_udiimage_overlay: Option<PathBuf>,
    /// Site-mandated volume mounts, applied before user mounts.
    pub site_volume_map: VolumeMap,
    /// Site environment layering.
    pub site_env: SiteEnvLayers,
    /// Maximum number of group-membership entries retained for the target
    /// user in the filtered `/etc/group` (spec §4.7 step 9).
    pub max_group_count: usize,
    /// Default mount propagation style.
    pub mount_propagation_style: PropagationStyle,
    /// Directory under which per-node cache backing files are created.
    pub per_node_cache_path: PathBuf,
    /// Upper bound on a single per-node cache's size, in bytes.
    pub per_node_cache_size_limit: u64,
    /// Whether a local (non-privileged) chroot reuse is permitted.
    pub allow_local_chroot: bool,
    /// Whether libc passwd/group calls may be used to populate `/etc`
    /// dynamically (as opposed to a shifter-specific passwd file).
    pub allow_libc_pwd_calls: bool,
    /// Whether `/etc` is populated dynamically (synthesized) rather than
    /// by copying a static overlay directory.
    pub populate_etc_dynamically: bool,
    /// Timeout for the out-of-scope image-gateway client, carried through
    /// only because it is part of the populated record.
    pub gateway_timeout_secs: u64,
    /// Site pre-mount hook script path, run as `/bin/sh <hookpath>`.
    pub site_pre_mount_hook: Option<PathBuf>,
    /// Site post-mount hook script path.
    pub site_post_mount_hook: Option<PathBuf>,
    /// Whether the container root is left writable after setup (skips the
    /// final remount-read-only step).
    pub mount_udi_root_writable: bool,

    // Runtime-only attributes, populated during orchestration.
    /// Target uid to drop privilege to.
    pub target_uid: u32,
    /// Target gid to drop privilege to.
    pub target_gid: u32,
    /// Supplementary gids for the target user.
    pub aux_gids: Vec<u32>,
    /// Target username.
    pub username: String,
    /// Batch job identifier.
    pub job_identifier: Option<String>,
    /// Compute node identifier.
    pub node_identifier: Option<String>,
    /// SSH public key text, if supplied (SSH launch itself is out of
    /// scope; the core only threads the value through).
    pub ssh_pubkey: Option<String>,
    /// Device-ids authorized to accept bind-mount targets. Populated
    /// exactly once, immediately after the container root is mounted, and
    /// read-only thereafter.
    pub bind_mount_allowed_devices: HashSet<u64>,
}

impl RuntimeConfig {
    /// Build a `RuntimeConfig` from an in-memory key/value map, standing in
    /// for the out-of-scope configuration-file text parser. Unrecognized
    /// keys are ignored; missing keys fall back to the documented
    /// defaults.
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let get = |k: &str| map.get(k).cloned();
        let get_path = |k: &str, default: &str| PathBuf::from(get(k).unwrap_or_else(|| default.to_string()));
        let get_bool = |k: &str, default: bool| {
            get(k)
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(default)
        };
        let get_usize = |k: &str, default: usize| {
            get(k).and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let get_u64 = |k: &str, default: u64| get(k).and_then(|v| v.parse().ok()).unwrap_or(default);

        Self {
            udi_mount_point: get_path("udiMountPoint", "/var/udiMount"),
            loop_mount_point: get_path("loopMountPoint", "/var/udiMount/.loop"),
            image_base_path: get_path("imageBasePath", "/var/udi/images"),
            rootfs_type: get("rootfsType").unwrap_or_else(|| "tmpfs".to_string()),
            cp_path: get_path("cpPath", "/bin/cp"),
            mv_path: get_path("mvPath", "/bin/mv"),
            chmod_path: get_path("chmodPath", "/bin/chmod"),
            dd_path: get_path("ddPath", "/bin/dd"),
            mkfs_xfs_path: get_path("mkfsXfsPath", "/sbin/mkfs.xfs"),
            mount_path: get_path("mountPath", "/bin/mount"),
            site_etc_dir: get("siteEtcDir").map(PathBuf::from),
            site_udiimage_overlay: get("siteUdiImageOverlay").map(PathBuf::from),
            site_volume_map: VolumeMap::default(),
            site_env: SiteEnvLayers::default(),
            max_group_count: get_usize("maxGroupCount", 32),
            mount_propagation_style: if get("mountPropagationStyle").as_deref() == Some("private") {
                PropagationStyle::Private
            } else {
                PropagationStyle::Slave
            },
            per_node_cache_path: get_path("perNodeCachePath", "/var/udiPnc"),
            per_node_cache_size_limit: get_u64("perNodeCacheSizeLimit", 1024 * 1024 * 1024 * 64),
            allow_local_chroot: get_bool("allowLocalChroot", false),
            allow_libc_pwd_calls: get_bool("allowLibcPwdCalls", true),
            populate_etc_dynamically: get_bool("populateEtcDynamically", true),
            gateway_timeout_secs: get_u64("gatewayTimeout", 30),
            site_pre_mount_hook: get("sitePreMountHook").map(PathBuf::from),
            site_post_mount_hook: get("sitePostMountHook").map(PathBuf::from),
            mount_udi_root_writable: get_bool("mountUdiRootWritable", false),
            target_uid: 0,
            target_gid: 0,
            aux_gids: Vec::new(),
            username: String::new(),
            job_identifier: None,
            node_identifier: None,
            ssh_pubkey: None,
            bind_mount_allowed_devices: HashSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::from_map(&BTreeMap::new());
        assert_eq!(cfg.udi_mount_point, PathBuf::from("/var/udiMount"));
        assert_eq!(cfg.mount_propagation_style, PropagationStyle::Slave);
        assert!(cfg.bind_mount_allowed_devices.is_empty());
        assert!(!cfg.mount_udi_root_writable);
    }

    #[test]
    fn map_overrides_defaults() {
        let mut map = BTreeMap::new();
        map.insert("udiMountPoint".to_string(), "/custom/root".to_string());
        map.insert("maxGroupCount".to_string(), "8".to_string());
        map.insert("mountPropagationStyle".to_string(), "private".to_string());
        let cfg = RuntimeConfig::from_map(&map);
        assert_eq!(cfg.udi_mount_point, PathBuf::from("/custom/root"));
        assert_eq!(cfg.max_group_count, 8);
        assert_eq!(cfg.mount_propagation_style, PropagationStyle::Private);
    }
}
