//! Canonical identity signature for the fast reuse path: if a live
//! container already matches (image, user, volume-map), setup can skip
//! straight to chroot.

use std::path::Path;

use crate::error::{CoreError, Result};
use crate::volume_map::VolumeMap;

/// Build the canonical `{"identifier":...,"user":...,"volMap":...}` string.
/// Field order and escaping are fixed so two invocations with the same
/// inputs always produce byte-identical output (spec invariant 6).
pub fn generate_config_string(identifier: &str, username: &str, volume_map: &VolumeMap) -> String {
    format!(
        "{{\"identifier\":\"{}\",\"user\":\"{}\",\"volMap\":\"{}\"}}",
        escape(identifier),
        escape(username),
        escape(&volume_map.signature()),
    )
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Read `containerRoot/var/shifterConfig.json` and byte-compare it against
/// the signature for the requested (identifier, user, volume-map). A
/// missing file is treated as "no match" rather than an error: the
/// reuse path simply falls through to a full setup.
pub fn matches_existing(
    container_root: &Path,
    identifier: &str,
    username: &str,
    volume_map: &VolumeMap,
) -> Result<bool> {
    let path = container_root.join("var/shifterConfig.json");
    let existing = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CoreError::fs(path, e)),
    };
    Ok(existing == generate_config_string(identifier, username, volume_map))
}

/// Write the signature to `containerRoot/var/shifterConfig.json`, the last
/// step before the container becomes eligible for reuse by a later
/// invocation.
pub fn save_config(container_root: &Path, identifier: &str, username: &str, volume_map: &VolumeMap) -> Result<()> {
    let path = container_root.join("var/shifterConfig.json");
    std::fs::write(&path, generate_config_string(identifier, username, volume_map))
        .map_err(|e| CoreError::fs(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S4: order-independent volume maps yield the same signature string.
    #[test]
    fn scenario_s4_identical_signature_regardless_of_input_order() {
        let vm1 = VolumeMap::parse("/a:/b;/c:/d", false).unwrap();
        let vm2 = VolumeMap::parse("/c:/d;/a:/b", false).unwrap();
        let s1 = generate_config_string("abc", "alice", &vm1);
        let s2 = generate_config_string("abc", "alice", &vm2);
        assert_eq!(s1, s2);
    }

    #[test]
    fn missing_file_is_not_a_match() {
        let dir = tempfile::tempdir().unwrap();
        let vm = VolumeMap::default();
        assert!(!matches_existing(dir.path(), "abc", "alice", &vm).unwrap());
    }

    #[test]
    fn save_then_match_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("var")).unwrap();
        let vm = VolumeMap::parse("/a:/b", false).unwrap();
        save_config(dir.path(), "abc", "alice", &vm).unwrap();
        assert!(matches_existing(dir.path(), "abc", "alice", &vm).unwrap());
        let other = VolumeMap::parse("/a:/c", false).unwrap();
        assert!(!matches_existing(dir.path(), "abc", "alice", &other).unwrap());
    }
}
