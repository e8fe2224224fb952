//! Final, irreversible privilege descent: clear the capability bounding
//! set, drop to the target identity, set `no_new_privs`. Nothing past this
//! module runs with the invoking privilege.

use caps::{CapSet, CapsHashSet};
use nix::unistd::{setgroups, setresgid, setresuid, Gid, Uid};

use crate::error::{CoreError, Result};

fn kernel_err(op: &str, e: nix::Error) -> CoreError {
    CoreError::kernel(op.to_string(), e)
}

/// Drop every capability from the bounding set: read the current set and
/// drop everything (the empty target set has nothing to keep).
fn clear_bounding_set() -> Result<()> {
    let held = caps::read(None, CapSet::Bounding)
        .map_err(|e| CoreError::Permission(format!("reading capability bounding set: {e}")))?;
    let empty = CapsHashSet::new();
    for cap in held.difference(&empty) {
        caps::drop(None, CapSet::Bounding, *cap)
            .map_err(|e| CoreError::Permission(format!("dropping capability {cap}: {e}")))?;
    }
    Ok(())
}

fn set_no_new_privs() -> Result<()> {
    // SAFETY: prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) has no preconditions
    // beyond the call itself; a nonzero return is reported via errno.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(CoreError::Permission(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Drop privilege to `target_uid`/`target_gid`, with `aux_gids` as the
/// complete supplementary group list. Sequenced exactly per the ordering
/// the design mandates: capabilities, then groups, then gid, then uid, then
/// `no_new_privs`. Any failure is fatal; the caller must abort rather than
/// let any subsequent code run with partially-dropped privilege.
pub fn drop_privileges(target_uid: u32, target_gid: u32, aux_gids: &[u32]) -> Result<()> {
    clear_bounding_set()?;

    let gids: Vec<Gid> = aux_gids.iter().map(|g| Gid::from_raw(*g)).collect();
    setgroups(&gids).map_err(|e| kernel_err("setgroups", e))?;

    let gid = Gid::from_raw(target_gid);
    setresgid(gid, gid, gid).map_err(|e| kernel_err("setresgid", e))?;

    let uid = Uid::from_raw(target_uid);
    setresuid(uid, uid, uid).map_err(|e| kernel_err("setresuid", e))?;

    set_no_new_privs()?;

    Ok(())
}

/// Best-effort verification that the descent landed where intended (spec
/// invariant 7). Not part of the mandatory sequence; callers may use this
/// in tests or defensive assertions after [`drop_privileges`].
pub fn verify_identity(target_uid: u32, target_gid: u32) -> bool {
    nix::unistd::geteuid().as_raw() == target_uid && nix::unistd::getegid().as_raw() == target_gid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_identity_checks_effective_ids() {
        let euid = nix::unistd::geteuid().as_raw();
        let egid = nix::unistd::getegid().as_raw();
        assert!(verify_identity(euid, egid));
        assert!(!verify_identity(euid.wrapping_add(1), egid));
    }
}
