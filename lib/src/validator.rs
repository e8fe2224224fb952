//! Policy engine that accepts/rejects a `(source, target, flags)` triple
//! against one of two disjoint rule sets.

use crate::error::{CoreError, Result};
use crate::volume_map::{VolumeFlag, VolumeMapEntry};

/// Which rule set to validate a volume map entry against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// The strict rule set applied to job-requested mounts.
    User,
    /// The more permissive rule set applied to operator-mandated mounts.
    Site,
}

struct RuleSet {
    target_starts_with: &'static [&'static str],
    target_exact: &'static [&'static str],
    source_starts_with: &'static [&'static str],
    source_exact: &'static [&'static str],
    allowed_flags: &'static [u8],
}

const USER_RULES: RuleSet = RuleSet {
    target_starts_with: &["/etc", "/var", "/opt/udiImage"],
    target_exact: &["/opt"],
    source_starts_with: &[],
    source_exact: &[],
    allowed_flags: &[0, 2], // READONLY, PERNODECACHE
};

const SITE_RULES: RuleSet = RuleSet {
    target_starts_with: &[],
    target_exact: &["/opt", "/etc", "/var", "/etc/passwd", "/etc/group", "/etc/nsswitch.conf"],
    source_starts_with: &[],
    source_exact: &[],
    allowed_flags: &[0, 1, 2, 3, 4], // all flags
};

fn rules_for(kind: RequestKind) -> &'static RuleSet {
    match kind {
        RequestKind::User => &USER_RULES,
        RequestKind::Site => &SITE_RULES,
    }
}

fn normalize(p: &str) -> String {
    if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{p}")
    }
}

/// Validate `entry` against the rule set selected by `kind`.
pub fn validate(entry: &VolumeMapEntry, kind: RequestKind) -> Result<()> {
    let rules = rules_for(kind);
    let target = normalize(&entry.target);
    let source = normalize(&entry.source);

    if rules.target_exact.iter().any(|t| *t == target) {
        return Err(CoreError::Argument(format!(
            "target {target} is not allowed for this request"
        )));
    }
    if rules
        .target_starts_with
        .iter()
        .any(|t| target == *t || target.starts_with(&format!("{t}/")))
    {
        return Err(CoreError::Argument(format!(
            "target {target} is under a forbidden prefix"
        )));
    }
    if rules.source_exact.iter().any(|s| *s == source) {
        return Err(CoreError::Argument(format!(
            "source {source} is not allowed for this request"
        )));
    }
    if rules
        .source_starts_with
        .iter()
        .any(|s| source == *s || source.starts_with(&format!("{s}/")))
    {
        return Err(CoreError::Argument(format!(
            "source {source} is under a forbidden prefix"
        )));
    }

    for flag in &entry.flags {
        if !rules.allowed_flags.contains(&flag.type_id()) {
            return Err(CoreError::Argument(format!(
                "flag {:?} is not permitted for this request type",
                flag
            )));
        }
    }

    // Duplicate-flag-kind and SLAVE/PRIVATE-conflict checks already happen
    // at VolumeMapEntry construction time; re-check defensively here since
    // the invariant must hold for any entry reaching the validator.
    let mut seen = [false; 5];
    for f in &entry.flags {
        let idx = f.type_id() as usize;
        if seen[idx] {
            return Err(CoreError::Argument("duplicate flag kind".to_string()));
        }
        seen[idx] = true;
    }
    if seen[VolumeFlag::Slave.type_id() as usize]
        && seen[VolumeFlag::Private.type_id() as usize]
    {
        return Err(CoreError::Argument(
            "slave and private are mutually exclusive".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume_map::VolumeMap;

    fn first_entry(raw: &str) -> VolumeMapEntry {
        VolumeMap::parse(raw, false).unwrap().entries()[0].clone()
    }

    /// S6: validator rejects.
    #[test]
    fn scenario_s6_user_rejects_etc_passwd() {
        let e = first_entry("/host:/etc/passwd:ro");
        assert!(validate(&e, RequestKind::User).is_err());
    }

    #[test]
    fn scenario_s6_user_rejects_opt() {
        let e = first_entry("/host:/opt:ro");
        assert!(validate(&e, RequestKind::User).is_err());
    }

    #[test]
    fn scenario_s6_user_rejects_recursive() {
        let e = first_entry("/host:/data:ro:rec");
        assert!(validate(&e, RequestKind::User).is_err());
    }

    #[test]
    fn scenario_s6_user_accepts_plain_ro() {
        let e = first_entry("/host:/data:ro");
        assert!(validate(&e, RequestKind::User).is_ok());
    }

    #[test]
    fn target_etc_foo_rejected_for_user_accepted_for_site() {
        let e = first_entry("/host:/etc/foo");
        assert!(validate(&e, RequestKind::User).is_err());
        assert!(validate(&e, RequestKind::Site).is_ok());
    }

    #[test]
    fn target_etc_passwd_rejected_for_site() {
        let e = first_entry("/host:/etc/passwd");
        assert!(validate(&e, RequestKind::Site).is_err());
    }

    #[test]
    fn site_allows_recursive_and_propagation_flags() {
        let e = first_entry("/host:/data:rec:slave");
        assert!(validate(&e, RequestKind::Site).is_ok());
    }
}
