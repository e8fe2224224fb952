//! Parser and canonical representation for user/site volume-mount
//! specifications (`source:target[:flag[:flag...]]`, `;`-separated).

use crate::error::{CoreError, Result};
use crate::input_filter::filter_input;

/// One of the closed set of recognized mount flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeFlag {
    /// `ro` — mount read-only.
    ReadOnly,
    /// `rec` — recursive bind mount.
    Recursive,
    /// `perNodeCache=...` — per-node scratch backed by a loop device.
    PerNodeCache(PerNodeCacheConfig),
    /// `slave` propagation.
    Slave,
    /// `private` propagation.
    Private,
}

impl VolumeFlag {
    /// Stable ordinal used to sort flags for canonicalization. Matches the
    /// order flags are introduced in the grammar: ro, rec, perNodeCache,
    /// slave, private.
    pub(crate) fn type_id(&self) -> u8 {
        match self {
            VolumeFlag::ReadOnly => 0,
            VolumeFlag::Recursive => 1,
            VolumeFlag::PerNodeCache(_) => 2,
            VolumeFlag::Slave => 3,
            VolumeFlag::Private => 4,
        }
    }

    fn canonical_token(&self) -> String {
        match self {
            VolumeFlag::ReadOnly => "ro".to_string(),
            VolumeFlag::Recursive => "rec".to_string(),
            VolumeFlag::Slave => "slave".to_string(),
            VolumeFlag::Private => "private".to_string(),
            VolumeFlag::PerNodeCache(cfg) => cfg.canonical_token(),
        }
    }
}

/// Per-node cache backing-store description (`perNodeCache=...` flag
/// payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerNodeCacheConfig {
    /// Cache size in bytes; must be > 0.
    pub cache_size: u64,
    /// Block size in bytes; must be > 0.
    pub block_size: u64,
    /// Filesystem type; closed set, currently only `xfs`.
    pub fstype: String,
    /// Creation method; closed set, currently only `loop`.
    pub method: String,
}

impl Default for PerNodeCacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 0,
            block_size: 1024 * 1024,
            fstype: "xfs".to_string(),
            method: "loop".to_string(),
        }
    }
}

impl PerNodeCacheConfig {
    fn canonical_token(&self) -> String {
        format!(
            "perNodeCache=size={},bs={},method={},fstype={}",
            self.cache_size, self.block_size, self.method, self.fstype
        )
    }
}

/// Parse a byte-count literal with an optional trailing 1024-ary multiplier
/// suffix in `{b,k,m,g,t,p,e}` (case-insensitive).
pub fn parse_byte_count(raw: &str) -> Result<u64> {
    if raw.is_empty() {
        return Err(CoreError::Argument("empty byte count".to_string()));
    }
    let lower = raw.to_ascii_lowercase();
    let (digits, mult): (&str, u64) = match lower.chars().last().unwrap() {
        'b' => (&lower[..lower.len() - 1], 1),
        'k' => (&lower[..lower.len() - 1], 1024),
        'm' => (&lower[..lower.len() - 1], 1024 * 1024),
        'g' => (&lower[..lower.len() - 1], 1024 * 1024 * 1024),
        't' => (&lower[..lower.len() - 1], 1024u64.pow(4)),
        'p' => (&lower[..lower.len() - 1], 1024u64.pow(5)),
        'e' => (&lower[..lower.len() - 1], 1024u64.pow(6)),
        _ => (lower.as_str(), 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| CoreError::Argument(format!("invalid byte count: {raw}")))?;
    n.checked_mul(mult)
        .ok_or_else(|| CoreError::Argument(format!("byte count overflow: {raw}")))
}

/// One parsed `(source, target, flags)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMapEntry {
    /// Filtered source path.
    pub source: String,
    /// Filtered target path.
    pub target: String,
    /// Flags, kept sorted by [`VolumeFlag::type_id`] for signature
    /// stability.
    pub flags: Vec<VolumeFlag>,
}

impl VolumeMapEntry {
    fn new(source: String, target: String, mut flags: Vec<VolumeFlag>) -> Result<Self> {
        flags.sort_by_key(VolumeFlag::type_id);
        let mut seen = [false; 5];
        for f in &flags {
            let idx = f.type_id() as usize;
            if seen[idx] {
                return Err(CoreError::Argument(format!(
                    "duplicate flag kind in volume entry {source}:{target}"
                )));
            }
            seen[idx] = true;
        }
        if seen[VolumeFlag::Slave.type_id() as usize] && seen[VolumeFlag::Private.type_id() as usize]
        {
            return Err(CoreError::Argument(
                "slave and private are mutually exclusive".to_string(),
            ));
        }
        Ok(Self {
            source,
            target,
            flags,
        })
    }

    /// Whether `kind` is present (compared by variant, ignoring payload).
    pub fn has_flag(&self, kind: &VolumeFlag) -> bool {
        self.flags.iter().any(|f| f.type_id() == kind.type_id())
    }

    /// The per-node cache config, if the `PERNODECACHE` flag is present.
    pub fn per_node_cache(&self) -> Option<&PerNodeCacheConfig> {
        self.flags.iter().find_map(|f| match f {
            VolumeFlag::PerNodeCache(cfg) => Some(cfg),
            _ => None,
        })
    }

    /// The canonical raw string for this entry: filtered source/target plus
    /// sorted flag tokens, colon-joined.
    pub fn canonical_raw(&self) -> String {
        let mut parts = vec![self.source.clone(), self.target.clone()];
        parts.extend(self.flags.iter().map(VolumeFlag::canonical_token));
        parts.join(":")
    }
}

/// A parsed sequence of volume map entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeMap {
    entries: Vec<VolumeMapEntry>,
}

/// Split `s` on `delim`, treating `"`-quoted spans as atomic (no split
/// inside quotes); strips one layer of enclosing quotes from each token.
fn split_respecting_quotes(s: &str, delim: char) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == delim && !in_quotes => {
                tokens.push(std::mem::take(&mut cur));
            }
            c => cur.push(c),
        }
    }
    tokens.push(cur);
    tokens
}

fn parse_per_node_cache(payload: &str) -> Result<PerNodeCacheConfig> {
    let mut cfg = PerNodeCacheConfig::default();
    let mut size_seen = false;
    for kv in payload.split(',') {
        let kv = kv.trim();
        if kv.is_empty() {
            continue;
        }
        let (k, v) = kv
            .split_once('=')
            .ok_or_else(|| CoreError::Argument(format!("malformed perNodeCache field: {kv}")))?;
        match k.to_ascii_lowercase().as_str() {
            "size" => {
                cfg.cache_size = parse_byte_count(v)?;
                size_seen = true;
            }
            "bs" => cfg.block_size = parse_byte_count(v)?,
            "fs" => {
                if v != "xfs" {
                    return Err(CoreError::Argument(format!("unsupported perNodeCache fstype: {v}")));
                }
                cfg.fstype = v.to_string();
            }
            "method" => {
                if v != "loop" {
                    return Err(CoreError::Argument(format!("unsupported perNodeCache method: {v}")));
                }
                cfg.method = v.to_string();
            }
            other => {
                return Err(CoreError::Argument(format!(
                    "unrecognized perNodeCache field: {other}"
                )))
            }
        }
    }
    if !size_seen || cfg.cache_size == 0 {
        return Err(CoreError::Argument(
            "perNodeCache requires a positive size".to_string(),
        ));
    }
    if cfg.block_size == 0 {
        return Err(CoreError::Argument(
            "perNodeCache block size must be positive".to_string(),
        ));
    }
    Ok(cfg)
}

fn parse_flag(token: &str) -> Result<VolumeFlag> {
    let (name, payload) = token.split_once('=').unwrap_or((token, ""));
    match name.to_ascii_lowercase().as_str() {
        "ro" => Ok(VolumeFlag::ReadOnly),
        "rec" => Ok(VolumeFlag::Recursive),
        "slave" => Ok(VolumeFlag::Slave),
        "private" => Ok(VolumeFlag::Private),
        "pernodecache" => Ok(VolumeFlag::PerNodeCache(parse_per_node_cache(payload)?)),
        other => Err(CoreError::Argument(format!("unrecognized flag: {other}"))),
    }
}

impl VolumeMap {
    /// Parse a `;`-separated list of `source:target[:flag...]` entries.
    /// `site_mode` fills `target = source` when an entry supplies only a
    /// source (site-only shorthand).
    pub fn parse(raw: &str, site_mode: bool) -> Result<Self> {
        let mut entries = Vec::new();
        for raw_entry in split_respecting_quotes(raw, ';') {
            let raw_entry = raw_entry.trim();
            if raw_entry.is_empty() {
                continue;
            }
            let tokens = split_respecting_quotes(raw_entry, ':');
            if tokens.is_empty() {
                continue;
            }
            let source = filter_input(&tokens[0], true);
            let (target, flag_tokens): (String, &[String]) = if tokens.len() == 1 {
                if !site_mode {
                    return Err(CoreError::Argument(format!(
                        "volume entry missing target: {raw_entry}"
                    )));
                }
                (source.clone(), &[])
            } else {
                (filter_input(&tokens[1], true), &tokens[2..])
            };
            let flags = flag_tokens
                .iter()
                .map(|t| parse_flag(t))
                .collect::<Result<Vec<_>>>()?;
            entries.push(VolumeMapEntry::new(source, target, flags)?);
        }
        Ok(Self { entries })
    }

    /// The parsed entries.
    pub fn entries(&self) -> &[VolumeMapEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The canonical, sorted, `;`-joined signature used for config
    /// equality (spec §4.10 `compareShifterConfig`).
    pub fn signature(&self) -> String {
        let mut raws: Vec<String> = self.entries.iter().map(VolumeMapEntry::canonical_raw).collect();
        raws.sort();
        raws.join(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S1: VolumeMap parse with three entries, including a per-node cache.
    #[test]
    fn scenario_s1_parse_and_signature() {
        let vm = VolumeMap::parse(
            "/a:/b;/c:/d:ro;/e:/f:ro:rec:perNodeCache=size=100M,bs=1M",
            false,
        )
        .unwrap();
        assert_eq!(vm.len(), 3);
        assert_eq!(vm.entries()[1].flags, vec![VolumeFlag::ReadOnly]);
        let e3 = &vm.entries()[2];
        assert_eq!(
            e3.flags,
            vec![
                VolumeFlag::ReadOnly,
                VolumeFlag::Recursive,
                VolumeFlag::PerNodeCache(PerNodeCacheConfig {
                    cache_size: 104_857_600,
                    block_size: 1_048_576,
                    fstype: "xfs".to_string(),
                    method: "loop".to_string(),
                }),
            ]
        );
        assert_eq!(
            e3.canonical_raw(),
            "/e:/f:ro:rec:perNodeCache=size=104857600,bs=1048576,method=loop,fstype=xfs"
        );
    }

    #[test]
    fn rejects_duplicate_flag_kind() {
        let err = VolumeMap::parse("/a:/b:ro:ro", false).unwrap_err();
        assert!(matches!(err, CoreError::Argument(_)));
    }

    #[test]
    fn rejects_slave_and_private_together() {
        let err = VolumeMap::parse("/a:/b:slave:private", false).unwrap_err();
        assert!(matches!(err, CoreError::Argument(_)));
    }

    #[test]
    fn per_node_cache_rejects_zero_size() {
        let err = VolumeMap::parse("/a:/b:perNodeCache=size=0", false).unwrap_err();
        assert!(matches!(err, CoreError::Argument(_)));
    }

    #[test]
    fn per_node_cache_allows_ssize_max_at_parse_time() {
        let vm = VolumeMap::parse(
            &format!("/a:/b:perNodeCache=size={}", i64::MAX),
            false,
        )
        .unwrap();
        assert_eq!(vm.entries()[0].per_node_cache().unwrap().cache_size as i64, i64::MAX);
    }

    #[test]
    fn site_only_source_fills_target() {
        let vm = VolumeMap::parse("/opt/extra", true).unwrap();
        assert_eq!(vm.entries()[0].source, "/opt/extra");
        assert_eq!(vm.entries()[0].target, "/opt/extra");
    }

    /// S4: signature is stable under reordering of entries.
    #[test]
    fn scenario_s4_signature_order_independent() {
        let a = VolumeMap::parse("/a:/b;/c:/d", false).unwrap();
        let b = VolumeMap::parse("/c:/d;/a:/b", false).unwrap();
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn round_trip_preserves_flag_order() {
        let raw = "/e:/f:ro:rec:perNodeCache=size=104857600,bs=1048576,method=loop,fstype=xfs";
        let vm1 = VolumeMap::parse(raw, false).unwrap();
        let reparsed = VolumeMap::parse(&vm1.entries()[0].canonical_raw(), false).unwrap();
        assert_eq!(vm1, reparsed);
    }
}
