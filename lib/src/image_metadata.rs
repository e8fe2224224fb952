//! Parsed image descriptor, read once from the `<identifier>.meta` sidecar
//! file at the image base path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

/// The on-disk format of an image, which determines whether it needs to be
/// loop-mounted before it can be bound into the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// A plain directory tree; no loop mount required.
    Vfs,
    /// ext4 filesystem image.
    Ext4,
    /// squashfs filesystem image.
    Squashfs,
    /// cramfs filesystem image.
    Cramfs,
    /// xfs filesystem image.
    Xfs,
    /// Unrecognized/unsupported format.
    Invalid,
}

impl ImageFormat {
    fn from_key(raw: &str) -> Self {
        match raw {
            "VFS" => ImageFormat::Vfs,
            "ext4" => ImageFormat::Ext4,
            "squashfs" => ImageFormat::Squashfs,
            "cramfs" => ImageFormat::Cramfs,
            "xfs" => ImageFormat::Xfs,
            _ => ImageFormat::Invalid,
        }
    }

    /// Whether this format requires mounting the image file through a loop
    /// device before it can be bind-composed into the container.
    pub fn use_loop_mount(&self) -> bool {
        !matches!(self, ImageFormat::Vfs | ImageFormat::Invalid)
    }
}

/// Parsed image descriptor. Populated once from the sidecar metadata file;
/// immutable thereafter.
#[derive(Debug, Clone)]
pub struct ImageMetadata {
    /// Opaque image identifier.
    pub identifier: String,
    /// Absolute on-disk filename (or directory, for VFS images).
    pub filename: PathBuf,
    /// On-disk format.
    pub format: ImageFormat,
    /// Environment entries, each `NAME=VALUE`, in file order.
    pub env: Vec<String>,
    /// Entrypoint string, if declared.
    pub entrypoint: Option<String>,
    /// Working directory, if declared.
    pub workdir: Option<String>,
    /// Declared volume mount-points, in file order.
    pub volume: Vec<String>,
}

impl ImageMetadata {
    /// Whether loop-mounting is required for this image.
    pub fn use_loop_mount(&self) -> bool {
        self.format.use_loop_mount()
    }

    /// Parse a `<identifier>.meta` sidecar file: one `KEY:VALUE` line per
    /// entry. `ENV` and `VOLUME` may repeat. Unknown keys are reported
    /// (caller may log) but are non-fatal.
    pub fn parse(identifier: &str, text: &str, filename: PathBuf) -> Result<(Self, Vec<String>)> {
        let mut format = ImageFormat::Vfs;
        let mut env = Vec::new();
        let mut entrypoint = None;
        let mut workdir = None;
        let mut volume = Vec::new();
        let mut unknown_keys = Vec::new();

        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                CoreError::Argument(format!("malformed image metadata line: {line}"))
            })?;
            match key {
                "FORMAT" => format = ImageFormat::from_key(value),
                "ENV" => env.push(value.to_string()),
                "ENTRY" => entrypoint = Some(value.to_string()),
                "WORKDIR" => workdir = Some(value.to_string()),
                "VOLUME" => volume.push(value.to_string()),
                other => unknown_keys.push(other.to_string()),
            }
        }

        Ok((
            Self {
                identifier: identifier.to_string(),
                filename,
                format,
                env,
                entrypoint,
                workdir,
                volume,
            },
            unknown_keys,
        ))
    }

    /// Read and parse `<base>/<identifier>.meta`.
    pub fn load(base: &Path, identifier: &str) -> Result<(Self, Vec<String>)> {
        let meta_path = base.join(format!("{identifier}.meta"));
        let text = std::fs::read_to_string(&meta_path).map_err(|e| CoreError::fs(meta_path, e))?;
        let filename = base.join(identifier);
        Self::parse(identifier, &text, filename)
    }

    /// The environment entries as a `NAME -> VALUE` map, last-one-wins.
    pub fn env_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for entry in &self.env {
            if let Some((name, value)) = entry.split_once('=') {
                map.insert(name.to_string(), value.to_string());
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys() {
        let text = "FORMAT:squashfs\nENV:FOO=bar\nENV:BAZ=qux\nENTRY:/bin/sh\nWORKDIR:/root\nVOLUME:/data\n";
        let (meta, unknown) =
            ImageMetadata::parse("img1", text, PathBuf::from("/images/img1")).unwrap();
        assert_eq!(meta.format, ImageFormat::Squashfs);
        assert!(meta.use_loop_mount());
        assert_eq!(meta.env, vec!["FOO=bar", "BAZ=qux"]);
        assert_eq!(meta.entrypoint.as_deref(), Some("/bin/sh"));
        assert_eq!(meta.workdir.as_deref(), Some("/root"));
        assert_eq!(meta.volume, vec!["/data"]);
        assert!(unknown.is_empty());
    }

    #[test]
    fn vfs_never_needs_loop_mount() {
        let (meta, _) = ImageMetadata::parse("img1", "FORMAT:VFS\n", PathBuf::from("/x")).unwrap();
        assert!(!meta.use_loop_mount());
    }

    #[test]
    fn unknown_keys_reported_not_fatal() {
        let (_meta, unknown) =
            ImageMetadata::parse("img1", "FORMAT:VFS\nWEIRD:1\n", PathBuf::from("/x")).unwrap();
        assert_eq!(unknown, vec!["WEIRD".to_string()]);
    }

    #[test]
    fn invalid_format_tag() {
        let (meta, _) =
            ImageMetadata::parse("img1", "FORMAT:notreal\n", PathBuf::from("/x")).unwrap();
        assert_eq!(meta.format, ImageFormat::Invalid);
        assert!(!meta.use_loop_mount());
    }
}
