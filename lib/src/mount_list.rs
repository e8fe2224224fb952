//! In-memory model of the current process's mount table, parsed from
//! `/proc/self/mounts`.
//!
//! The kernel's per-process mount-state pseudo-file is whitespace-separated
//! `device mountpoint fstype options dump pass`; the mount point is the
//! second token on each line.

use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{umount2, MntFlags};

use crate::error::{CoreError, Result};

const MOUNTINFO_PATH: &str = "/proc/self/mounts";

/// Sort direction maintained by a [`MountList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending lexical order.
    Forward,
    /// Descending lexical order.
    Reverse,
}

/// An ordered set of absolute mount-point paths.
#[derive(Debug, Clone)]
pub struct MountList {
    entries: Vec<PathBuf>,
    order: SortOrder,
}

impl MountList {
    /// Parse the kernel's current mount table for this process.
    pub fn parse() -> Result<Self> {
        Self::parse_from(MOUNTINFO_PATH)
    }

    /// Parse an arbitrary mountinfo-formatted file (used by tests and by
    /// `refresh`).
    pub fn parse_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).map_err(|e| CoreError::fs(path.to_path_buf(), e))?;
        let mut entries: Vec<PathBuf> = text
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(PathBuf::from)
            .collect();
        entries.sort();
        entries.dedup();
        Ok(Self {
            entries,
            order: SortOrder::Forward,
        })
    }

    /// Re-parse the live mount table, replacing this list's contents.
    pub fn refresh(&mut self) -> Result<()> {
        let fresh = Self::parse()?;
        self.entries = fresh.entries;
        self.apply_sort();
        Ok(())
    }

    fn apply_sort(&mut self) {
        match self.order {
            SortOrder::Forward => self.entries.sort(),
            SortOrder::Reverse => {
                self.entries.sort();
                self.entries.reverse();
            }
        }
    }

    /// Switch sort order, re-sorting in place.
    pub fn set_sort(&mut self, order: SortOrder) {
        self.order = order;
        self.apply_sort();
    }

    /// Current sort order.
    pub fn sort_order(&self) -> SortOrder {
        self.order
    }

    /// Insert a mount point, maintaining sort order. No-op if already
    /// present.
    pub fn insert(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if self.entries.contains(&path) {
            return;
        }
        self.entries.push(path);
        self.apply_sort();
    }

    /// Remove a mount point if present.
    pub fn remove(&mut self, path: &Path) {
        self.entries.retain(|p| p != path);
    }

    /// Exact-match lookup.
    pub fn find(&self, path: &Path) -> bool {
        self.entries.iter().any(|p| p == path)
    }

    /// Prefix lookup: any entry equal to or nested under `base`.
    pub fn find_starts_with(&self, base: &Path) -> Vec<&Path> {
        self.entries
            .iter()
            .filter(|p| p.as_path() == base || p.starts_with(base))
            .map(PathBuf::as_path)
            .collect()
    }

    /// All entries, in current sort order.
    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    /// Unmount every entry at or under `base`, in reverse-sorted order so
    /// the deepest mounts go first. Stops at the first failure and
    /// restores the original sort order on exit (success or failure).
    pub fn unmount_tree(&mut self, base: &Path) -> Result<()> {
        let original_order = self.order;
        self.set_sort(SortOrder::Reverse);
        let targets: Vec<PathBuf> = self.find_starts_with(base).into_iter().map(Path::to_path_buf).collect();
        let result = (|| {
            for target in &targets {
                umount2(target.as_path(), MntFlags::MNT_DETACH)
                    .map_err(|e| CoreError::kernel(format!("umount2 {}", target.display()), e))?;
                self.entries.retain(|p| p != target);
            }
            Ok(())
        })();
        self.set_sort(original_order);
        result
    }

    /// Re-parse mount state and return true iff no entry equals (or, if
    /// `subtree`, starts with) `path`.
    pub fn validate_unmounted(path: &Path, subtree: bool) -> Result<bool> {
        let fresh = Self::parse()?;
        if subtree {
            Ok(fresh.find_starts_with(path).is_empty())
        } else {
            Ok(!fresh.find(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_mountinfo(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for l in lines {
            writeln!(f, "{l}").unwrap();
        }
        f
    }

    const SAMPLE: &str = "/dev/root / ext4 rw,relatime 0 0\n\
         proc /proc proc rw,nosuid 0 0\n\
         sysfs /sys sysfs rw,nosuid 0 0\n\
         tmpfs /var/udiMount tmpfs rw 0 0\n";

    #[test]
    fn parses_mount_point_field() {
        let f = write_mountinfo(&[SAMPLE]);
        let list = MountList::parse_from(f.path()).unwrap();
        assert!(list.find(Path::new("/")));
        assert!(list.find(Path::new("/proc")));
        assert!(list.find(Path::new("/var/udiMount")));
        assert!(!list.find(Path::new("/nonexistent")));
    }

    #[test]
    fn sorted_forward_by_default() {
        let f = write_mountinfo(&[SAMPLE]);
        let list = MountList::parse_from(f.path()).unwrap();
        let mut sorted = list.entries().to_vec();
        sorted.sort();
        assert_eq!(list.entries(), sorted.as_slice());
    }

    #[test]
    fn insert_and_remove() {
        let mut list = MountList {
            entries: vec![],
            order: SortOrder::Forward,
        };
        list.insert("/mnt/b");
        list.insert("/mnt/a");
        assert_eq!(list.entries(), &[PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")]);
        list.remove(Path::new("/mnt/a"));
        assert_eq!(list.entries(), &[PathBuf::from("/mnt/b")]);
    }

    #[test]
    fn find_starts_with_prefix() {
        let mut list = MountList {
            entries: vec![],
            order: SortOrder::Forward,
        };
        list.insert("/var/udiMount");
        list.insert("/var/udiMount/proc");
        list.insert("/var/spool");
        let hits = list.find_starts_with(Path::new("/var/udiMount"));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn insert_dedupes() {
        let mut list = MountList {
            entries: vec![],
            order: SortOrder::Forward,
        };
        list.insert("/a");
        list.insert("/a");
        assert_eq!(list.entries().len(), 1);
    }
}
