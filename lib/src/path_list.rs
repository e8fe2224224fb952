//! Canonical path representation as an arena of named components.
//!
//! The original implementation this was grown from used a hand-rolled
//! doubly-linked list of heap nodes (`{parent, child, owning-list}`
//! pointers). Re-implemented here as an arena addressed by stable indices
//! (`ComponentId`) per the cycle-free-structure design note: a `PathList`
//! owns a `Vec<PathComponent>` and refers to positions in it by index, so
//! duplication is a plain vector clone rather than a pointer-chasing walk.

use std::fmt;

/// Index into a [`PathList`]'s component arena. Only meaningful relative to
/// the `PathList` that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId(usize);

/// One named path element.
#[derive(Debug, Clone)]
pub struct PathComponent {
    name: String,
    parent: Option<ComponentId>,
    child: Option<ComponentId>,
}

impl PathComponent {
    /// The component's textual name (never empty, never contains `/`).
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A sequence of [`PathComponent`]s with an optional "relative root"
/// boundary that bounds `..` resolution.
#[derive(Debug, Clone, Default)]
pub struct PathList {
    arena: Vec<PathComponent>,
    head: Option<ComponentId>,
    terminal: Option<ComponentId>,
    relroot: Option<ComponentId>,
    absolute: bool,
}

impl PathList {
    /// An empty, non-absolute path list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `path` into components, splitting on `/`. Empty segments and
    /// `.` are dropped; `..` is retained as a literal component and
    /// resolved by the subsequent [`PathList::resolve`] call.
    /// Absoluteness is inferred from a leading `/`.
    pub fn init(path: &str) -> Self {
        let mut pl = Self {
            absolute: path.starts_with('/'),
            ..Self::default()
        };
        for seg in path.split('/') {
            if seg.is_empty() || seg == "." {
                continue;
            }
            pl.push_raw(seg);
        }
        pl.resolve();
        pl
    }

    fn push_raw(&mut self, name: &str) -> ComponentId {
        let id = ComponentId(self.arena.len());
        self.arena.push(PathComponent {
            name: name.to_string(),
            parent: self.terminal,
            child: None,
        });
        if let Some(t) = self.terminal {
            self.arena[t.0].child = Some(id);
        } else {
            self.head = Some(id);
        }
        self.terminal = Some(id);
        id
    }

    /// Whether this path list was parsed/constructed as absolute.
    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// The head (first) component, if any.
    pub fn head(&self) -> Option<ComponentId> {
        self.head
    }

    /// The terminal (last) component, if any.
    pub fn terminal(&self) -> Option<ComponentId> {
        self.terminal
    }

    /// The relative-root boundary component, if set.
    pub fn relroot(&self) -> Option<ComponentId> {
        self.relroot
    }

    fn component(&self, id: ComponentId) -> &PathComponent {
        &self.arena[id.0]
    }

    /// Iterate component ids from head to terminal.
    pub fn iter_ids(&self) -> impl Iterator<Item = ComponentId> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let id = cur?;
            cur = self.arena[id.0].child;
            Some(id)
        })
    }

    /// Left-to-right `..` resolution, bounded at `relroot` (never removed,
    /// never traversed past). A no-op on relative paths: without an
    /// absolute root there is nothing to collapse `..` against.
    pub fn resolve(&mut self) {
        if !self.absolute {
            return;
        }
        let mut order: Vec<ComponentId> = self.iter_ids().collect();
        let mut i = 0usize;
        while i < order.len() {
            if self.component(order[i]).name() != ".." {
                i += 1;
                continue;
            }
            if i == 0 {
                // No parent to remove; drop the dangling `..` itself.
                order.remove(0);
                continue;
            }
            let pidx = i - 1;
            let parent_id = order[pidx];
            if Some(parent_id) == self.relroot {
                // Keep the boundary component; drop only the `..`.
                order.remove(i);
                // i now indexes whatever followed; re-scan from here.
            } else {
                order.remove(i);
                order.remove(pidx);
                i = pidx;
            }
        }
        self.relink(order);
    }

    fn relink(&mut self, order: Vec<ComponentId>) {
        for w in order.windows(2) {
            self.arena[w[0].0].child = Some(w[1]);
            self.arena[w[1].0].parent = Some(w[0]);
        }
        self.head = order.first().copied();
        self.terminal = order.last().copied();
        if let Some(h) = self.head {
            self.arena[h.0].parent = None;
        }
        if let Some(t) = self.terminal {
            self.arena[t.0].child = None;
        }
    }

    /// Set `relroot` to the component in `self` matching the tail of
    /// `rootpath` (which must itself be absolute). Clears `relroot` if
    /// `rootpath` normalizes to `/`.
    pub fn set_root(&mut self, rootpath: &str) -> Result<(), String> {
        let root_pl = PathList::init(rootpath);
        if !root_pl.is_absolute() {
            return Err(format!("{rootpath} is not absolute"));
        }
        if root_pl.head.is_none() {
            self.relroot = None;
            return Ok(());
        }
        match self.match_partial(&root_pl) {
            Some(id) => {
                self.relroot = Some(id);
                Ok(())
            }
            None => Err(format!("{rootpath} does not match a prefix of this path")),
        }
    }

    /// Splice `other`'s components onto `self`, returning the id range
    /// that was appended (head, tail) within `self`'s arena.
    fn splice_in(&mut self, other: &PathList) -> Option<(ComponentId, ComponentId)> {
        if other.head.is_none() {
            return None;
        }
        let offset = self.arena.len();
        for c in &other.arena {
            self.arena.push(PathComponent {
                name: c.name.clone(),
                parent: c.parent.map(|p| ComponentId(p.0 + offset)),
                child: c.child.map(|p| ComponentId(p.0 + offset)),
            });
        }
        let new_head = ComponentId(other.head.unwrap().0 + offset);
        let new_tail = ComponentId(other.terminal.unwrap().0 + offset);
        Some((new_head, new_tail))
    }

    /// Append `path` onto `base`'s terminal, then re-resolve.
    pub fn append(&mut self, path: &str) {
        let suffix = PathList::init(path);
        self.splice_onto_terminal(&suffix);
        self.resolve();
    }

    /// Deep-copy this list, preserving the relroot/terminal markers.
    pub fn duplicate(&self) -> PathList {
        self.clone()
    }

    /// Duplicate, then truncate the copy at (and including) `upto`.
    pub fn duplicate_partial(&self, upto: ComponentId) -> PathList {
        let mut copy = self.duplicate();
        copy.arena[upto.0].child = None;
        copy.terminal = Some(upto);
        if copy.relroot.map(|r| self.is_after(upto, r)) == Some(true) {
            copy.relroot = None;
        }
        copy
    }

    /// Whether `a` lies strictly after `b` in head->terminal order.
    fn is_after(&self, a: ComponentId, b: ComponentId) -> bool {
        for id in self.iter_ids() {
            if id == b {
                return false;
            }
            if id == a {
                return true;
            }
        }
        false
    }

    /// The shared-prefix path of `a` and `b`. Fails if the two lists
    /// disagree about where `relroot` falls within the shared prefix.
    pub fn common_path(a: &PathList, b: &PathList) -> Result<PathList, String> {
        let mut out = PathList {
            absolute: a.absolute,
            ..PathList::default()
        };
        let mut ai = a.head;
        let mut bi = b.head;
        let mut idx = 0usize;
        loop {
            match (ai, bi) {
                (Some(x), Some(y)) if a.component(x).name() == b.component(y).name() => {
                    let a_is_root = a.relroot == Some(x);
                    let b_is_root = b.relroot == Some(y);
                    if a_is_root != b_is_root {
                        return Err("relroot position disagreement in common_path".to_string());
                    }
                    let id = out.push_raw(a.component(x).name());
                    if a_is_root {
                        out.relroot = Some(id);
                    }
                    ai = a.component(x).child;
                    bi = b.component(y).child;
                    idx += 1;
                }
                _ => break,
            }
        }
        let _ = idx;
        Ok(out)
    }

    /// Return the component in `full` corresponding to the last component
    /// of `partial`, or `None` if `partial` diverges from `full`.
    pub fn match_partial(&self, partial: &PathList) -> Option<ComponentId> {
        let mut fi = self.head;
        let mut pi = partial.head;
        let mut last_match = None;
        loop {
            match (fi, pi) {
                (Some(f), Some(p)) if self.component(f).name() == partial.component(p).name() => {
                    last_match = Some(f);
                    fi = self.component(f).child;
                    pi = partial.component(p).child;
                }
                (_, None) => break,
                _ => return None,
            }
        }
        last_match
    }

    /// Render as `/`-joined text. An absolute list emits a leading `/`; the
    /// empty absolute list emits `/`.
    pub fn string(&self) -> String {
        self.string_partial(self.terminal)
    }

    /// Render only up to (and including) `upto`.
    pub fn string_partial(&self, upto: Option<ComponentId>) -> String {
        let mut parts = Vec::new();
        for id in self.iter_ids() {
            parts.push(self.component(id).name().to_string());
            if Some(id) == upto {
                break;
            }
        }
        let joined = parts.join("/");
        if self.absolute {
            format!("/{joined}")
        } else {
            joined
        }
    }

    /// Resolve a symlink target `link_text` relative to `base`: duplicate
    /// `base`, then either replant (if absolute, discarding everything
    /// above `relroot`/head) or append (if relative), then re-resolve.
    pub fn symlink_resolve(base: &PathList, link_text: &str) -> PathList {
        let mut pl = base.duplicate();
        let link = PathList::init(link_text);
        if link.is_absolute() {
            // Replant above relroot (or above head if none), discarding
            // whatever currently sits above that anchor.
            match pl.relroot {
                Some(anchor) => {
                    pl = pl.duplicate_partial(anchor);
                    pl.relroot = Some(anchor);
                }
                None => {
                    pl.head = None;
                    pl.terminal = None;
                    pl.relroot = None;
                }
            }
        }
        pl.splice_onto_terminal(&link);
        pl.resolve();
        pl
    }

    /// Splice `other`'s components onto this list's terminal, in place.
    fn splice_onto_terminal(&mut self, other: &PathList) {
        let Some((new_head, new_tail)) = self.splice_in(other) else {
            return;
        };
        if let Some(old_terminal) = self.terminal {
            self.arena[old_terminal.0].child = Some(new_head);
            self.arena[new_head.0].parent = Some(old_terminal);
        } else {
            self.head = Some(new_head);
        }
        self.terminal = Some(new_tail);
    }

    /// The realpath primitive: given `path` and one of its components known
    /// to be a symlink with target text `link_text`, produce the rewritten
    /// path. Returns the first component of the result not yet vetted by
    /// the caller's walk, so the caller may continue resolution from there.
    pub fn symlink_substitute(
        path: &PathList,
        link_comp: ComponentId,
        link_text: &str,
    ) -> Result<(PathList, Option<ComponentId>), String> {
        let orig_prefix = path.duplicate_partial(link_comp);
        let parent = orig_prefix
            .component(link_comp)
            .parent
            .map(|p| orig_prefix.duplicate_partial(p))
            .unwrap_or_else(|| {
                let mut empty = PathList {
                    absolute: orig_prefix.absolute,
                    ..PathList::default()
                };
                empty.relroot = None;
                empty
            });
        let link_path = PathList::symlink_resolve(&parent, link_text);
        let common = PathList::common_path(&orig_prefix, &link_path)?;

        let mut result = link_path.duplicate();
        let common_len = common.iter_ids().count();
        let link_len = link_path.iter_ids().count();
        let next_unchecked = if link_len > common_len {
            // Extra link components beyond the shared prefix are new;
            // the first of those is where the caller should resume.
            link_path.iter_ids().nth(common_len)
        } else {
            None
        };

        // Re-append the trailing components of the original path that
        // followed `link_comp`.
        let mut tail_names = Vec::new();
        let mut found = false;
        for id in path.iter_ids() {
            if found {
                tail_names.push(path.component(id).name().to_string());
            }
            if id == link_comp {
                found = true;
            }
        }
        for name in &tail_names {
            result.push_raw(name);
        }
        result.resolve();
        Ok((result, next_unchecked))
    }
}

impl fmt::Display for PathList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic() {
        let pl = PathList::init("/a/b/c");
        assert_eq!(pl.string(), "/a/b/c");
        assert!(pl.is_absolute());
    }

    #[test]
    fn drops_dot_and_empty_segments() {
        let pl = PathList::init("/a//./b/");
        assert_eq!(pl.string(), "/a/b");
    }

    #[test]
    fn dotdot_normalizes() {
        let pl = PathList::init("/a/b/../c");
        assert_eq!(pl.string(), "/a/c");
    }

    #[test]
    fn leading_dotdot_on_absolute_resolves_to_root() {
        let pl = PathList::init("/../foo");
        assert_eq!(pl.string(), "/foo");
    }

    #[test]
    fn all_dotdot_relative_components_are_left_untouched() {
        let pl = PathList::init("../../..");
        assert_eq!(pl.string(), "../../..");
    }

    #[test]
    fn root_only() {
        let pl = PathList::init("/");
        assert_eq!(pl.string(), "/");
    }

    #[test]
    fn relroot_bounds_dotdot() {
        let mut pl = PathList::init("/var/udiMount/global/user/dmj");
        pl.set_root("/var/udiMount").unwrap();
        pl.append("../../../../../../etc/passwd");
        // `..` may never cross above relroot ("udiMount").
        assert_eq!(pl.string(), "/var/udiMount/etc/passwd");
    }

    #[test]
    fn set_root_clears_on_slash() {
        let mut pl = PathList::init("/a/b");
        pl.set_root("/a").unwrap();
        assert!(pl.relroot().is_some());
        pl.set_root("/").unwrap();
        assert!(pl.relroot().is_none());
    }

    #[test]
    fn duplicate_is_independent() {
        let pl = PathList::init("/a/b");
        let mut dup = pl.duplicate();
        dup.append("c");
        assert_eq!(pl.string(), "/a/b");
        assert_eq!(dup.string(), "/a/b/c");
    }

    #[test]
    fn common_path_shared_prefix() {
        let a = PathList::init("/a/b/c");
        let b = PathList::init("/a/b/d");
        let common = PathList::common_path(&a, &b).unwrap();
        assert_eq!(common.string(), "/a/b");
    }

    #[test]
    fn match_partial_finds_tail_component() {
        let full = PathList::init("/var/udiMount/global/u1");
        let partial = PathList::init("/var/udiMount");
        let id = full.match_partial(&partial).unwrap();
        assert_eq!(full.component(id).name(), "udiMount");
    }

    #[test]
    fn match_partial_diverges() {
        let full = PathList::init("/var/udiMount");
        let partial = PathList::init("/var/other");
        assert!(full.match_partial(&partial).is_none());
    }

    /// S2: symlink substitution stays bounded at relroot and resumes from
    /// the newly introduced component.
    #[test]
    fn symlink_substitute_scenario_s2() {
        let mut base = PathList::init("/var/udiMount/global/user/dmj/test/1234");
        base.set_root("/var/udiMount").unwrap();
        let user_comp = base
            .iter_ids()
            .find(|&id| base.component(id).name() == "user")
            .unwrap();
        let (result, next) =
            PathList::symlink_substitute(&base, user_comp, "/global/u1").unwrap();
        assert_eq!(result.string(), "/var/udiMount/global/u1/dmj/test/1234");
        let next_id = next.expect("resumption point");
        assert_eq!(result.component(next_id).name(), "u1");
    }
}
