//! Source tree enumeration.
//!
//! `Enumerator::walk` returns a lazy iterator over the source roots. Each call
//! starts a fresh walk, so the sequence can be re-enumerated. Traversal is
//! depth-first with the entries of each directory in lexicographic order.
//!
//! Symbolic links are followed, but each link target is entered at most once
//! per walk. A directory whose real path is already on the current descent
//! (a link back to an ancestor) is reported as a `LinkCycle` warning and not
//! descended into, as is a second link to an already followed target. Links
//! that resolve inside a source root are skipped: the real entry is walked
//! under its own path instead. Real directories are never suppressed.
//! Unreadable directories yield a single warning and their subtree is
//! skipped; siblings continue.
//!
//! Entries rejected by the matcher are dropped without a record.

use std::collections::{BTreeSet, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::matcher::Matcher;
use crate::model::{normalize_relative, Candidate, EnumerationWarning, WarningKind};

/// One item produced by a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEntry {
    Candidate(Candidate),
    Warning(EnumerationWarning),
}

/// Walks source roots, yielding matched candidates.
#[derive(Debug, Clone)]
pub struct Enumerator {
    roots: Vec<PathBuf>,
    matcher: Matcher,
    selection: Option<BTreeSet<String>>,
    skipped: Vec<PathBuf>,
}

impl Enumerator {
    pub fn new(roots: Vec<PathBuf>, matcher: Matcher) -> Self {
        Enumerator {
            roots,
            matcher,
            selection: None,
            skipped: Vec::new(),
        }
    }

    /// Only yield candidates whose relative path is in `selection`.
    pub fn with_selection(mut self, selection: Option<BTreeSet<String>>) -> Self {
        self.selection = selection;
        self
    }

    /// Never descend into these directories (e.g. the backup target when it
    /// lives under a source root). Paths that do not exist are ignored.
    pub fn with_skipped_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.skipped = dirs;
        self
    }

    /// Start a new walk over all roots.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            enumerator: self,
            next_root: 0,
            stack: Vec::new(),
            root_reals: self.roots.iter().filter_map(|r| fs::canonicalize(r).ok()).collect(),
            skipped_reals: self
                .skipped
                .iter()
                .filter_map(|d| fs::canonicalize(d).ok())
                .collect(),
            visited_links: HashSet::new(),
        }
    }

    fn accepts(&self, relative: &Path) -> bool {
        if !self.matcher.matches(relative) {
            return false;
        }
        match &self.selection {
            Some(selected) => selected.contains(&normalize_relative(relative)),
            None => true,
        }
    }
}

struct DirFrame {
    dir: PathBuf,
    real: PathBuf,
    relative: PathBuf,
    names: std::vec::IntoIter<OsString>,
}

/// A single in-progress walk. See [`Enumerator::walk`].
pub struct Walk<'a> {
    enumerator: &'a Enumerator,
    next_root: usize,
    stack: Vec<DirFrame>,
    root_reals: Vec<PathBuf>,
    skipped_reals: HashSet<PathBuf>,
    visited_links: HashSet<PathBuf>,
}

impl<'a> Walk<'a> {
    fn warning(path: &Path, kind: WarningKind, message: impl Into<String>) -> WalkEntry {
        WalkEntry::Warning(EnumerationWarning {
            path: path.to_path_buf(),
            kind,
            message: message.into(),
        })
    }

    fn start_root(&mut self, root: &Path) -> Option<WalkEntry> {
        let metadata = match fs::metadata(root) {
            Ok(m) => m,
            Err(e) => return Some(Self::warning(root, WarningKind::Inaccessible, e.to_string())),
        };

        if metadata.is_dir() {
            return self.enter_dir(root, PathBuf::new(), false);
        }

        if metadata.is_file() {
            let relative = match root.file_name() {
                Some(name) => PathBuf::from(name),
                None => return None,
            };
            if !self.enumerator.accepts(&relative) {
                return None;
            }
            return Some(WalkEntry::Candidate(Candidate {
                source_path: root.to_path_buf(),
                relative_path: relative,
                size: metadata.len(),
                modified: metadata.modified().ok(),
                via_link: false,
            }));
        }

        debug!(path = %root.display(), "source root is neither file nor directory");
        None
    }

    /// Push a directory frame. Returns a warning when it cannot be entered.
    fn enter_dir(&mut self, dir: &Path, relative: PathBuf, via_link: bool) -> Option<WalkEntry> {
        let real = match fs::canonicalize(dir) {
            Ok(p) => p,
            Err(e) => return Some(Self::warning(dir, WarningKind::Inaccessible, e.to_string())),
        };
        if self.skipped_reals.contains(&real) {
            debug!(path = %dir.display(), "skipping excluded directory");
            return None;
        }
        if self.stack.iter().any(|frame| frame.real == real) {
            return Some(Self::warning(
                dir,
                WarningKind::LinkCycle,
                format!("{} is an ancestor of itself", real.display()),
            ));
        }
        if via_link && !self.follow_link(dir, &real) {
            return self.link_revisit(dir, &real);
        }

        let names = match read_sorted_names(dir) {
            Ok(names) => names,
            Err(e) => return Some(Self::warning(dir, WarningKind::Unreadable, e.to_string())),
        };

        self.stack.push(DirFrame {
            dir: dir.to_path_buf(),
            real,
            relative,
            names: names.into_iter(),
        });
        None
    }

    fn inside_root(&self, real: &Path) -> bool {
        self.root_reals.iter().any(|root| real.starts_with(root))
    }

    /// Whether a link resolving to `real` should be followed now.
    fn follow_link(&mut self, link: &Path, real: &Path) -> bool {
        if self.inside_root(real) {
            debug!(path = %link.display(), target = %real.display(), "link resolves inside a source root");
            return false;
        }
        self.visited_links.insert(real.to_path_buf())
    }

    /// Outcome for a link `follow_link` refused.
    fn link_revisit(&self, link: &Path, real: &Path) -> Option<WalkEntry> {
        if self.inside_root(real) {
            return None;
        }
        Some(Self::warning(
            link,
            WarningKind::LinkCycle,
            format!("link target {} already visited", real.display()),
        ))
    }

    fn visit(&mut self, path: PathBuf, relative: PathBuf) -> Option<WalkEntry> {
        let link_meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) => return Some(Self::warning(&path, WarningKind::Inaccessible, e.to_string())),
        };
        let via_link = link_meta.file_type().is_symlink();

        let metadata = if via_link {
            match fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    return Some(Self::warning(
                        &path,
                        WarningKind::Inaccessible,
                        format!("broken link: {}", e),
                    ))
                }
            }
        } else {
            link_meta
        };

        if metadata.is_dir() {
            return self.enter_dir(&path, relative, via_link);
        }

        if !metadata.is_file() {
            debug!(path = %path.display(), "skipping special file");
            return None;
        }

        if !self.enumerator.accepts(&relative) {
            return None;
        }

        if via_link {
            let real = match fs::canonicalize(&path) {
                Ok(p) => p,
                Err(e) => return Some(Self::warning(&path, WarningKind::Inaccessible, e.to_string())),
            };
            if !self.follow_link(&path, &real) {
                return self.link_revisit(&path, &real);
            }
        }

        Some(WalkEntry::Candidate(Candidate {
            source_path: path,
            relative_path: relative,
            size: metadata.len(),
            modified: metadata.modified().ok(),
            via_link,
        }))
    }
}

impl<'a> Iterator for Walk<'a> {
    type Item = WalkEntry;

    fn next(&mut self) -> Option<WalkEntry> {
        loop {
            if let Some(frame) = self.stack.last_mut() {
                let Some(name) = frame.names.next() else {
                    self.stack.pop();
                    continue;
                };
                let path = frame.dir.join(&name);
                let relative = frame.relative.join(&name);
                if let Some(entry) = self.visit(path, relative) {
                    return Some(entry);
                }
                continue;
            }

            let root = self.enumerator.roots.get(self.next_root)?.clone();
            self.next_root += 1;
            if let Some(entry) = self.start_root(&root) {
                return Some(entry);
            }
        }
    }
}

fn read_sorted_names(dir: &Path) -> std::io::Result<Vec<OsString>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        names.push(entry?.file_name());
    }
    names.sort();
    Ok(names)
}
