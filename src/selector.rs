use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::entry::Entry;
use crate::error::BaycatError;

/// A producer of entries rooted at some path. Selectors are value-comparable
/// and travel inside the persisted manifest so `update()` can re-run them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_json_classname")]
pub enum Selector {
    PathSelector { rootpath: PathBuf },
}

impl Selector {
    pub fn path(rootpath: impl Into<PathBuf>) -> Selector {
        Selector::PathSelector {
            rootpath: rootpath.into(),
        }
    }

    pub fn rootpath(&self) -> &Path {
        match self {
            Selector::PathSelector { rootpath } => rootpath,
        }
    }

    /// Lazily walk the tree: the root directory entry first, then every
    /// file as it is discovered, then every subdirectory.
    ///
    /// Directory entries carry no trailing slash. A plain file carrying the
    /// directory placeholder name surfaces as a `ReservedName` error in the
    /// stream; consumers log and skip it.
    pub fn walk(&self) -> Walk {
        let root = self.rootpath().to_path_buf();
        Walk {
            it: WalkDir::new(&root).min_depth(1).into_iter(),
            root,
            yielded_root: false,
            pending_dirs: VecDeque::new(),
        }
    }
}

pub struct Walk {
    root: PathBuf,
    it: walkdir::IntoIter,
    yielded_root: bool,
    pending_dirs: VecDeque<String>,
}

impl Walk {
    fn rel_of(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

impl Iterator for Walk {
    type Item = Result<Entry, BaycatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.yielded_root {
            self.yielded_root = true;
            return Some(Entry::from_local(&self.root, ""));
        }

        while let Some(item) = self.it.next() {
            let dent = match item {
                Ok(d) => d,
                Err(e) => {
                    let msg = e.to_string();
                    let io = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other(msg));
                    return Some(Err(BaycatError::Io(io)));
                }
            };
            let rel = self.rel_of(dent.path());
            if dent.file_type().is_dir() {
                self.pending_dirs.push_back(rel);
            } else {
                return Some(Entry::from_local(&self.root, &rel));
            }
        }

        let rel = self.pending_dirs.pop_front()?;
        Some(Entry::from_local(&self.root, &rel))
    }
}
