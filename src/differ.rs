use std::collections::BTreeSet;

use crate::error::BaycatError;
use crate::manifest::Manifest;

/// The categorized outcome of comparing two manifests. Every common path
/// lands in `unchanged` or in one or both of `contents`/`metadata`;
/// `regressed` marks paths whose new side is older than recorded, which the
/// engine refuses to overwrite by default.
#[derive(Debug, Default, Clone)]
pub struct DiffPlan {
    pub added: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
    pub contents: BTreeSet<String>,
    pub metadata: BTreeSet<String>,
    pub unchanged: BTreeSet<String>,
    pub regressed: BTreeSet<String>,
}

impl DiffPlan {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty()
            && self.deleted.is_empty()
            && self.contents.is_empty()
            && self.metadata.is_empty()
            && self.regressed.is_empty()
    }
}

/// Compare `new` against `old` and plan the work to bring `old` up to date.
///
/// Pure set arithmetic over relative paths; no I/O happens here. Content-ish
/// drift (size/mtime/digest) on a directory entry counts as metadata, since
/// a directory has no contents to transfer.
pub fn diff(new: &Manifest, old: &Manifest) -> Result<DiffPlan, BaycatError> {
    let mut plan = DiffPlan::default();

    for rel_path in new.entries.keys() {
        if !old.entries.contains_key(rel_path) {
            plan.added.insert(rel_path.clone());
        }
    }
    for rel_path in old.entries.keys() {
        if !new.entries.contains_key(rel_path) {
            plan.deleted.insert(rel_path.clone());
        }
    }

    for (rel_path, new_entry) in &new.entries {
        let Some(old_entry) = old.entries.get(rel_path) else {
            continue;
        };
        let delta = new_entry.delta(old_entry, false)?;

        if !delta.dirty() {
            plan.unchanged.insert(rel_path.clone());
            continue;
        }

        let contentish = delta.size || delta.mtime || delta.cksum.unwrap_or(false);
        if contentish {
            if new_entry.is_dir {
                plan.metadata.insert(rel_path.clone());
            } else {
                plan.contents.insert(rel_path.clone());
            }
        }
        if delta.metadata_dirty() {
            plan.metadata.insert(rel_path.clone());
        }
        if delta.regressed {
            plan.regressed.insert(rel_path.clone());
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::selector::Selector;
    use std::fs;

    fn manifest_of(root: &std::path::Path) -> Manifest {
        let mut m = Manifest::for_local(root);
        m.add_selector(Selector::path(root), false).unwrap();
        m
    }

    #[test]
    fn diff_of_manifest_with_its_copy_is_clean() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::write(tmp.path().join("a/f"), "data").unwrap();

        let m = manifest_of(tmp.path());
        let plan = diff(&m, &m.clone()).unwrap();
        assert!(plan.is_clean());
        assert_eq!(plan.unchanged.len(), m.entries.len());
    }

    #[test]
    fn added_and_deleted_are_set_differences() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("keep"), "k").unwrap();
        fs::write(tmp.path().join("old"), "o").unwrap();
        let old = manifest_of(tmp.path());

        fs::remove_file(tmp.path().join("old")).unwrap();
        fs::write(tmp.path().join("new"), "n").unwrap();
        let new = manifest_of(tmp.path());

        let plan = diff(&new, &old).unwrap();
        assert_eq!(plan.added.iter().collect::<Vec<_>>(), vec!["new"]);
        assert_eq!(plan.deleted.iter().collect::<Vec<_>>(), vec!["old"]);
        assert!(plan.unchanged.contains("keep"));
    }

    #[test]
    fn directory_timestamp_drift_is_metadata_not_contents() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("d")).unwrap();
        let old = manifest_of(tmp.path());

        let mut new = old.clone();
        new.entries.get_mut("d").unwrap().mtime_ns += 5;
        let plan = diff(&new, &old).unwrap();
        assert!(plan.contents.is_empty());
        assert!(plan.metadata.contains("d"));
    }

    #[test]
    fn regressed_marks_new_side_older() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("f"), "data").unwrap();
        let old = manifest_of(tmp.path());

        let mut new = old.clone();
        new.entries.get_mut("f").unwrap().mtime_ns -= 86_400 * 1_000_000_000;
        let plan = diff(&new, &old).unwrap();
        assert!(plan.contents.contains("f"));
        assert!(plan.regressed.contains("f"));
    }

    #[test]
    fn content_and_metadata_are_orthogonal() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("f"), "data").unwrap();
        let old = manifest_of(tmp.path());

        let mut new = old.clone();
        {
            let e = new.entries.get_mut("f").unwrap();
            e.size += 1;
            e.metadata.mode = Some(0o100600);
        }
        let plan = diff(&new, &old).unwrap();
        assert!(plan.contents.contains("f"));
        assert!(plan.metadata.contains("f"));
        assert!(!plan.unchanged.contains("f"));
    }
}
