use std::collections::BTreeSet;

use crate::differ::{self, DiffPlan};
use crate::error::BaycatError;
use crate::manifest::Manifest;
use crate::strategy::{Direction, TransferStrategy};

/// Knobs for one sync run. Deletion stays off unless asked, and a dry run
/// forces it off; regressed destinations are protected unless
/// `overwrite_regressed` is set.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub enable_delete: bool,
    pub verbose: bool,
    pub overwrite_regressed: bool,
}

/// Executes a diff plan against a destination through a transfer strategy.
///
/// The engine mutates a value copy of the destination manifest (the "xfer"
/// manifest) as operations succeed, so that a fully clean run leaves it
/// equal to the goal state, ready to persist. Per-operation failures are
/// logged and flip the dirty flag; the entry in question is left unmarked so
/// the next run retries it.
pub struct SyncEngine<'a> {
    src: &'a Manifest,
    dst: &'a Manifest,
    opts: SyncOptions,
    xfer: Manifest,
    dirty: bool,
}

impl<'a> SyncEngine<'a> {
    pub fn new(src: &'a Manifest, dst: &'a Manifest, opts: SyncOptions) -> SyncEngine<'a> {
        SyncEngine {
            src,
            dst,
            opts,
            xfer: dst.clone(),
            dirty: false,
        }
    }

    /// True when no operation failed during `sync()`.
    pub fn was_success(&self) -> bool {
        !self.dirty
    }

    pub fn xfer(&self) -> &Manifest {
        &self.xfer
    }

    pub fn into_xfer(self) -> Manifest {
        self.xfer
    }

    /// Carry the source's state to the destination.
    ///
    /// The order is part of the contract: deletes first (free space, surface
    /// auth problems early), directories before the files that live in them,
    /// content before metadata, and directory metadata replayed deepest
    /// first at the very end. Touching any child bumps its parent
    /// directory's mtime, so any other replay order defeats itself. The root
    /// directory's own mtime is left alone: the sync modified the tree, and
    /// hiding that would be dishonest.
    pub fn sync(&mut self, strategy: &dyn TransferStrategy) -> Result<&Manifest, BaycatError> {
        let plan = differ::diff(self.src, self.dst)?;

        let mut touched: Vec<String> = Vec::new();
        // Keyed by negated depth so sorted order is deepest first.
        let mut dir_fixups: BTreeSet<(i64, String)> = BTreeSet::new();

        // Deepest first, so directories empty out before their own removal.
        for rel_path in plan.deleted.iter().rev() {
            if self.opts.dry_run {
                log::info!("dry run: deletes disabled, keeping {rel_path}");
                self.xfer.counters.dry_run_skips += 1;
            } else if self.opts.enable_delete {
                self.op_remove(strategy, rel_path);
                touched.push(rel_path.clone());
            } else {
                log::debug!("deletes disabled, keeping {rel_path}");
            }
        }

        // Directories first so the files below them have homes.
        for rel_path in &plan.added {
            let Some(src_entry) = self.src.entries.get(rel_path) else {
                continue;
            };
            if !src_entry.is_dir {
                continue;
            }
            self.op_mkdir(strategy, rel_path);
            touched.push(rel_path.clone());
            if !rel_path.is_empty() {
                dir_fixups.insert((-depth_of(rel_path), rel_path.clone()));
            }
        }

        for rel_path in &plan.added {
            let Some(src_entry) = self.src.entries.get(rel_path) else {
                continue;
            };
            if src_entry.is_dir {
                continue;
            }
            if self.op_transfer_content(strategy, rel_path) {
                self.op_transfer_metadata(strategy, rel_path);
            }
            touched.push(rel_path.clone());
        }

        for rel_path in &plan.contents {
            if self.skip_regressed(&plan, rel_path) {
                continue;
            }
            if self.op_transfer_content(strategy, rel_path) {
                self.op_transfer_metadata(strategy, rel_path);
            }
            touched.push(rel_path.clone());
        }

        for rel_path in &plan.metadata {
            if self.skip_regressed(&plan, rel_path) {
                continue;
            }
            self.op_transfer_metadata(strategy, rel_path);
            touched.push(rel_path.clone());
        }

        // Every touched path dirtied its ancestor directories' mtimes.
        for rel_path in &touched {
            let mut current = rel_path.as_str();
            while let Some(pos) = current.rfind('/') {
                current = &current[..pos];
                if current.is_empty() || current == "/" {
                    break;
                }
                dir_fixups.insert((-depth_of(current), current.to_string()));
            }
        }

        // Replay directory metadata deepest first.
        for (_, rel_path) in &dir_fixups {
            if plan.deleted.contains(rel_path) {
                continue;
            }
            if !self.src.entries.contains_key(rel_path) {
                log::debug!("no source entry for directory {rel_path}, leaving its metadata");
                continue;
            }
            self.op_transfer_metadata(strategy, rel_path);
        }

        Ok(&self.xfer)
    }

    fn skip_regressed(&mut self, plan: &DiffPlan, rel_path: &str) -> bool {
        if plan.regressed.contains(rel_path) && !self.opts.overwrite_regressed {
            log::warn!(
                "{rel_path} is newer at the destination than at the source, not overwriting"
            );
            return true;
        }
        false
    }

    // Each op wrapper respects dry-run, catches strategy failures (log,
    // dirty flag, no xfer mutation), and on success bumps the counter and
    // applies the matching xfer mark.

    fn op_remove(&mut self, strategy: &dyn TransferStrategy, rel_path: &str) -> bool {
        if self.opts.dry_run {
            log::info!("dry run: remove {rel_path}");
            self.xfer.counters.dry_run_skips += 1;
            return true;
        }
        match strategy.remove(rel_path) {
            Ok(()) => {
                self.xfer.counters.deletes += 1;
                self.xfer.mark_deleted(rel_path);
                true
            }
            Err(e) => self.op_failed("remove", rel_path, e),
        }
    }

    fn op_mkdir(&mut self, strategy: &dyn TransferStrategy, rel_path: &str) -> bool {
        if self.opts.dry_run {
            log::info!("dry run: make directory {rel_path}");
            self.xfer.counters.dry_run_skips += 1;
            return true;
        }
        match strategy.mkdir(rel_path) {
            Ok(()) => {
                self.xfer.counters.mkdirs += 1;
                if let Some(src_entry) = self.src.entries.get(rel_path) {
                    self.xfer.mark_mkdir(rel_path, src_entry);
                }
                true
            }
            Err(e) => self.op_failed("mkdir", rel_path, e),
        }
    }

    fn op_transfer_content(&mut self, strategy: &dyn TransferStrategy, rel_path: &str) -> bool {
        if self.opts.dry_run {
            log::info!("dry run: transfer {rel_path}");
            self.xfer.counters.dry_run_skips += 1;
            return true;
        }
        if self.opts.verbose {
            log::info!("transferring {rel_path}");
        }
        match strategy.transfer_content(rel_path) {
            Ok(moved) => {
                match moved.direction {
                    Direction::Up => {
                        self.xfer.counters.uploads += 1;
                        self.xfer.counters.bytes_up += moved.bytes;
                    }
                    Direction::Down => {
                        self.xfer.counters.downloads += 1;
                        self.xfer.counters.bytes_down += moved.bytes;
                    }
                    Direction::Local => {
                        self.xfer.counters.copies += 1;
                        self.xfer.counters.bytes_up += moved.bytes;
                    }
                }
                if let Some(src_entry) = self.src.entries.get(rel_path) {
                    self.xfer.mark_transferred(rel_path, src_entry);
                }
                true
            }
            Err(e) => self.op_failed("transfer", rel_path, e),
        }
    }

    fn op_transfer_metadata(&mut self, strategy: &dyn TransferStrategy, rel_path: &str) -> bool {
        if self.opts.dry_run {
            log::info!("dry run: transfer metadata for {rel_path}");
            self.xfer.counters.dry_run_skips += 1;
            return true;
        }
        match strategy.transfer_metadata(rel_path) {
            Ok(()) => {
                self.xfer.counters.metadata_xfers += 1;
                if let Some(src_entry) = self.src.entries.get(rel_path) {
                    self.xfer.mark_metadata(rel_path, src_entry);
                }
                true
            }
            Err(e) => self.op_failed("transfer metadata", rel_path, e),
        }
    }

    fn op_failed(&mut self, what: &str, rel_path: &str, e: BaycatError) -> bool {
        log::error!("failed to {what} {rel_path}: {e}");
        self.dirty = true;
        false
    }
}

fn depth_of(rel_path: &str) -> i64 {
    rel_path.split('/').count() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::selector::Selector;
    use crate::strategy::LocalToLocal;
    use std::fs;
    use std::path::Path;

    fn manifest_of(root: &Path) -> Manifest {
        let mut m = Manifest::for_local(root);
        m.add_selector(Selector::path(root), false).unwrap();
        m
    }

    fn make_src(tmp: &Path) -> std::path::PathBuf {
        let root = tmp.join("src");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/afile"), "contents of afile").unwrap();
        fs::write(root.join("a/b/bfile"), "some content").unwrap();
        root
    }

    #[test]
    fn sync_converges_to_clean_diff() {
        let tmp = tempfile::tempdir().unwrap();
        let src_root = make_src(tmp.path());
        let dst_root = tmp.path().join("dst");
        fs::create_dir_all(&dst_root).unwrap();

        let src = manifest_of(&src_root);
        let dst = manifest_of(&dst_root);
        let strategy = LocalToLocal::new(&src, &dst).unwrap();
        let mut engine = SyncEngine::new(&src, &dst, SyncOptions::default());
        engine.sync(&strategy).unwrap();
        assert!(engine.was_success());

        let dst_after = manifest_of(&dst_root);
        let plan = crate::differ::diff(&src, &dst_after).unwrap();
        assert!(plan.added.is_empty(), "added: {:?}", plan.added);
        assert!(plan.contents.is_empty(), "contents: {:?}", plan.contents);
        // The root may drift; nothing else.
        assert!(
            plan.metadata.iter().all(|p| p.is_empty()),
            "metadata: {:?}",
            plan.metadata
        );
    }

    #[test]
    fn xfer_manifest_equals_goal_state_after_clean_run() {
        let tmp = tempfile::tempdir().unwrap();
        let src_root = make_src(tmp.path());
        let dst_root = tmp.path().join("dst");
        fs::create_dir_all(&dst_root).unwrap();

        let src = manifest_of(&src_root);
        let dst = manifest_of(&dst_root);
        let strategy = LocalToLocal::new(&src, &dst).unwrap();
        let mut engine = SyncEngine::new(&src, &dst, SyncOptions::default());
        engine.sync(&strategy).unwrap();

        // Everything except the root (whose mtime is deliberately left
        // drifted) must agree with the source.
        for (rel, entry) in &engine.xfer().entries {
            if rel.is_empty() {
                continue;
            }
            assert_eq!(entry, &src.entries[rel], "entry {rel}");
        }
    }

    #[test]
    fn dry_run_leaves_destination_and_counters_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let src_root = make_src(tmp.path());
        let dst_root = tmp.path().join("dst");
        fs::create_dir_all(&dst_root).unwrap();

        let src = manifest_of(&src_root);
        let dst = manifest_of(&dst_root);
        let before = manifest_of(&dst_root);

        let strategy = LocalToLocal::new(&src, &dst).unwrap();
        let mut engine = SyncEngine::new(
            &src,
            &dst,
            SyncOptions {
                dry_run: true,
                ..SyncOptions::default()
            },
        );
        engine.sync(&strategy).unwrap();
        assert!(engine.was_success());

        assert_eq!(manifest_of(&dst_root), before);
        let counters = &engine.xfer().counters;
        assert_eq!(counters.copies, 0);
        assert_eq!(counters.mkdirs, 0);
        assert_eq!(counters.deletes, 0);
        assert!(counters.dry_run_skips > 0);
    }

    #[test]
    fn deletes_only_happen_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let src_root = tmp.path().join("src");
        fs::create_dir_all(&src_root).unwrap();
        let dst_root = tmp.path().join("dst");
        fs::create_dir_all(&dst_root).unwrap();
        fs::write(dst_root.join("stale"), "bye").unwrap();

        let src = manifest_of(&src_root);
        let dst = manifest_of(&dst_root);

        let strategy = LocalToLocal::new(&src, &dst).unwrap();
        let mut engine = SyncEngine::new(&src, &dst, SyncOptions::default());
        engine.sync(&strategy).unwrap();
        assert!(dst_root.join("stale").exists());
        assert!(engine.xfer().entries.contains_key("stale"));

        let mut engine = SyncEngine::new(
            &src,
            &dst,
            SyncOptions {
                enable_delete: true,
                ..SyncOptions::default()
            },
        );
        engine.sync(&strategy).unwrap();
        assert!(!dst_root.join("stale").exists());
        assert!(!engine.xfer().entries.contains_key("stale"));
    }

    #[cfg(unix)]
    #[test]
    fn regressed_entries_are_protected_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let src_root = make_src(tmp.path());
        let dst_root = tmp.path().join("dst");
        fs::create_dir_all(&dst_root).unwrap();

        let src = manifest_of(&src_root);
        let dst = manifest_of(&dst_root);
        let strategy = LocalToLocal::new(&src, &dst).unwrap();
        SyncEngine::new(&src, &dst, SyncOptions::default())
            .sync(&strategy)
            .unwrap();

        // Make the source file look older than the (already synced) copy.
        fs::write(src_root.join("a/afile"), "regressed source data").unwrap();
        let old_ns = src.entries["a/afile"].mtime_ns - 86_400 * 1_000_000_000;
        set_mtime(&src_root.join("a/afile"), old_ns);

        let src2 = manifest_of(&src_root);
        let dst2 = manifest_of(&dst_root);
        let strategy = LocalToLocal::new(&src2, &dst2).unwrap();
        let mut engine = SyncEngine::new(&src2, &dst2, SyncOptions::default());
        engine.sync(&strategy).unwrap();
        assert_eq!(
            fs::read_to_string(dst_root.join("a/afile")).unwrap(),
            "contents of afile"
        );

        let mut engine = SyncEngine::new(
            &src2,
            &dst2,
            SyncOptions {
                overwrite_regressed: true,
                ..SyncOptions::default()
            },
        );
        engine.sync(&strategy).unwrap();
        assert_eq!(
            fs::read_to_string(dst_root.join("a/afile")).unwrap(),
            "regressed source data"
        );
    }

    #[cfg(unix)]
    fn set_mtime(path: &Path, mtime_ns: i64) {
        use nix::sys::stat::{utimensat, UtimensatFlags};
        use nix::sys::time::TimeSpec;
        let ts = TimeSpec::new(
            mtime_ns.div_euclid(1_000_000_000),
            mtime_ns.rem_euclid(1_000_000_000),
        );
        utimensat(None, path, &ts, &ts, UtimensatFlags::NoFollowSymlink).unwrap();
    }
}
