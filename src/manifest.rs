use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checksum::{self, ChecksumTask};
use crate::entry::{Entry, EntryOrigin};
use crate::error::BaycatError;
use crate::selector::Selector;
use crate::store::{self, ObjectStore};

/// Directory under a managed local root that belongs to baycat itself.
pub const RESERVED_DIR: &str = ".baycat";

/// Local manifests persist at `<root>/.baycat/manifest`.
pub const MANIFEST_FILENAME: &str = "manifest";

/// Object-store manifests persist at key `<prefix>/.baycat/s3manifest`.
pub const STORE_MANIFEST_FILENAME: &str = "s3manifest";

/// The endpoint-relative base a manifest describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestRoot {
    Local(PathBuf),
    Store { bucket: String, prefix: String },
}

/// Monotonic operation counters for one manifest. Not persisted, never part
/// of equality; the sync engine is their only writer during a run.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub copies: u64,
    pub deletes: u64,
    pub mkdirs: u64,
    pub metadata_xfers: u64,
    pub list_calls: u64,
    pub dry_run_skips: u64,
}

impl Counters {
    /// `(label, value)` pairs in display order.
    pub fn rows(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("bytes_up", self.bytes_up),
            ("bytes_down", self.bytes_down),
            ("uploads", self.uploads),
            ("downloads", self.downloads),
            ("copies", self.copies),
            ("deletes", self.deletes),
            ("mkdirs", self.mkdirs),
            ("metadata_xfers", self.metadata_xfers),
            ("list_calls", self.list_calls),
            ("dry_run_skips", self.dry_run_skips),
        ]
    }
}

/// The full inventory of one endpoint's tree at a point in time: an entry
/// per path (keyed by root-relative path, `""` for the root itself), the
/// selectors that populated it, and the reserved-prefix policy keeping the
/// manifest's own storage out of the entry set.
///
/// One type covers both endpoints; the differences (directories present or
/// absent, digest source, metadata completeness) are data on the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "ManifestRepr", into = "ManifestRepr")]
pub struct Manifest {
    pub root: Option<ManifestRoot>,
    pub path: Option<PathBuf>,
    pub entries: BTreeMap<String, Entry>,
    pub selectors: Vec<Selector>,
    pub pool_size: usize,
    pub counters: Counters,
}

/// Manifests are equal iff their entry maps are equal. Roots, persistence
/// paths, and counters do not participate.
impl PartialEq for Manifest {
    fn eq(&self, other: &Manifest) -> bool {
        self.entries == other.entries
    }
}

impl Manifest {
    /// An empty manifest. At least one of `root` and `path` must be given;
    /// a path-only manifest adopts its root from the first selector.
    pub fn new(root: Option<ManifestRoot>, path: Option<PathBuf>) -> Result<Manifest, BaycatError> {
        if root.is_none() && path.is_none() {
            return Err(BaycatError::InvalidArgument(
                "a manifest needs a root or an explicit path".to_string(),
            ));
        }
        Ok(Manifest {
            root,
            path,
            entries: BTreeMap::new(),
            selectors: Vec::new(),
            pool_size: 0,
            counters: Counters::default(),
        })
    }

    pub fn for_local(root: impl Into<PathBuf>) -> Manifest {
        Manifest {
            root: Some(ManifestRoot::Local(root.into())),
            path: None,
            entries: BTreeMap::new(),
            selectors: Vec::new(),
            pool_size: 0,
            counters: Counters::default(),
        }
    }

    pub fn for_store(bucket: impl Into<String>, prefix: impl Into<String>) -> Manifest {
        Manifest {
            root: Some(ManifestRoot::Store {
                bucket: bucket.into(),
                prefix: prefix.into(),
            }),
            path: None,
            entries: BTreeMap::new(),
            selectors: Vec::new(),
            pool_size: 0,
            counters: Counters::default(),
        }
    }

    /// Walk `root` into a fresh manifest, optionally computing digests.
    pub fn for_path(
        root: &Path,
        path: Option<&Path>,
        pool_size: usize,
        do_checksum: bool,
    ) -> Result<Manifest, BaycatError> {
        let mut m = Manifest::new(
            Some(ManifestRoot::Local(root.to_path_buf())),
            path.map(Path::to_path_buf),
        )?;
        m.pool_size = pool_size;
        m.add_selector(Selector::path(root), do_checksum)?;
        Ok(m)
    }

    pub fn local_root(&self) -> Result<&Path, BaycatError> {
        match &self.root {
            Some(ManifestRoot::Local(p)) => Ok(p),
            _ => Err(BaycatError::InvalidArgument(
                "manifest has no local root".to_string(),
            )),
        }
    }

    pub fn store_root(&self) -> Result<(&str, &str), BaycatError> {
        match &self.root {
            Some(ManifestRoot::Store { bucket, prefix }) => Ok((bucket, prefix)),
            _ => Err(BaycatError::InvalidArgument(
                "manifest has no object-store root".to_string(),
            )),
        }
    }

    pub fn origin(&self) -> EntryOrigin {
        match &self.root {
            Some(ManifestRoot::Store { .. }) => EntryOrigin::Store,
            _ => EntryOrigin::Local,
        }
    }

    fn default_local_path(root: &Path) -> PathBuf {
        root.join(RESERVED_DIR).join(MANIFEST_FILENAME)
    }

    /// Key of this manifest's own persisted document within the bucket.
    pub fn store_manifest_key(prefix: &str) -> String {
        store::key_join(prefix, &format!("{RESERVED_DIR}/{STORE_MANIFEST_FILENAME}"))
    }

    /// The root-relative prefix that must never appear as a user entry: the
    /// place this manifest persists itself. An explicit path outside the
    /// root reserves nothing.
    pub fn reserved_prefix(&self) -> Option<String> {
        let path = match (&self.path, &self.root) {
            (Some(path), Some(ManifestRoot::Local(root))) => {
                let rel = path.strip_prefix(root).ok()?;
                rel.parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(rel)
                    .to_string_lossy()
                    .replace('\\', "/")
            }
            (Some(_), None) => return None,
            _ => RESERVED_DIR.to_string(),
        };
        Some(path)
    }

    pub fn is_reserved_path(&self, rel_path: &str) -> bool {
        match self.reserved_prefix() {
            Some(prefix) => {
                rel_path == prefix || rel_path.starts_with(&format!("{prefix}/"))
            }
            None => false,
        }
    }

    /// Absolute location of `rel_path` under a local root.
    pub fn expand_path(&self, rel_path: &str) -> Result<PathBuf, BaycatError> {
        let root = self.local_root()?;
        Ok(if rel_path.is_empty() {
            root.to_path_buf()
        } else {
            root.join(rel_path)
        })
    }

    // -----------------------------------------------------------------------
    // Population
    // -----------------------------------------------------------------------

    /// Record a selector and rebuild the entry set from every selector held.
    ///
    /// Re-running the same selector set is idempotent. The first selector
    /// supplies the root when the manifest has none; a disagreeing root is
    /// refused.
    pub fn add_selector(&mut self, sel: Selector, do_checksum: bool) -> Result<(), BaycatError> {
        match &self.root {
            None => {
                self.root = Some(ManifestRoot::Local(sel.rootpath().to_path_buf()));
            }
            Some(ManifestRoot::Local(root)) => {
                if root != sel.rootpath() {
                    return Err(BaycatError::DifferentRootPath {
                        root: root.display().to_string(),
                        selector: sel.rootpath().display().to_string(),
                    });
                }
            }
            Some(ManifestRoot::Store { bucket, .. }) => {
                return Err(BaycatError::DifferentRootPath {
                    root: format!("store bucket {bucket}"),
                    selector: sel.rootpath().display().to_string(),
                });
            }
        }

        if !self.selectors.contains(&sel) {
            self.selectors.push(sel);
        }
        self.repopulate()?;
        if do_checksum {
            self.compute_missing_checksums()?;
        }
        Ok(())
    }

    /// Run every selector from scratch. Reserved paths are skipped with a
    /// debug note, reserved-name files with a warning.
    fn repopulate(&mut self) -> Result<(), BaycatError> {
        self.entries.clear();
        let selectors = self.selectors.clone();
        for sel in &selectors {
            for item in sel.walk() {
                match item {
                    Ok(entry) => {
                        if self.is_reserved_path(&entry.rel_path) {
                            log::debug!("skipping reserved path {}", entry.rel_path);
                            continue;
                        }
                        self.entries.insert(entry.rel_path.clone(), entry);
                    }
                    Err(BaycatError::ReservedName(name)) => {
                        log::warn!(
                            "\"{name}\" conflicts with the directory metadata file, not syncing it"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Digest every non-directory entry that has none, fanning out over the
    /// manifest's checksum pool.
    pub fn compute_missing_checksums(&mut self) -> Result<(), BaycatError> {
        if self.local_root().is_err() {
            return Ok(()); // store digests come from listings
        }
        let tasks: Vec<ChecksumTask> = self
            .entries
            .values()
            .filter(|e| !e.is_dir && e.cksum.is_none())
            .map(|e| {
                Ok(ChecksumTask {
                    rel_path: e.rel_path.clone(),
                    abs_path: self.expand_path(&e.rel_path)?,
                })
            })
            .collect::<Result<_, BaycatError>>()?;
        if tasks.is_empty() {
            return Ok(());
        }

        log::debug!("computing {} checksums (pool_size={})", tasks.len(), self.pool_size);
        for (rel_path, result) in checksum::compute_many(tasks, self.pool_size) {
            let digest = result?;
            if let Some(entry) = self.entries.get_mut(&rel_path) {
                entry.cksum = Some(digest);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Re-run the selectors and reconcile against the recorded state: paths
    /// only on disk are added, paths only in the manifest are removed, and
    /// paths in both are replaced iff `changed_from` reports a difference.
    /// Atime is never consulted. Entries that end up without a digest get
    /// one, so a refreshed manifest always carries full checksums.
    pub fn update(&mut self, force_checksum: bool) -> Result<(), BaycatError> {
        if self.selectors.is_empty() {
            return Err(BaycatError::VacuousManifest);
        }

        let mut fresh = Manifest::new(self.root.clone(), self.path.clone())?;
        fresh.pool_size = self.pool_size;
        fresh.selectors = self.selectors.clone();
        fresh.repopulate()?;
        if force_checksum {
            fresh.compute_missing_checksums()?;
        }

        let mut seen: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for (rel_path, fresh_entry) in fresh.entries {
            seen.insert(rel_path.clone());
            let replace = match self.entries.get(&rel_path) {
                Some(old) => fresh_entry.changed_from(old),
                None => true,
            };
            if replace {
                self.entries.insert(rel_path, fresh_entry);
            }
        }
        self.entries.retain(|rel_path, _| seen.contains(rel_path));

        self.compute_missing_checksums()
    }

    /// Rebuild an object-store manifest's file entries from a bucket
    /// listing, page by page. Keys under the reserved prefix are skipped.
    /// A listed object consistent with the recorded entry (same size and
    /// digest) keeps the richer recorded entry; anything else is adopted
    /// from the listing, which is how partial prior uploads get picked up.
    pub fn update_from_store(&mut self, store: &dyn ObjectStore) -> Result<(), BaycatError> {
        let (bucket, prefix) = {
            let (b, p) = self.store_root()?;
            (b.to_string(), p.to_string())
        };

        let mut token: Option<String> = None;
        loop {
            let page = store.list_objects(&bucket, &prefix, token.as_deref())?;
            self.counters.list_calls += 1;

            for obj in &page.objects {
                let entry = Entry::from_listing(
                    &prefix,
                    &obj.key,
                    &obj.etag,
                    obj.size,
                    obj.last_modified,
                );
                if self.is_reserved_path(&entry.rel_path) {
                    log::debug!("skipping reserved key {}", obj.key);
                    continue;
                }
                let adopt = match self.entries.get(&entry.rel_path) {
                    Some(existing) => !existing.consistent_with_listing(&entry),
                    None => true,
                };
                if adopt {
                    self.entries.insert(entry.rel_path.clone(), entry);
                }
            }

            match page.next_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Serialize to `path`, the manifest's recorded location, or the
    /// canonical `<root>/.baycat/manifest`. Refuses to overwrite unless
    /// asked, and refuses to save a manifest that has no selectors.
    pub fn save(&self, path: Option<&Path>, overwrite: bool) -> Result<PathBuf, BaycatError> {
        if self.selectors.is_empty() {
            return Err(BaycatError::VacuousManifest);
        }
        let target = match path {
            Some(p) => p.to_path_buf(),
            None => match &self.path {
                Some(p) => p.clone(),
                None => Manifest::default_local_path(self.local_root()?),
            },
        };

        if target.exists() && !overwrite {
            return Err(BaycatError::ManifestAlreadyExists(target));
        }

        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)?;

        // Write to an owned temp file in the same directory, then rename
        // into place, so a torn write never clobbers the previous manifest.
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        serde_json::to_writer(&mut tmp, self)?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| BaycatError::Io(e.error))?;
        Ok(target)
    }

    /// Parse a previously saved manifest for `root`. Selectors recorded
    /// against the old root location are rebased onto the new one.
    pub fn load(root: &Path, path: Option<&Path>) -> Result<Manifest, BaycatError> {
        let target = match path {
            Some(p) => p.to_path_buf(),
            None => Manifest::default_local_path(root),
        };
        let data = std::fs::read_to_string(&target)?;
        let mut m: Manifest = serde_json::from_str(&data)?;

        let old_root = match &m.root {
            Some(ManifestRoot::Local(p)) => Some(p.clone()),
            _ => None,
        };
        for sel in &mut m.selectors {
            if Some(sel.rootpath()) == old_root.as_deref() {
                *sel = Selector::path(root);
            }
        }
        m.root = Some(ManifestRoot::Local(root.to_path_buf()));
        m.path = Some(target);
        Ok(m)
    }

    /// Upload this manifest to its reserved key. Store saves always
    /// overwrite; there is no cheap existence probe worth the round trip.
    pub fn save_to_store(&self, store: &dyn ObjectStore) -> Result<(), BaycatError> {
        let (bucket, prefix) = self.store_root()?;
        let key = Manifest::store_manifest_key(prefix);
        let data = serde_json::to_vec(self)?;
        store.upload_bytes(&data, bucket, &key)?;
        Ok(())
    }

    /// Download and parse the manifest stored under `prefix`. A 404
    /// propagates; callers turn it into a fresh empty manifest.
    pub fn load_from_store(
        store: &dyn ObjectStore,
        bucket: &str,
        prefix: &str,
    ) -> Result<Manifest, BaycatError> {
        let key = Manifest::store_manifest_key(prefix);
        let tmp = tempfile::NamedTempFile::new()?;
        store.download_file(bucket, &key, tmp.path())?;
        let data = std::fs::read_to_string(tmp.path())?;
        let mut m: Manifest = serde_json::from_str(&data)?;
        m.root = Some(ManifestRoot::Store {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        });
        Ok(m)
    }

    // -----------------------------------------------------------------------
    // Transfer bookkeeping
    // -----------------------------------------------------------------------

    /// Reflect a completed content transfer of `rel_path` from `src_entry`.
    pub fn mark_transferred(&mut self, rel_path: &str, src_entry: &Entry) {
        let origin = self.origin();
        self.entries
            .entry(rel_path.to_string())
            .or_insert_with(|| src_entry.with_origin(origin))
            .mark_contents_transferred(src_entry);
    }

    /// Reflect a completed metadata transfer of `rel_path` from `src_entry`.
    pub fn mark_metadata(&mut self, rel_path: &str, src_entry: &Entry) {
        let origin = self.origin();
        self.entries
            .entry(rel_path.to_string())
            .or_insert_with(|| src_entry.with_origin(origin))
            .mark_metadata_transferred(src_entry);
    }

    /// Reflect a completed removal of `rel_path`.
    pub fn mark_deleted(&mut self, rel_path: &str) {
        self.entries.remove(rel_path);
    }

    /// Reflect a completed directory creation as a value copy of the source
    /// entry; the directory's metadata is replayed separately.
    pub fn mark_mkdir(&mut self, rel_path: &str, src_entry: &Entry) {
        let origin = self.origin();
        self.entries
            .insert(rel_path.to_string(), src_entry.with_origin(origin));
    }

    /// Total recorded size of all file entries.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| !e.is_dir)
            .map(|e| e.size)
            .sum()
    }

    pub fn file_count(&self) -> usize {
        self.entries.values().filter(|e| !e.is_dir).count()
    }
}

// ---------------------------------------------------------------------------
// Serialized form
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone)]
#[serde(tag = "_json_classname")]
enum ManifestRepr {
    Manifest {
        path: Option<String>,
        root: Option<String>,
        entries: BTreeMap<String, Entry>,
        selectors: Vec<Selector>,
    },
    ObjectStoreManifest {
        path: Option<String>,
        bucket: String,
        prefix: String,
        entries: BTreeMap<String, Entry>,
        selectors: Vec<Selector>,
    },
}

impl From<Manifest> for ManifestRepr {
    fn from(m: Manifest) -> ManifestRepr {
        let path = m.path.map(|p| p.to_string_lossy().into_owned());
        match m.root {
            Some(ManifestRoot::Store { bucket, prefix }) => ManifestRepr::ObjectStoreManifest {
                path,
                bucket,
                prefix,
                entries: m.entries,
                selectors: m.selectors,
            },
            root => ManifestRepr::Manifest {
                path,
                root: match root {
                    Some(ManifestRoot::Local(p)) => Some(p.to_string_lossy().into_owned()),
                    _ => None,
                },
                entries: m.entries,
                selectors: m.selectors,
            },
        }
    }
}

impl From<ManifestRepr> for Manifest {
    fn from(repr: ManifestRepr) -> Manifest {
        let (path, root, entries, selectors) = match repr {
            ManifestRepr::Manifest {
                path,
                root,
                entries,
                selectors,
            } => (path, root.map(|r| ManifestRoot::Local(PathBuf::from(r))), entries, selectors),
            ManifestRepr::ObjectStoreManifest {
                path,
                bucket,
                prefix,
                entries,
                selectors,
            } => (
                path,
                Some(ManifestRoot::Store { bucket, prefix }),
                entries,
                selectors,
            ),
        };
        Manifest {
            root,
            path: path.map(PathBuf::from),
            entries,
            selectors,
            pool_size: 0,
            counters: Counters::default(),
        }
    }
}
