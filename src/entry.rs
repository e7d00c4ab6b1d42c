use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BaycatError;

/// File name reserved for directory placeholders in stores without a real
/// directory namespace. A user file with this name cannot be synced.
pub const DIR_PLACEHOLDER: &str = ".baycat_dir_metadata";

/// Default digest algorithm; matches the content digest object stores expose.
pub const DEFAULT_CKSUM_TYPE: &str = "MD5";

const NS_PER_SEC: i64 = 1_000_000_000;

/// Where an entry's fields came from. Store listings carry no POSIX metadata
/// and only second-resolution timestamps, which softens comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    Local,
    Store,
}

/// The POSIX metadata we restore on the far side. Every field may be absent
/// when the endpoint does not supply it; absent fields propagate as unknown
/// and are filled in from the running process at restore time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
    pub atime_ns: Option<i64>,
}

/// One path (file or directory) under a manifest root.
///
/// `rel_path` is root-relative, `/`-separated, with no leading or trailing
/// slash; the empty string is the root itself. Equality ignores `collected`,
/// atime, and everything about the absolute root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "EntryRepr", into = "EntryRepr")]
pub struct Entry {
    pub rel_path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime_ns: i64,
    pub cksum: Option<String>,
    pub cksum_type: String,
    pub metadata: EntryMetadata,
    pub origin: EntryOrigin,
    /// Wall clock time this entry was produced, for debugging only.
    pub collected: i64,
}

/// Per-field dirty flags between two entries for the same relative path.
#[derive(Debug, Clone, Default)]
pub struct EntryDelta {
    pub size: bool,
    pub mtime: bool,
    /// `None` when digest comparison was not requested.
    pub cksum: Option<bool>,
    pub uid: bool,
    pub gid: bool,
    pub mode: bool,
    /// The new side's mtime is strictly older than the old side's, beyond
    /// the comparison tolerance. A destination that is newer than its source
    /// was probably modified externally.
    pub regressed: bool,
}

impl EntryDelta {
    pub fn dirty(&self) -> bool {
        self.size
            || self.mtime
            || self.cksum.unwrap_or(false)
            || self.metadata_dirty()
    }

    pub fn metadata_dirty(&self) -> bool {
        self.uid || self.gid || self.mode
    }
}

impl Entry {
    /// Stat `rel_path` under `root` (symlinks not followed) and capture every
    /// field a local filesystem can supply.
    pub fn from_local(root: &Path, rel_path: &str) -> Result<Entry, BaycatError> {
        let abs = if rel_path.is_empty() {
            root.to_path_buf()
        } else {
            root.join(rel_path)
        };
        let meta = std::fs::symlink_metadata(&abs)?;
        let is_dir = meta.is_dir();

        if !is_dir {
            if let Some(name) = abs.file_name() {
                if name == DIR_PLACEHOLDER {
                    return Err(BaycatError::ReservedName(rel_path.to_string()));
                }
            }
        }

        Ok(Entry {
            rel_path: rel_path.to_string(),
            is_dir,
            size: if is_dir { 0 } else { meta.len() },
            mtime_ns: stat_times(&meta).1,
            cksum: None,
            cksum_type: DEFAULT_CKSUM_TYPE.to_string(),
            metadata: stat_metadata(&meta),
            origin: EntryOrigin::Local,
            collected: now_ns(),
        })
    }

    /// Build an entry from one object-store listing record. The ETag stands
    /// in for the MD5 digest, and `LastModified` only has second resolution,
    /// so it is truncated before scaling to nanoseconds.
    pub fn from_listing(
        prefix: &str,
        key: &str,
        etag: &str,
        size: u64,
        last_modified: chrono::DateTime<chrono::Utc>,
    ) -> Entry {
        let rel = key
            .strip_prefix(prefix)
            .unwrap_or(key)
            .trim_start_matches('/')
            .to_string();
        Entry {
            rel_path: rel,
            is_dir: false,
            size,
            mtime_ns: last_modified.timestamp() * NS_PER_SEC,
            cksum: Some(etag.trim_matches('"').to_string()),
            cksum_type: DEFAULT_CKSUM_TYPE.to_string(),
            metadata: EntryMetadata::default(),
            origin: EntryOrigin::Store,
            collected: now_ns(),
        }
    }

    /// Mtime drift below this threshold is considered equal. Object stores
    /// only record whole seconds.
    fn mtime_tolerance_ns(&self, other: &Entry) -> i64 {
        if self.origin == EntryOrigin::Store || other.origin == EntryOrigin::Store {
            NS_PER_SEC
        } else {
            0
        }
    }

    /// The `(atime_ns, mtime_ns)` pair to restore; atime falls back to mtime
    /// when the endpoint never recorded one.
    pub fn utimes(&self) -> (i64, i64) {
        (self.metadata.atime_ns.unwrap_or(self.mtime_ns), self.mtime_ns)
    }

    /// Compute which fields are dirty relative to `old`.
    ///
    /// Digest comparison only happens when `compare_checksums` is set, and
    /// then both sides must carry one.
    pub fn delta(&self, old: &Entry, compare_checksums: bool) -> Result<EntryDelta, BaycatError> {
        if self.rel_path != old.rel_path {
            return Err(BaycatError::PathMismatch(
                self.rel_path.clone(),
                old.rel_path.clone(),
            ));
        }
        if self.cksum_type != old.cksum_type {
            return Err(BaycatError::ChecksumKind(
                self.cksum_type.clone(),
                old.cksum_type.clone(),
            ));
        }

        let tolerance = self.mtime_tolerance_ns(old);
        let mut delta = EntryDelta {
            size: self.size != old.size,
            mtime: (self.mtime_ns - old.mtime_ns).abs() > tolerance,
            cksum: None,
            uid: self.metadata.uid != old.metadata.uid,
            gid: self.metadata.gid != old.metadata.gid,
            mode: self.metadata.mode != old.metadata.mode,
            regressed: old.mtime_ns - self.mtime_ns > tolerance,
        };

        if compare_checksums {
            match (&self.cksum, &old.cksum) {
                (Some(a), Some(b)) => delta.cksum = Some(a != b),
                _ => return Err(BaycatError::ChecksumMissing(self.rel_path.clone())),
            }
        }

        Ok(delta)
    }

    /// Quick change test used by `Manifest::update()`: size, mtime (with the
    /// endpoint tolerance), and every non-atime metadata field. Digests are
    /// compared only when both sides have one. Atime is never consulted.
    pub fn changed_from(&self, old: &Entry) -> bool {
        if self.size != old.size {
            return true;
        }
        if (self.mtime_ns - old.mtime_ns).abs() > self.mtime_tolerance_ns(old) {
            return true;
        }
        if self.metadata.uid != old.metadata.uid
            || self.metadata.gid != old.metadata.gid
            || self.metadata.mode != old.metadata.mode
        {
            return true;
        }
        if let (Some(a), Some(b)) = (&self.cksum, &old.cksum) {
            if a != b {
                return true;
            }
        }
        false
    }

    /// True when a store listing record describes the same content this
    /// entry already records. Listing mtimes track upload time and listings
    /// carry no POSIX metadata, so identity rests on size and digest.
    pub fn consistent_with_listing(&self, listed: &Entry) -> bool {
        if self.size != listed.size {
            return false;
        }
        match (&self.cksum, &listed.cksum) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Record a successful content transfer from `src` into this (xfer
    /// manifest) entry. The caller is responsible for the copies actually
    /// matching.
    pub fn mark_contents_transferred(&mut self, src: &Entry) {
        self.size = src.size;
        self.cksum = src.cksum.clone();
        self.cksum_type = src.cksum_type.clone();
        let (atime_ns, mtime_ns) = src.utimes();
        self.metadata.atime_ns = Some(atime_ns);
        self.mtime_ns = mtime_ns;
    }

    /// Record a successful metadata transfer from `src`.
    pub fn mark_metadata_transferred(&mut self, src: &Entry) {
        self.metadata.uid = src.metadata.uid;
        self.metadata.gid = src.metadata.gid;
        self.metadata.mode = src.metadata.mode;
        let (atime_ns, mtime_ns) = src.utimes();
        self.metadata.atime_ns = Some(atime_ns);
        self.mtime_ns = mtime_ns;
    }

    /// A value copy suitable for inserting into a manifest with the given
    /// origin (e.g. a local source entry recorded in a store-side manifest).
    pub fn with_origin(&self, origin: EntryOrigin) -> Entry {
        let mut copy = self.clone();
        copy.origin = origin;
        copy
    }
}

/// Equality ignores `collected`, atime, origin, and the absolute root.
impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.rel_path == other.rel_path
            && self.is_dir == other.is_dir
            && self.size == other.size
            && self.mtime_ns == other.mtime_ns
            && self.cksum == other.cksum
            && self.cksum_type == other.cksum_type
            && self.metadata.uid == other.metadata.uid
            && self.metadata.gid == other.metadata.gid
            && self.metadata.mode == other.metadata.mode
    }
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

#[cfg(unix)]
fn stat_times(meta: &std::fs::Metadata) -> (i64, i64) {
    use std::os::unix::fs::MetadataExt;
    (
        meta.atime() * NS_PER_SEC + meta.atime_nsec(),
        meta.mtime() * NS_PER_SEC + meta.mtime_nsec(),
    )
}

#[cfg(not(unix))]
fn stat_times(meta: &std::fs::Metadata) -> (i64, i64) {
    use std::time::UNIX_EPOCH;
    let to_ns = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    };
    (to_ns(meta.accessed()), to_ns(meta.modified()))
}

#[cfg(unix)]
fn stat_metadata(meta: &std::fs::Metadata) -> EntryMetadata {
    use std::os::unix::fs::MetadataExt;
    EntryMetadata {
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
        mode: Some(meta.mode()),
        atime_ns: Some(stat_times(meta).0),
    }
}

#[cfg(not(unix))]
fn stat_metadata(meta: &std::fs::Metadata) -> EntryMetadata {
    EntryMetadata {
        uid: None,
        gid: None,
        mode: None,
        atime_ns: Some(stat_times(meta).0),
    }
}

// ---------------------------------------------------------------------------
// Serialized form
// ---------------------------------------------------------------------------

// The persisted document is self-describing: every object carries its class
// under `_json_classname`, and unknown tags fail the decode.

#[derive(Serialize, Deserialize, Clone)]
struct EntryDoc {
    rel_path: String,
    is_dir: bool,
    size: u64,
    mtime_ns: i64,
    cksum: Option<String>,
    cksum_type: String,
    metadata: EntryMetadata,
    collected: i64,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(tag = "_json_classname")]
enum EntryRepr {
    Entry(EntryDoc),
    ObjectStoreEntry(EntryDoc),
}

impl From<Entry> for EntryRepr {
    fn from(e: Entry) -> EntryRepr {
        let doc = EntryDoc {
            rel_path: e.rel_path,
            is_dir: e.is_dir,
            size: e.size,
            mtime_ns: e.mtime_ns,
            cksum: e.cksum,
            cksum_type: e.cksum_type,
            metadata: e.metadata,
            collected: e.collected,
        };
        match e.origin {
            EntryOrigin::Local => EntryRepr::Entry(doc),
            EntryOrigin::Store => EntryRepr::ObjectStoreEntry(doc),
        }
    }
}

impl From<EntryRepr> for Entry {
    fn from(repr: EntryRepr) -> Entry {
        let (doc, origin) = match repr {
            EntryRepr::Entry(doc) => (doc, EntryOrigin::Local),
            EntryRepr::ObjectStoreEntry(doc) => (doc, EntryOrigin::Store),
        };
        Entry {
            rel_path: doc.rel_path,
            is_dir: doc.is_dir,
            size: doc.size,
            mtime_ns: doc.mtime_ns,
            cksum: doc.cksum,
            cksum_type: doc.cksum_type,
            metadata: doc.metadata,
            origin,
            collected: doc.collected,
        }
    }
}
