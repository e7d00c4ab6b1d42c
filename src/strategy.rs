use std::fs::File;
use std::path::{Path, PathBuf};

use crate::entry::Entry;
use crate::error::BaycatError;
use crate::manifest::{Manifest, ManifestRoot};
use crate::store::{key_join, ObjectStore};

/// Which way bytes moved, so the engine can bump the matching counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Local,
}

/// Outcome of a content transfer.
#[derive(Debug, Clone, Copy)]
pub struct Transferred {
    pub bytes: u64,
    pub direction: Direction,
}

/// The capability bundle the engine drives: the four primitive operations,
/// each addressed by root-relative path. Implementations do the I/O and
/// nothing else; all manifest bookkeeping stays in the engine.
pub trait TransferStrategy {
    fn remove(&self, rel_path: &str) -> Result<(), BaycatError>;
    fn mkdir(&self, rel_path: &str) -> Result<(), BaycatError>;
    fn transfer_content(&self, rel_path: &str) -> Result<Transferred, BaycatError>;
    fn transfer_metadata(&self, rel_path: &str) -> Result<(), BaycatError>;
}

/// Pick the strategy for an endpoint pair. Store-to-store has no local
/// mediator and is refused before any work happens.
pub fn strategy_for<'a>(
    src: &'a Manifest,
    dst: &'a Manifest,
    store: Option<&'a dyn ObjectStore>,
) -> Result<Box<dyn TransferStrategy + 'a>, BaycatError> {
    let need_store = || {
        store.ok_or_else(|| {
            BaycatError::InvalidArgument("no object-store backend configured".to_string())
        })
    };
    match (&src.root, &dst.root) {
        (Some(ManifestRoot::Local(_)), Some(ManifestRoot::Local(_))) => {
            Ok(Box::new(LocalToLocal::new(src, dst)?))
        }
        (Some(ManifestRoot::Local(_)), Some(ManifestRoot::Store { .. })) => {
            Ok(Box::new(LocalToStore::new(src, dst, need_store()?)?))
        }
        (Some(ManifestRoot::Store { .. }), Some(ManifestRoot::Local(_))) => {
            Ok(Box::new(StoreToLocal::new(src, dst, need_store()?)?))
        }
        (Some(ManifestRoot::Store { .. }), Some(ManifestRoot::Store { .. })) => {
            Err(BaycatError::InvalidArgument(
                "store-to-store sync is not supported".to_string(),
            ))
        }
        _ => Err(BaycatError::InvalidArgument(
            "both manifests need a root to sync".to_string(),
        )),
    }
}

fn src_entry<'m>(manifest: &'m Manifest, rel_path: &str) -> Result<&'m Entry, BaycatError> {
    manifest.entries.get(rel_path).ok_or_else(|| {
        BaycatError::InvalidArgument(format!("no source entry for {rel_path}"))
    })
}

/// Write `src_path`'s bytes to `dst_path` through an owned temp file in the
/// destination's own directory, so the final rename is atomic. Never
/// truncates in place.
fn copy_into_place(src_path: &Path, dst_path: &Path) -> Result<u64, BaycatError> {
    let parent = dst_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&parent)?;

    let mut reader = File::open(src_path)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    let bytes = std::io::copy(&mut reader, tmp.as_file_mut())?;
    tmp.persist(dst_path).map_err(|e| BaycatError::Io(e.error))?;
    Ok(bytes)
}

fn remove_local(dst_root: &Path, dst: &Manifest, rel_path: &str) -> Result<(), BaycatError> {
    let path = dst_root.join(rel_path);
    let is_dir = dst
        .entries
        .get(rel_path)
        .map(|e| e.is_dir)
        .unwrap_or_else(|| path.is_dir());
    log::debug!("rm {}", path.display());
    if is_dir {
        std::fs::remove_dir(&path)?;
    } else {
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// POSIX metadata restore
// ---------------------------------------------------------------------------

/// Apply `entry`'s recorded ownership, mode, and timestamps to `path`.
/// Unknown uid/gid fall back to the running process; an unknown mode is
/// left alone.
#[cfg(unix)]
fn apply_metadata(path: &Path, entry: &Entry) -> Result<(), BaycatError> {
    use nix::sys::stat::{fchmodat, FchmodatFlags, Mode};
    use nix::unistd::{chown, Gid, Uid};

    let uid = entry
        .metadata
        .uid
        .map(Uid::from_raw)
        .unwrap_or_else(nix::unistd::geteuid);
    let gid = entry
        .metadata
        .gid
        .map(Gid::from_raw)
        .unwrap_or_else(nix::unistd::getegid);
    chown(path, Some(uid), Some(gid)).map_err(nix_err)?;

    if let Some(mode) = entry.metadata.mode {
        fchmodat(
            None,
            path,
            Mode::from_bits_truncate(mode & 0o7777),
            FchmodatFlags::FollowSymlink,
        )
        .map_err(nix_err)?;
    }

    let (atime_ns, mtime_ns) = entry.utimes();
    set_times(path, atime_ns, mtime_ns)
}

#[cfg(unix)]
fn set_times(path: &Path, atime_ns: i64, mtime_ns: i64) -> Result<(), BaycatError> {
    use nix::sys::stat::{utimensat, UtimensatFlags};
    use nix::sys::time::TimeSpec;

    let ts = |ns: i64| TimeSpec::new(ns.div_euclid(1_000_000_000), ns.rem_euclid(1_000_000_000));
    utimensat(
        None,
        path,
        &ts(atime_ns),
        &ts(mtime_ns),
        UtimensatFlags::NoFollowSymlink,
    )
    .map_err(nix_err)
}

#[cfg(unix)]
fn nix_err(e: nix::Error) -> BaycatError {
    BaycatError::Io(std::io::Error::from_raw_os_error(e as i32))
}

#[cfg(not(unix))]
fn apply_metadata(_path: &Path, _entry: &Entry) -> Result<(), BaycatError> {
    Ok(())
}

#[cfg(not(unix))]
fn set_times(_path: &Path, _atime_ns: i64, _mtime_ns: i64) -> Result<(), BaycatError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Local -> Local
// ---------------------------------------------------------------------------

pub struct LocalToLocal<'a> {
    src: &'a Manifest,
    dst: &'a Manifest,
    src_root: PathBuf,
    dst_root: PathBuf,
}

impl<'a> LocalToLocal<'a> {
    pub fn new(src: &'a Manifest, dst: &'a Manifest) -> Result<LocalToLocal<'a>, BaycatError> {
        Ok(LocalToLocal {
            src,
            dst,
            src_root: src.local_root()?.to_path_buf(),
            dst_root: dst.local_root()?.to_path_buf(),
        })
    }
}

impl TransferStrategy for LocalToLocal<'_> {
    fn remove(&self, rel_path: &str) -> Result<(), BaycatError> {
        remove_local(&self.dst_root, self.dst, rel_path)
    }

    fn mkdir(&self, rel_path: &str) -> Result<(), BaycatError> {
        std::fs::create_dir_all(self.dst_root.join(rel_path))?;
        Ok(())
    }

    fn transfer_content(&self, rel_path: &str) -> Result<Transferred, BaycatError> {
        let entry = src_entry(self.src, rel_path)?;
        let src_path = self.src_root.join(rel_path);
        let dst_path = self.dst_root.join(rel_path);
        log::debug!("cp {} {}", src_path.display(), dst_path.display());

        let bytes = copy_into_place(&src_path, &dst_path)?;
        let (atime_ns, mtime_ns) = entry.utimes();
        set_times(&dst_path, atime_ns, mtime_ns)?;
        Ok(Transferred {
            bytes,
            direction: Direction::Local,
        })
    }

    fn transfer_metadata(&self, rel_path: &str) -> Result<(), BaycatError> {
        let entry = src_entry(self.src, rel_path)?;
        let dst_path = if rel_path.is_empty() {
            self.dst_root.clone()
        } else {
            self.dst_root.join(rel_path)
        };
        log::debug!("metadata {} -> {}", rel_path, dst_path.display());
        apply_metadata(&dst_path, entry)
    }
}

// ---------------------------------------------------------------------------
// Local -> Store
// ---------------------------------------------------------------------------

pub struct LocalToStore<'a> {
    src: &'a Manifest,
    store: &'a dyn ObjectStore,
    src_root: PathBuf,
    bucket: String,
    prefix: String,
}

impl<'a> LocalToStore<'a> {
    pub fn new(
        src: &'a Manifest,
        dst: &'a Manifest,
        store: &'a dyn ObjectStore,
    ) -> Result<LocalToStore<'a>, BaycatError> {
        let (bucket, prefix) = dst.store_root()?;
        Ok(LocalToStore {
            src,
            store,
            src_root: src.local_root()?.to_path_buf(),
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        })
    }
}

impl TransferStrategy for LocalToStore<'_> {
    fn remove(&self, rel_path: &str) -> Result<(), BaycatError> {
        // Object deletion is deliberately unsupported; repeated runs keep
        // planning the same delete and keep skipping it.
        log::warn!("object deletion is not supported, leaving {rel_path} in the store");
        Ok(())
    }

    fn mkdir(&self, _rel_path: &str) -> Result<(), BaycatError> {
        // The store has no directories; the manifest carries them.
        Ok(())
    }

    fn transfer_content(&self, rel_path: &str) -> Result<Transferred, BaycatError> {
        let entry = src_entry(self.src, rel_path)?;
        let src_path = self.src_root.join(rel_path);
        let key = key_join(&self.prefix, rel_path);
        log::debug!("put {} -> {}/{}", src_path.display(), self.bucket, key);

        self.store.upload_file(&src_path, &self.bucket, &key)?;
        Ok(Transferred {
            bytes: entry.size,
            direction: Direction::Up,
        })
    }

    fn transfer_metadata(&self, _rel_path: &str) -> Result<(), BaycatError> {
        // Store-side metadata lives in the manifest; the engine's xfer mark
        // records the source entry and persisting the manifest carries it.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store -> Local
// ---------------------------------------------------------------------------

pub struct StoreToLocal<'a> {
    src: &'a Manifest,
    dst: &'a Manifest,
    store: &'a dyn ObjectStore,
    bucket: String,
    prefix: String,
    dst_root: PathBuf,
}

impl<'a> StoreToLocal<'a> {
    pub fn new(
        src: &'a Manifest,
        dst: &'a Manifest,
        store: &'a dyn ObjectStore,
    ) -> Result<StoreToLocal<'a>, BaycatError> {
        let (bucket, prefix) = src.store_root()?;
        Ok(StoreToLocal {
            src,
            dst,
            store,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            dst_root: dst.local_root()?.to_path_buf(),
        })
    }
}

impl TransferStrategy for StoreToLocal<'_> {
    fn remove(&self, rel_path: &str) -> Result<(), BaycatError> {
        remove_local(&self.dst_root, self.dst, rel_path)
    }

    fn mkdir(&self, rel_path: &str) -> Result<(), BaycatError> {
        std::fs::create_dir_all(self.dst_root.join(rel_path))?;
        Ok(())
    }

    fn transfer_content(&self, rel_path: &str) -> Result<Transferred, BaycatError> {
        let entry = src_entry(self.src, rel_path)?;
        let key = key_join(&self.prefix, rel_path);
        let dst_path = self.dst_root.join(rel_path);
        log::debug!("get {}/{} -> {}", self.bucket, key, dst_path.display());

        let parent = dst_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)?;

        // Download into an owned temp file on the destination filesystem,
        // then rename into place.
        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        self.store.download_file(&self.bucket, &key, tmp.path())?;
        tmp.persist(&dst_path).map_err(|e| BaycatError::Io(e.error))?;

        let (atime_ns, mtime_ns) = entry.utimes();
        set_times(&dst_path, atime_ns, mtime_ns)?;
        Ok(Transferred {
            bytes: entry.size,
            direction: Direction::Down,
        })
    }

    fn transfer_metadata(&self, rel_path: &str) -> Result<(), BaycatError> {
        let entry = src_entry(self.src, rel_path)?;
        let dst_path = if rel_path.is_empty() {
            self.dst_root.clone()
        } else {
            self.dst_root.join(rel_path)
        };
        apply_metadata(&dst_path, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Selector;
    use std::fs;

    fn manifest_of(root: &Path) -> Manifest {
        let mut m = Manifest::for_local(root);
        m.add_selector(Selector::path(root), false).unwrap();
        m
    }

    #[test]
    fn store_to_store_is_refused() {
        let a = Manifest::for_store("b1", "p");
        let b = Manifest::for_store("b2", "q");
        let got = strategy_for(&a, &b, None);
        assert!(matches!(got, Err(BaycatError::InvalidArgument(_))));
    }

    #[test]
    fn store_pairings_require_a_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let local = manifest_of(tmp.path());
        let remote = Manifest::for_store("bkt", "p");
        assert!(strategy_for(&local, &remote, None).is_err());
        assert!(strategy_for(&local, &local, None).is_ok());
    }

    #[test]
    fn copy_into_place_replaces_atomically_and_never_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("nested/dst");
        fs::write(&src, "payload").unwrap();
        fs::create_dir_all(dst.parent().unwrap()).unwrap();
        fs::write(&dst, "old").unwrap();

        let bytes = copy_into_place(&src, &dst).unwrap();
        assert_eq!(bytes, 7);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "payload");

        // No temp litter left next to the destination.
        let names: Vec<_> = fs::read_dir(dst.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn apply_metadata_restores_mode_and_times() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::write(&src, "x").unwrap();
        fs::write(&dst, "x").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o640)).unwrap();

        let entry = Entry::from_local(tmp.path(), "src").unwrap();
        apply_metadata(&dst, &entry).unwrap();

        let meta = fs::symlink_metadata(&dst).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
        let restored = Entry::from_local(tmp.path(), "dst").unwrap();
        assert_eq!(restored.mtime_ns, entry.mtime_ns);
    }

    #[cfg(unix)]
    #[test]
    fn store_to_local_falls_back_to_process_ownership() {
        use crate::store::MemoryStore;

        let tmp = tempfile::tempdir().unwrap();
        let dst_root = tmp.path().join("dst");
        fs::create_dir_all(&dst_root).unwrap();

        let store = MemoryStore::new();
        store.upload_bytes(b"remote data", "bkt", "pre/f").unwrap();

        let mut src = Manifest::for_store("bkt", "pre");
        src.update_from_store(&store).unwrap();
        let dst = manifest_of(&dst_root);

        let strategy = StoreToLocal::new(&src, &dst, &store).unwrap();
        strategy.transfer_content("f").unwrap();
        strategy.transfer_metadata("f").unwrap();

        let restored = Entry::from_local(&dst_root, "f").unwrap();
        assert_eq!(restored.metadata.uid.unwrap(), nix::unistd::geteuid().as_raw());
        assert_eq!(fs::read_to_string(dst_root.join("f")).unwrap(), "remote data");
        // Listing mtimes are whole seconds; the restored file matches them.
        assert_eq!(restored.mtime_ns, src.entries["f"].mtime_ns);
    }

    #[test]
    fn local_to_store_remove_is_a_noop() {
        use crate::store::MemoryStore;

        let tmp = tempfile::tempdir().unwrap();
        let src = manifest_of(tmp.path());
        let dst = Manifest::for_store("bkt", "pre");
        let store = MemoryStore::new();
        store.upload_bytes(b"keep me", "bkt", "pre/f").unwrap();

        let strategy = LocalToStore::new(&src, &dst, &store).unwrap();
        strategy.remove("f").unwrap();

        let out = tmp.path().join("check");
        store.download_file("bkt", "pre/f", &out).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "keep me");
    }
}
