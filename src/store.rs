use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::checksum::md5_hex;

/// Listings page at most this many keys before handing back a token.
const LIST_PAGE_SIZE: usize = 1000;

/// A store-side failure, distinguishable by HTTP-style code where the
/// transport supplies one.
#[derive(Debug, Error)]
#[error("store error{}: {message}", .code.map(|c| format!(" ({c})")).unwrap_or_default())]
pub struct StoreError {
    pub code: Option<u16>,
    pub message: String,
}

impl StoreError {
    pub fn new(code: Option<u16>, message: impl Into<String>) -> StoreError {
        StoreError {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> StoreError {
        StoreError::new(Some(404), what)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == Some(404)
    }

    fn io(context: &str, e: std::io::Error) -> StoreError {
        StoreError::new(None, format!("{context}: {e}"))
    }
}

/// One record from a bucket listing.
#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// One page of listing results; `next_token` continues the walk.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<ObjectSummary>,
    pub next_token: Option<String>,
}

/// The narrow interface the sync machinery consumes from an object-store
/// transport. Production backends (real S3 and friends) implement this
/// outside the crate; `MemoryStore` below backs the tests and the CLI
/// default.
pub trait ObjectStore {
    fn upload_file(&self, local: &Path, bucket: &str, key: &str) -> Result<(), StoreError>;
    fn upload_bytes(&self, data: &[u8], bucket: &str, key: &str) -> Result<(), StoreError>;
    fn download_file(&self, bucket: &str, key: &str, local: &Path) -> Result<(), StoreError>;
    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<&str>,
    ) -> Result<ObjectPage, StoreError>;
}

/// Join key segments with `/`, squeezing doubled separators but never
/// discarding a segment. An empty prefix must not swallow the rest.
pub fn key_join(prefix: &str, rel: &str) -> String {
    let mut joined = format!("{prefix}/{rel}");
    while joined.contains("//") {
        joined = joined.replace("//", "/");
    }
    if prefix.starts_with('/') {
        joined
    } else {
        joined.trim_start_matches('/').to_string()
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

struct StoredObject {
    data: Vec<u8>,
    etag: String,
    last_modified: DateTime<Utc>,
}

/// A bucket-per-map object store held entirely in memory. Computes real MD5
/// ETags and paginates listings, so it exercises the same code paths a live
/// transport would. Uploads create buckets implicitly; reads from a bucket
/// that was never written 404.
#[derive(Default)]
pub struct MemoryStore {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, StoredObject>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.lock().entry(bucket.to_string()).or_default();
    }

    fn put(&self, bucket: &str, key: &str, data: Vec<u8>) {
        // Stores record whole seconds only.
        let now = Utc
            .timestamp_opt(Utc::now().timestamp(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        let obj = StoredObject {
            etag: md5_hex(&data),
            data,
            last_modified: now,
        };
        self.lock()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), obj);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, StoredObject>>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ObjectStore for MemoryStore {
    fn upload_file(&self, local: &Path, bucket: &str, key: &str) -> Result<(), StoreError> {
        let data = std::fs::read(local)
            .map_err(|e| StoreError::io(&format!("reading {}", local.display()), e))?;
        self.put(bucket, key, data);
        Ok(())
    }

    fn upload_bytes(&self, data: &[u8], bucket: &str, key: &str) -> Result<(), StoreError> {
        self.put(bucket, key, data.to_vec());
        Ok(())
    }

    fn download_file(&self, bucket: &str, key: &str, local: &Path) -> Result<(), StoreError> {
        let buckets = self.lock();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StoreError::not_found(format!("no such bucket: {bucket}")))?;
        let obj = objects
            .get(key)
            .ok_or_else(|| StoreError::not_found(format!("no such key: {bucket}/{key}")))?;
        std::fs::write(local, &obj.data)
            .map_err(|e| StoreError::io(&format!("writing {}", local.display()), e))
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<&str>,
    ) -> Result<ObjectPage, StoreError> {
        let buckets = self.lock();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StoreError::not_found(format!("no such bucket: {bucket}")))?;

        let mut page = ObjectPage::default();
        let mut remaining = objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .skip_while(|(k, _)| token.is_some_and(|t| k.as_str() <= t));
        for (key, obj) in remaining.by_ref().take(LIST_PAGE_SIZE) {
            page.objects.push(ObjectSummary {
                key: key.clone(),
                etag: format!("\"{}\"", obj.etag),
                size: obj.data.len() as u64,
                last_modified: obj.last_modified,
            });
        }
        if remaining.next().is_some() {
            page.next_token = page.objects.last().map(|o| o.key.clone());
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_join_never_collapses_empty_prefix() {
        assert_eq!(key_join("", "a/b"), "a/b");
        assert_eq!(key_join("pre", "a/b"), "pre/a/b");
        assert_eq!(key_join("pre/", "a/b"), "pre/a/b");
        assert_eq!(key_join("/oh/no/", "a"), "/oh/no/a");
    }

    #[test]
    fn upload_then_download_round_trips() {
        let store = MemoryStore::new();
        store.upload_bytes(b"hello", "bkt", "k/one").unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        store.download_file("bkt", "k/one", &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"hello");
    }

    #[test]
    fn download_missing_is_404() {
        let store = MemoryStore::new();
        store.create_bucket("bkt");
        let tmp = tempfile::tempdir().unwrap();
        let err = store
            .download_file("bkt", "nope", &tmp.path().join("x"))
            .unwrap_err();
        assert!(err.is_not_found());

        let err = store
            .download_file("nobucket", "nope", &tmp.path().join("x"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_missing_bucket_is_404() {
        let store = MemoryStore::new();
        assert!(store
            .list_objects("yourmom", "", None)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn listing_filters_by_prefix_and_reports_etags() {
        let store = MemoryStore::new();
        store.upload_bytes(b"one", "bkt", "p/a").unwrap();
        store.upload_bytes(b"two", "bkt", "p/b").unwrap();
        store.upload_bytes(b"out", "bkt", "q/c").unwrap();

        let page = store.list_objects("bkt", "p/", None).unwrap();
        assert_eq!(page.next_token, None);
        let keys: Vec<&str> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["p/a", "p/b"]);
        assert_eq!(page.objects[0].etag, format!("\"{}\"", md5_hex(b"one")));
    }

    #[test]
    fn listing_paginates_with_continuation_tokens() {
        let store = MemoryStore::new();
        for i in 0..2300 {
            store
                .upload_bytes(b"x", "bkt", &format!("k/{i:05}"))
                .unwrap();
        }

        let mut seen = 0;
        let mut pages = 0;
        let mut token: Option<String> = None;
        loop {
            let page = store
                .list_objects("bkt", "k/", token.as_deref())
                .unwrap();
            seen += page.objects.len();
            pages += 1;
            match page.next_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        assert_eq!(seen, 2300);
        assert_eq!(pages, 3);
    }
}
