use std::path::PathBuf;

use crate::engine::{SyncEngine, SyncOptions};
use crate::error::BaycatError;
use crate::manifest::Manifest;
use crate::store::{MemoryStore, ObjectStore};
use crate::strategy;

/// Flags for `baycat sync`.
#[derive(Debug, Clone, Default)]
pub struct SyncArgs {
    pub dry_run: bool,
    pub verbose: bool,
    pub quiet: bool,
    pub print_counters: bool,
    pub pool_size: usize,
}

/// One side of a sync: a local directory or a `scheme://bucket/prefix` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    Store { bucket: String, prefix: String },
}

impl Endpoint {
    pub fn is_store(&self) -> bool {
        matches!(self, Endpoint::Store { .. })
    }
}

pub fn parse_endpoint(s: &str) -> Result<Endpoint, BaycatError> {
    let Some((scheme, rest)) = s.split_once("://") else {
        return Ok(Endpoint::Local(PathBuf::from(s)));
    };
    if scheme.is_empty() {
        return Err(BaycatError::InvalidArgument(format!(
            "malformed endpoint URI: {s}"
        )));
    }
    let (bucket, prefix) = match rest.split_once('/') {
        Some((bucket, prefix)) => (bucket.to_string(), prefix.to_string()),
        None => (rest.to_string(), String::new()),
    };
    if bucket.is_empty() {
        return Err(BaycatError::InvalidArgument(format!(
            "endpoint URI has no bucket: {s}"
        )));
    }
    Ok(Endpoint::Store { bucket, prefix })
}

/// What a finished (or dirty-finished) run looked like.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub success: bool,
    pub counters: crate::manifest::Counters,
    pub total_bytes: u64,
}

/// Run a sync with the built-in in-memory store backend. Real transports go
/// through `run_with_store`.
pub fn run(src: &str, dst: &str, args: &SyncArgs) -> Result<SyncReport, BaycatError> {
    let store = MemoryStore::new();
    for endpoint in [parse_endpoint(src)?, parse_endpoint(dst)?] {
        if let Endpoint::Store { bucket, .. } = endpoint {
            store.create_bucket(&bucket);
        }
    }
    run_with_store(src, dst, args, &store)
}

/// Sync `src` to `dst`, reporting whether every operation succeeded.
///
/// Input problems (store-to-store, a destination that is a plain file)
/// surface as errors before any I/O; per-transfer failures are absorbed by
/// the engine and reported through `success: false`.
pub fn run_with_store(
    src: &str,
    dst: &str,
    args: &SyncArgs,
    store: &dyn ObjectStore,
) -> Result<SyncReport, BaycatError> {
    let src_ep = parse_endpoint(src)?;
    let dst_ep = parse_endpoint(dst)?;
    log::debug!("syncing {src} -> {dst}");

    if src_ep.is_store() && dst_ep.is_store() {
        return Err(BaycatError::InvalidArgument(
            "store-to-store sync is not supported".to_string(),
        ));
    }

    if let Endpoint::Local(path) = &dst_ep {
        if path.exists() {
            if !path.is_dir() {
                return Err(BaycatError::DestinationNotADirectory(path.clone()));
            }
        } else if args.dry_run {
            return Err(BaycatError::InvalidArgument(format!(
                "destination {} does not exist, so there is nothing to dry-run against",
                path.display()
            )));
        } else {
            std::fs::create_dir_all(path)?;
        }
    }

    let mut m_src = load_or_create(&src_ep, args, store)?;
    let mut m_dst = load_or_create(&dst_ep, args, store)?;

    // Both manifests are refreshed so the diff works from current truth;
    // this is also what makes an interrupted run's re-run converge.
    refresh(&mut m_src, store)?;
    refresh(&mut m_dst, store)?;

    if !args.dry_run && !src_ep.is_store() {
        m_src.save(None, true)?;
    }

    let opts = SyncOptions {
        dry_run: args.dry_run,
        enable_delete: false,
        verbose: args.verbose,
        overwrite_regressed: false,
    };

    let strategy = strategy::strategy_for(&m_src, &m_dst, Some(store))?;
    let mut engine = SyncEngine::new(&m_src, &m_dst, opts);
    engine.sync(strategy.as_ref())?;
    drop(strategy);

    let success = engine.was_success();
    let xfer = engine.into_xfer();

    if !args.dry_run {
        match &dst_ep {
            Endpoint::Local(_) => {
                xfer.save(None, true)?;
            }
            Endpoint::Store { .. } => {
                xfer.save_to_store(store)?;
            }
        }
    }

    let report = SyncReport {
        success,
        total_bytes: xfer.total_bytes(),
        counters: xfer.counters.clone(),
    };

    if !args.quiet {
        let total = report.total_bytes;
        let bytes_up = report.counters.bytes_up;
        let speedup = total as f64 / (1 + bytes_up) as f64;
        println!("Uploaded {bytes_up} bytes against a repository of {total}, speedup {speedup:.3}");
    }
    if args.print_counters {
        println!("counters:");
        for (name, value) in report.counters.rows() {
            println!("  {name:<16} {value}");
        }
    }

    Ok(report)
}

fn load_or_create(
    endpoint: &Endpoint,
    args: &SyncArgs,
    store: &dyn ObjectStore,
) -> Result<Manifest, BaycatError> {
    match endpoint {
        Endpoint::Local(root) => match Manifest::load(root, None) {
            Ok(mut m) => {
                m.pool_size = args.pool_size;
                Ok(m)
            }
            Err(e) if e.is_not_found() => {
                log::debug!(
                    "no manifest under {}, building a fresh one",
                    root.display()
                );
                Manifest::for_path(root, None, args.pool_size, true)
            }
            Err(e) => Err(e),
        },
        Endpoint::Store { bucket, prefix } => {
            match Manifest::load_from_store(store, bucket, prefix) {
                Ok(m) => Ok(m),
                Err(e) if e.is_not_found() => {
                    log::debug!("no manifest at {bucket}/{prefix}, starting empty");
                    Ok(Manifest::for_store(bucket.clone(), prefix.clone()))
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn refresh(manifest: &mut Manifest, store: &dyn ObjectStore) -> Result<(), BaycatError> {
    if manifest.store_root().is_ok() {
        manifest.update_from_store(store)
    } else {
        manifest.update(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            parse_endpoint("/tmp/dir").unwrap(),
            Endpoint::Local(PathBuf::from("/tmp/dir"))
        );
        assert_eq!(
            parse_endpoint("s3://bucket/some/prefix").unwrap(),
            Endpoint::Store {
                bucket: "bucket".to_string(),
                prefix: "some/prefix".to_string(),
            }
        );
        assert_eq!(
            parse_endpoint("s3://bucket").unwrap(),
            Endpoint::Store {
                bucket: "bucket".to_string(),
                prefix: String::new(),
            }
        );
        assert!(parse_endpoint("s3://").is_err());
        assert!(parse_endpoint("://bucket/x").is_err());
    }

    #[test]
    fn store_to_store_is_refused_before_any_work() {
        let args = SyncArgs::default();
        let got = run("s3://one/a", "s3://two/b", &args);
        assert!(matches!(got, Err(BaycatError::InvalidArgument(_))));
    }

    #[test]
    fn destination_must_not_be_a_plain_file() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let dst = tmp.path().join("dst-file");
        std::fs::write(&dst, "i am a file").unwrap();

        let got = run(
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
            &SyncArgs::default(),
        );
        assert!(matches!(
            got,
            Err(BaycatError::DestinationNotADirectory(_))
        ));
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "i am a file");
    }

    #[test]
    fn dry_run_refuses_missing_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let dst = tmp.path().join("missing");

        let args = SyncArgs {
            dry_run: true,
            ..SyncArgs::default()
        };
        assert!(run(src.to_str().unwrap(), dst.to_str().unwrap(), &args).is_err());
        assert!(!dst.exists());
    }
}
