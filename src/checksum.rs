use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use rayon::prelude::*;

/// Digest reads happen in fixed chunks so large files never land in memory.
const CHUNK_SIZE: usize = 32 * 1024;

/// One pending digest computation, carrying the key to merge the result
/// back under once the pool drains.
#[derive(Debug, Clone)]
pub struct ChecksumTask {
    pub rel_path: String,
    pub abs_path: PathBuf,
}

/// Compute the MD5 hex digest of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Compute the MD5 hex digest of the file at `path`, reading in 32 KiB
/// chunks.
pub fn md5_file(path: &Path) -> io::Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Digest every task, fanning out over `pool_size` workers.
///
/// `pool_size == 1` stays on the calling thread; `0` means "use the default
/// pool width". Workers share nothing but their read-only task and return by
/// value, so results arrive in completion order; each carries its `rel_path`
/// for the merge.
pub fn compute_many(
    tasks: Vec<ChecksumTask>,
    pool_size: usize,
) -> Vec<(String, io::Result<String>)> {
    if pool_size == 1 {
        return tasks
            .into_iter()
            .map(|t| (t.rel_path, md5_file(&t.abs_path)))
            .collect();
    }

    let run = || {
        tasks
            .par_iter()
            .map(|t| (t.rel_path.clone(), md5_file(&t.abs_path)))
            .collect()
    };

    if pool_size == 0 {
        return run();
    }

    match rayon::ThreadPoolBuilder::new().num_threads(pool_size).build() {
        Ok(pool) => pool.install(run),
        Err(e) => {
            log::warn!("checksum pool unavailable ({e}), digesting sequentially");
            tasks
                .into_iter()
                .map(|t| (t.rel_path, md5_file(&t.abs_path)))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_known_values() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            md5_hex("contents of afile".as_bytes()),
            "79c36f925735a81867048aa3c3a87b93"
        );
        assert_eq!(
            md5_hex("more contents".as_bytes()),
            "fc94a20a012e5014fc2ea79b4efcb97f"
        );
    }

    #[test]
    fn file_digest_matches_buffer_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"some content").unwrap();
        assert_eq!(md5_file(&path).unwrap(), md5_hex(b"some content"));
    }

    #[test]
    fn pool_and_sequential_agree() {
        let dir = tempfile::tempdir().unwrap();
        let mut tasks = Vec::new();
        for i in 0..20 {
            let path = dir.path().join(format!("f{i}"));
            std::fs::write(&path, format!("data {i}")).unwrap();
            tasks.push(ChecksumTask {
                rel_path: format!("f{i}"),
                abs_path: path,
            });
        }

        let mut seq: Vec<_> = compute_many(tasks.clone(), 1)
            .into_iter()
            .map(|(p, r)| (p, r.unwrap()))
            .collect();
        let mut par: Vec<_> = compute_many(tasks, 4)
            .into_iter()
            .map(|(p, r)| (p, r.unwrap()))
            .collect();
        seq.sort();
        par.sort();
        assert_eq!(seq, par);
    }

    #[test]
    fn missing_file_reports_error() {
        let got = compute_many(
            vec![ChecksumTask {
                rel_path: "gone".into(),
                abs_path: PathBuf::from("/does/not/exist"),
            }],
            1,
        );
        assert!(got[0].1.is_err());
    }
}
