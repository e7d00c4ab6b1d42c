use std::path::Path;

use crate::error::BaycatError;
use crate::manifest::Manifest;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// `baycat manifest create ROOT`
pub fn create(
    root: &Path,
    manifest_path: Option<&Path>,
    pool_size: usize,
    skip_checksums: bool,
    overwrite: bool,
) -> Result<(), BaycatError> {
    let m = Manifest::for_path(root, manifest_path, pool_size, !skip_checksums)?;
    let saved = m.save(None, overwrite)?;
    println!(
        "Wrote manifest for {} ({} entries) to {}",
        root.display(),
        m.entries.len(),
        saved.display()
    );
    Ok(())
}

/// `baycat manifest update ROOT`
pub fn update(
    root: &Path,
    manifest_path: Option<&Path>,
    pool_size: Option<usize>,
    force_checksums: bool,
) -> Result<(), BaycatError> {
    let mut m = Manifest::load(root, manifest_path)?;
    if let Some(n) = pool_size {
        m.pool_size = n;
    }
    m.update(force_checksums)?;
    let saved = m.save(None, true)?;
    println!(
        "Updated manifest for {} ({} entries) at {}",
        root.display(),
        m.entries.len(),
        saved.display()
    );
    Ok(())
}

/// `baycat manifest estimate-cost ROOT`
///
/// Totals the tree from its manifest (building a digest-free one on the fly
/// when none is saved) and prices it against the given rates.
pub fn estimate_cost(
    root: &Path,
    storage_price_gb_month: f64,
    put_price_1k: f64,
) -> Result<(), BaycatError> {
    let m = match Manifest::load(root, None) {
        Ok(m) => m,
        Err(e) if e.is_not_found() => Manifest::for_path(root, None, 0, false)?,
        Err(e) => return Err(e),
    };

    let bytes = m.total_bytes();
    let files = m.file_count();
    let gib = bytes as f64 / GIB;
    let storage_monthly = gib * storage_price_gb_month;
    let upload_once = files as f64 / 1000.0 * put_price_1k;

    println!("{}: {} files, {} bytes ({:.3} GiB)", root.display(), files, bytes, gib);
    println!("  storage:  ${storage_monthly:.4}/month at ${storage_price_gb_month}/GB-month");
    println!("  uploads:  ${upload_once:.4} one-time at ${put_price_1k}/1k PUTs");
    Ok(())
}
