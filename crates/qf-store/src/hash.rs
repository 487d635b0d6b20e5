//! Content digest of a calculation's input artifacts.

use std::fs;
use std::path::Path;

use qf_core::Artifacts;
use sha2::{Digest, Sha256};

use crate::StoreResult;

/// SHA-256 over every supplied artifact, in artifact order.
///
/// Directories contribute each file's relative path and bytes, visited in
/// sorted order so the digest does not depend on directory iteration order.
pub fn compute_input_digest(artifacts: &Artifacts) -> StoreResult<String> {
    let mut hasher = Sha256::new();

    for (kind, path) in artifacts.iter() {
        hasher.update(format!("{kind:?}").as_bytes());
        if kind.is_directory() {
            hash_dir(&mut hasher, path, path)?;
        } else {
            hasher.update(fs::read(path)?);
        }
    }

    let result = hasher.finalize();
    Ok(format!("{:x}", result))
}

fn hash_dir(hasher: &mut Sha256, root: &Path, dir: &Path) -> StoreResult<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            hash_dir(hasher, root, &path)?;
        } else {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update(fs::read(&path)?);
        }
    }
    Ok(())
}
