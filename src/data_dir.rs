use std::path::PathBuf;

use anyhow::Result;

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVELVOICE_DATA_DIR") {
        return Ok(PathBuf::from(p));
    }
    // Dev default: repo-root/tmp/novelvoice-data
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    Ok(root.join("tmp").join("novelvoice-data"))
}

pub fn backend_root() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVELVOICE_BACKEND_ROOT") {
        return Ok(PathBuf::from(p));
    }
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    Ok(root.join("backend"))
}
