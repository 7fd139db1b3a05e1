use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use super::ExtractionTree;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("Failed to write {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
}

/// Write every non-root entry below `dir`, using the entry's relative path.
///
/// Returns the number of files written. Entries with children still get their
/// own file; the children live in the sibling `_<name>.extracted` directory.
pub fn stage_tree(tree: &ExtractionTree, dir: &Path) -> Result<usize, StagingError> {
    fs::create_dir_all(dir)
        .map_err(|source| StagingError::CreateDir { path: dir.to_path_buf(), source })?;
    let mut written = 0;
    for entry in tree.entries().iter().skip(1) {
        let target = dir.join(&entry.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| StagingError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&target, entry.data())
            .map_err(|source| StagingError::Write { path: target.clone(), source })?;
        written += 1;
    }
    debug!(dir = %dir.display(), files = written, "staged extraction tree");
    Ok(written)
}
