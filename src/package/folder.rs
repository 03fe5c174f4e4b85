use super::ResultSink;
use crate::{error::PackageError, processor::ItemResult};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Writes each result under its original file name into one directory.
pub struct FolderSink {
    dir: PathBuf,
    written: Vec<PathBuf>,
}

impl FolderSink {
    pub fn new(dir: &Path) -> Result<Self, PackageError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            written: Vec::new(),
        })
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl ResultSink for FolderSink {
    fn accept(&mut self, result: ItemResult) -> Result<(), PackageError> {
        // Never let a crafted name escape the output directory.
        let Some(file_name) = Path::new(&result.name).file_name() else {
            warn!("item {}: no usable file name in {:?}, not written", result.index, result.name);
            return Ok(());
        };
        if result.output.is_empty() {
            warn!("item {} {}: nothing to write", result.index, result.name);
            return Ok(());
        }
        let path = self.dir.join(file_name);
        std::fs::write(&path, &result.output)?;
        debug!("wrote {} ({} bytes)", path.display(), result.output.len());
        self.written.push(path);
        Ok(())
    }
}
