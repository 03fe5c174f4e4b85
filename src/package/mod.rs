pub mod archive;
pub mod document;
pub mod folder;

use crate::{error::PackageError, processor::ItemResult};
use std::collections::HashSet;
use std::path::Path;
use unicode_normalization::UnicodeNormalization;

pub use archive::{package_archive, ArchiveSink};
pub use document::{build_document_from_dir, compose_document, ComposedDocument, DocumentBuilder};
pub use folder::FolderSink;

/// Receives item results in origin order as soon as they are final.
pub trait ResultSink {
    fn accept(&mut self, result: ItemResult) -> Result<(), PackageError>;
}

impl ResultSink for Vec<ItemResult> {
    fn accept(&mut self, result: ItemResult) -> Result<(), PackageError> {
        self.push(result);
        Ok(())
    }
}

/// Derives `<prefix>_<stem>.<ext>` entry names, suffixing `_2`, `_3`, ... when
/// two inputs share a stem so no entry overwrites another.
#[derive(Debug, Clone)]
pub struct EntryNamer {
    prefix: String,
    extension: String,
    used: HashSet<String>,
}

impl EntryNamer {
    pub fn new(prefix: &str, extension: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            extension: extension.trim_start_matches('.').to_string(),
            used: HashSet::new(),
        }
    }

    pub fn name_for(&mut self, original: &str) -> String {
        let stem = Path::new(original)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("image");
        let base = format!("{}_{}", self.prefix, sanitize_stem(stem));

        let mut candidate = format!("{base}.{}", self.extension);
        let mut n = 2;
        while self.used.contains(&candidate) {
            candidate = format!("{base}_{n}.{}", self.extension);
            n += 1;
        }
        self.used.insert(candidate.clone());
        candidate
    }
}

fn sanitize_stem(stem: &str) -> String {
    stem.nfc()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
