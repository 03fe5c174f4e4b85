use super::{EntryNamer, ResultSink};
use crate::{config::Archive, error::PackageError, processor::ItemResult};
use std::io::{Cursor, Seek, Write};
use tracing::debug;
use zip::{write::SimpleFileOptions, CompressionMethod, DateTime, ZipWriter};

/// Streams results into a zip archive, one entry per item including
/// fallbacks.
pub struct ArchiveSink<W: Write + Seek> {
    zip: ZipWriter<W>,
    namer: EntryNamer,
    entries: Vec<String>,
}

impl<W: Write + Seek> ArchiveSink<W> {
    pub fn new(writer: W, opts: &Archive) -> Self {
        Self {
            zip: ZipWriter::new(writer),
            namer: EntryNamer::new(&opts.prefix, &opts.extension),
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    fn write_entry(&mut self, original_name: &str, bytes: &[u8]) -> Result<(), PackageError> {
        let entry = self.namer.name_for(original_name);
        // Fixed timestamp and permissions keep archives byte-identical
        // across runs.
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .unix_permissions(0o644);
        self.zip.start_file(entry.as_str(), options)?;
        self.zip.write_all(bytes)?;
        debug!("archive entry {} ({} bytes)", entry, bytes.len());
        self.entries.push(entry);
        Ok(())
    }

    pub fn finish(self) -> Result<W, PackageError> {
        if self.entries.is_empty() {
            return Err(PackageError::EmptyBatch);
        }
        Ok(self.zip.finish()?)
    }
}

impl<W: Write + Seek> ResultSink for ArchiveSink<W> {
    fn accept(&mut self, result: ItemResult) -> Result<(), PackageError> {
        self.write_entry(&result.name, &result.output)
    }
}

/// Packages already-produced results into an in-memory zip.
pub fn package_archive(results: &[ItemResult], opts: &Archive) -> Result<Vec<u8>, PackageError> {
    if results.is_empty() {
        return Err(PackageError::EmptyBatch);
    }
    let mut sink = ArchiveSink::new(Cursor::new(Vec::new()), opts);
    for r in results {
        sink.write_entry(&r.name, &r.output)?;
    }
    Ok(sink.finish()?.into_inner())
}
