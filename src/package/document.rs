use crate::{error::PackageError, processor::decode, util::is_folder_image};
use image::RgbImage;
use lopdf::{
    content::{Content, Operation},
    dictionary, Document, Object, ObjectId, Stream,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Multi-page PDF with one full-bleed RGB image per page, one pixel per
/// point.
pub struct DocumentBuilder {
    doc: Document,
    pages_id: ObjectId,
    kids: Vec<Object>,
}

impl Default for DocumentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentBuilder {
    pub fn new() -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            kids: Vec::new(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.kids.len()
    }

    pub fn add_page(&mut self, image: &RgbImage) -> Result<(), PackageError> {
        let (w, h) = image.dimensions();
        let (w, h) = (i64::from(w), i64::from(h));

        let image_id = self.doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => Object::Integer(w),
                "Height" => Object::Integer(h),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => Object::Integer(8),
            },
            image.as_raw().clone(),
        ));

        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        Object::Integer(w),
                        Object::Integer(0),
                        Object::Integer(0),
                        Object::Integer(h),
                        Object::Integer(0),
                        Object::Integer(0),
                    ],
                ),
                Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let content_id = self
            .doc
            .add_object(Stream::new(dictionary! {}, content.encode()?));

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(w),
                Object::Integer(h),
            ],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        self.kids.push(page_id.into());
        Ok(())
    }

    pub fn finish(mut self) -> Result<Vec<u8>, PackageError> {
        if self.kids.is_empty() {
            return Err(PackageError::NoImages);
        }
        let count = self.kids.len() as i64;
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => self.kids,
            "Count" => Object::Integer(count),
        };
        self.doc.objects.insert(self.pages_id, Object::Dictionary(pages));
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);
        self.doc.compress();

        let mut out = Vec::new();
        self.doc.save_to(&mut out)?;
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct ComposedDocument {
    pub bytes: Vec<u8>,
    /// Names in page order.
    pub pages: Vec<String>,
    /// Candidates that did not decode and were left out.
    pub skipped: Vec<String>,
}

/// Sorts candidates by name and lays them out one per page. Candidates that
/// do not decode are dropped with a warning.
pub fn compose_document(
    mut candidates: Vec<(String, Vec<u8>)>,
) -> Result<ComposedDocument, PackageError> {
    if candidates.is_empty() {
        return Err(PackageError::NoImages);
    }
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    let mut builder = DocumentBuilder::new();
    let mut pages = Vec::new();
    let mut skipped = Vec::new();
    for (name, bytes) in candidates {
        match decode(&bytes) {
            Ok(img) => {
                builder.add_page(&img)?;
                pages.push(name);
            }
            Err(err) => {
                warn!("document: skipping {}: {}", name, err);
                skipped.push(name);
            }
        }
    }

    Ok(ComposedDocument {
        bytes: builder.finish()?,
        pages,
        skipped,
    })
}

/// Image files directly inside `dir`, sorted by file name.
pub fn list_folder_images(dir: &Path) -> Result<Vec<PathBuf>, PackageError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_folder_image(p))
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Assembles every image in `dir` into one PDF at `out`, reading and
/// decoding one file at a time.
pub fn build_document_from_dir(dir: &Path, out: &Path) -> Result<ComposedDocument, PackageError> {
    let files = list_folder_images(dir)?;
    if files.is_empty() {
        return Err(PackageError::NoImages);
    }

    let mut builder = DocumentBuilder::new();
    let mut pages = Vec::new();
    let mut skipped = Vec::new();
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let decoded = std::fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| decode(&bytes).map_err(|e| e.to_string()));
        match decoded {
            Ok(img) => {
                builder.add_page(&img)?;
                pages.push(name);
            }
            Err(err) => {
                warn!("document: skipping {}: {}", path.display(), err);
                skipped.push(name);
            }
        }
    }

    let bytes = builder.finish()?;
    std::fs::write(out, &bytes)?;
    info!(
        "document {} written: {} pages, {} skipped",
        out.display(),
        pages.len(),
        skipped.len()
    );
    Ok(ComposedDocument {
        bytes,
        pages,
        skipped,
    })
}
