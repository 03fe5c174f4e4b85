use crate::{
    engine::Detector,
    error::{DecodeError, EncodeError, ItemError},
    region::RedactionPolicy,
    transform::{apply_region, TransformOutcome},
};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOutcome {
    Redacted,
    Unchanged,
    FallbackOriginal,
}

impl std::fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemOutcome::Redacted => write!(f, "redacted"),
            ItemOutcome::Unchanged => write!(f, "unchanged"),
            ItemOutcome::FallbackOriginal => write!(f, "fallback_original"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ItemResult {
    pub index: usize,
    pub name: String,
    pub output: Vec<u8>,
    pub format: ImageFormat,
    pub outcome: ItemOutcome,
    pub error: Option<String>,
    pub regions_detected: usize,
    pub regions_applied: usize,
}

/// How processed pixels are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEncoding {
    Fixed(ImageFormat),
    /// Format implied by the item's own file extension, PNG when there is
    /// none.
    MatchName,
}

impl Default for OutputEncoding {
    fn default() -> Self {
        OutputEncoding::Fixed(ImageFormat::Png)
    }
}

impl OutputEncoding {
    pub fn format_for(&self, name: &str) -> ImageFormat {
        match self {
            OutputEncoding::Fixed(f) => *f,
            OutputEncoding::MatchName => {
                ImageFormat::from_path(name).unwrap_or(ImageFormat::Png)
            }
        }
    }
}

pub struct ItemProcessor<'a> {
    detector: &'a dyn Detector,
    policy: &'a RedactionPolicy,
    encoding: OutputEncoding,
}

struct Redaction {
    output: Vec<u8>,
    outcome: ItemOutcome,
    detected: usize,
    applied: usize,
}

impl<'a> ItemProcessor<'a> {
    pub fn new(
        detector: &'a dyn Detector,
        policy: &'a RedactionPolicy,
        encoding: OutputEncoding,
    ) -> Self {
        Self {
            detector,
            policy,
            encoding,
        }
    }

    /// Never fails: every error, panics in decoding or encoding included, is
    /// folded into a `FallbackOriginal` result.
    pub fn process(&self, index: usize, name: &str, raw: &[u8]) -> ItemResult {
        let format = self.encoding.format_for(name);
        isolate(index, name, raw, format, || self.run(index, name, raw, format))
    }

    /// Decode and re-encode without detection, as a `FallbackOriginal`
    /// carrying `reason`.
    pub fn passthrough(
        &self,
        index: usize,
        name: &str,
        raw: &[u8],
        reason: ItemError,
    ) -> ItemResult {
        let format = self.encoding.format_for(name);
        let description = reason.to_string();
        let kind = reason.kind();
        let restored = catch_unwind(AssertUnwindSafe(|| match decode(raw) {
            Ok(img) => fallback_decoded(index, name, raw, &img, format, reason),
            Err(_) => fallback_raw(index, name, raw, format, reason),
        }));
        restored.unwrap_or_else(|_| {
            fallback_raw_described(index, name, raw, format, kind, description)
        })
    }

    fn run(&self, index: usize, name: &str, raw: &[u8], format: ImageFormat) -> ItemResult {
        let original = match decode(raw) {
            Ok(img) => img,
            Err(err) => return fallback_raw(index, name, raw, format, err.into()),
        };

        let attempt = catch_unwind(AssertUnwindSafe(|| self.redact(&original, format)));
        let err = match attempt {
            Ok(Ok(r)) => {
                debug!(
                    "item {} {}: {} regions detected, {} applied",
                    index, name, r.detected, r.applied
                );
                return ItemResult {
                    index,
                    name: name.to_string(),
                    output: r.output,
                    format,
                    outcome: r.outcome,
                    error: None,
                    regions_detected: r.detected,
                    regions_applied: r.applied,
                };
            }
            Ok(Err(err)) => err,
            Err(panic) => ItemError::Panicked(panic_message(panic.as_ref())),
        };
        fallback_decoded(index, name, raw, &original, format, err)
    }

    fn redact(&self, original: &RgbImage, format: ImageFormat) -> Result<Redaction, ItemError> {
        let regions = self.detector.detect(original)?;
        if regions.is_empty() {
            return Ok(Redaction {
                output: encode(original, format)?,
                outcome: ItemOutcome::Unchanged,
                detected: 0,
                applied: 0,
            });
        }

        let mut working = original.clone();
        let mut applied = 0;
        for region in &regions {
            let outcome = apply_region(&mut working, region, self.policy)?;
            if let TransformOutcome::Applied(_) = outcome {
                applied += 1;
            }
        }

        Ok(Redaction {
            output: encode(&working, format)?,
            outcome: ItemOutcome::Redacted,
            detected: regions.len(),
            applied,
        })
    }
}

pub fn decode(raw: &[u8]) -> Result<RgbImage, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(image::load_from_memory(raw)?.to_rgb8())
}

pub fn encode(image: &RgbImage, format: ImageFormat) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), format)
        .map_err(|source| EncodeError {
            format: format!("{format:?}"),
            source,
        })?;
    Ok(out)
}

fn fallback_decoded(
    index: usize,
    name: &str,
    raw: &[u8],
    original: &RgbImage,
    format: ImageFormat,
    err: ItemError,
) -> ItemResult {
    match encode(original, format) {
        Ok(output) => {
            warn!("item {} {}: {} failure, keeping original: {}", index, name, err.kind(), err);
            ItemResult {
                index,
                name: name.to_string(),
                output,
                format,
                outcome: ItemOutcome::FallbackOriginal,
                error: Some(err.to_string()),
                regions_detected: 0,
                regions_applied: 0,
            }
        }
        Err(enc) => {
            let description = format!("{err}; re-encoding original also failed: {enc}");
            fallback_raw_described(index, name, raw, format, err.kind(), description)
        }
    }
}

/// Runs one item's whole pipeline so that a panic anywhere in it still
/// yields a result carrying the input bytes.
fn isolate(
    index: usize,
    name: &str,
    raw: &[u8],
    format: ImageFormat,
    stage: impl FnOnce() -> ItemResult,
) -> ItemResult {
    match catch_unwind(AssertUnwindSafe(stage)) {
        Ok(result) => result,
        Err(panic) => {
            let err = ItemError::Panicked(panic_message(panic.as_ref()));
            fallback_raw(index, name, raw, format, err)
        }
    }
}

fn fallback_raw(
    index: usize,
    name: &str,
    raw: &[u8],
    format: ImageFormat,
    err: ItemError,
) -> ItemResult {
    fallback_raw_described(index, name, raw, format, err.kind(), err.to_string())
}

// Undecodable payloads are carried through byte-for-byte.
fn fallback_raw_described(
    index: usize,
    name: &str,
    raw: &[u8],
    format: ImageFormat,
    kind: &str,
    description: String,
) -> ItemResult {
    warn!("item {} {}: {} failure, passing input through: {}", index, name, kind, description);
    ItemResult {
        index,
        name: name.to_string(),
        output: raw.to_vec(),
        format,
        outcome: ItemOutcome::FallbackOriginal,
        error: Some(description),
        regions_detected: 0,
        regions_applied: 0,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
