pub mod python;
pub mod types;

use crate::{error::DetectionError, region::DetectedRegion};
use image::RgbImage;
use std::sync::Arc;

pub use python::PythonDetector;
pub use types::{EngineDiag, WireRegion, WorkerHello, WorkerReady, WorkerRequest, WorkerResponse};

/// Text-region detection over a decoded RGB buffer.
///
/// One instance serves every item of every batch, possibly from several
/// worker threads at once, so implementations must be reentrant or
/// serialize internally.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedRegion>, DetectionError>;
}

impl<D: Detector + ?Sized> Detector for Arc<D> {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedRegion>, DetectionError> {
        (**self).detect(image)
    }
}
