use crate::region::{DetectedRegion, Point, Quad};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDiag {
    pub python_exe: String,
    pub python_version: String,
    pub easyocr_version: Option<String>,
    pub gpu_available: Option<bool>,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// First line sent to a freshly spawned worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHello {
    pub languages: Vec<String>,
    pub gpu: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReady {
    pub ok: bool,
    #[serde(default)]
    pub engine_version: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub image_png_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub regions: Vec<WireRegion>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One region as the engine reports it: corners as floats in
/// tl, tr, br, bl order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRegion {
    pub quad: [[f64; 2]; 4],
    #[serde(default)]
    pub text: Option<String>,
    pub confidence: f64,
}

impl WireRegion {
    /// Truncates coordinates toward zero and rescales the score from
    /// `0..=scale` onto `0..=1`.
    pub fn into_region(self, confidence_scale: f64) -> DetectedRegion {
        let pt = |p: [f64; 2]| Point::new(p[0] as i32, p[1] as i32);
        let [tl, tr, br, bl] = self.quad;
        let scale = if confidence_scale > 0.0 { confidence_scale } else { 1.0 };
        let confidence = (self.confidence / scale).clamp(0.0, 1.0) as f32;
        DetectedRegion {
            quad: Quad {
                top_left: pt(tl),
                top_right: pt(tr),
                bottom_right: pt(br),
                bottom_left: pt(bl),
            },
            confidence,
            text: self.text,
        }
    }
}
