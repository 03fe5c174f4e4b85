use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Corners in the order the detector reports them. Not necessarily
/// axis-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quad {
    pub top_left: Point,
    pub top_right: Point,
    pub bottom_right: Point,
    pub bottom_left: Point,
}

impl Quad {
    /// Axis-aligned quad from two opposite corners.
    pub fn from_corners(top_left: Point, bottom_right: Point) -> Self {
        Self {
            top_left,
            top_right: Point::new(bottom_right.x, top_left.y),
            bottom_right,
            bottom_left: Point::new(top_left.x, bottom_right.y),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedRegion {
    pub quad: Quad,
    /// Normalized to 0..=1.
    pub confidence: f32,
    #[serde(default)]
    pub text: Option<String>,
}

impl DetectedRegion {
    pub fn new(quad: Quad, confidence: f32, text: Option<String>) -> Self {
        Self {
            quad,
            confidence,
            text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedactionMode {
    /// Outline each region.
    #[default]
    Annotate,
    /// Gaussian-blur each region in place.
    Blur,
}

impl std::fmt::Display for RedactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedactionMode::Annotate => write!(f, "annotate"),
            RedactionMode::Blur => write!(f, "blur"),
        }
    }
}

impl std::str::FromStr for RedactionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "annotate" => Ok(RedactionMode::Annotate),
            "blur" => Ok(RedactionMode::Blur),
            other => Err(format!("unknown redaction mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionPolicy {
    pub mode: RedactionMode,
    pub confidence_threshold: f32,
    pub blur_kernel_size: u32,
    pub box_color: [u8; 3],
    pub box_stroke_width: u32,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self {
            mode: RedactionMode::Annotate,
            confidence_threshold: 0.6,
            blur_kernel_size: 51,
            box_color: [0, 255, 0],
            box_stroke_width: 2,
        }
    }
}

impl RedactionPolicy {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            anyhow::bail!(
                "policy.confidence_threshold must be within 0..=1, got {}",
                self.confidence_threshold
            );
        }
        if !kernel_size_ok(self.blur_kernel_size) {
            anyhow::bail!(
                "policy.blur_kernel_size must be odd and >= 3, got {}",
                self.blur_kernel_size
            );
        }
        if self.box_stroke_width == 0 {
            anyhow::bail!("policy.box_stroke_width must be >= 1");
        }
        Ok(())
    }
}

pub fn kernel_size_ok(size: u32) -> bool {
    size >= 3 && size % 2 == 1
}
