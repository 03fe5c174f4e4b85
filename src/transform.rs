use crate::{
    error::TransformError,
    region::{kernel_size_ok, DetectedRegion, RedactionMode, RedactionPolicy},
};
use image::{imageops, Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, filter::gaussian_blur_f32, rect::Rect};
use serde::Serialize;

/// Pixel rectangle with exclusive right/bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    LowConfidence,
    EmptyText,
    ZeroArea,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutcome {
    Applied(PixelRect),
    Skipped(SkipReason),
}

/// Bounding rectangle from the top-left and bottom-right corners, clipped to
/// the image. `None` when nothing of it lies inside.
pub fn clamped_rect(region: &DetectedRegion, width: u32, height: u32) -> Option<PixelRect> {
    let tl = region.quad.top_left;
    let br = region.quad.bottom_right;

    let clamp = |v: i32, max: u32| -> u32 { (v.max(0) as i64).min(max as i64) as u32 };

    let x0 = clamp(tl.x.min(br.x), width);
    let x1 = clamp(tl.x.max(br.x), width);
    let y0 = clamp(tl.y.min(br.y), height);
    let y1 = clamp(tl.y.max(br.y), height);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(PixelRect { x0, y0, x1, y1 })
}

pub fn apply_region(
    image: &mut RgbImage,
    region: &DetectedRegion,
    policy: &RedactionPolicy,
) -> Result<TransformOutcome, TransformError> {
    if region.confidence < policy.confidence_threshold {
        return Ok(TransformOutcome::Skipped(SkipReason::LowConfidence));
    }
    if let Some(text) = region.text.as_deref() {
        if text.trim().is_empty() {
            return Ok(TransformOutcome::Skipped(SkipReason::EmptyText));
        }
    }

    let Some(rect) = clamped_rect(region, image.width(), image.height()) else {
        return Ok(TransformOutcome::Skipped(SkipReason::ZeroArea));
    };

    match policy.mode {
        RedactionMode::Annotate => outline(image, rect, policy)?,
        RedactionMode::Blur => blur(image, rect, policy.blur_kernel_size)?,
    }
    Ok(TransformOutcome::Applied(rect))
}

// Strokes are drawn inwards so nothing lands outside `rect`.
fn outline(
    image: &mut RgbImage,
    rect: PixelRect,
    policy: &RedactionPolicy,
) -> Result<(), TransformError> {
    if policy.box_stroke_width == 0 {
        return Err(TransformError::InvalidStroke);
    }
    let color = Rgb(policy.box_color);
    for inset in 0..policy.box_stroke_width {
        let w = rect.width().saturating_sub(2 * inset);
        let h = rect.height().saturating_sub(2 * inset);
        if w == 0 || h == 0 {
            break;
        }
        let r = Rect::at((rect.x0 + inset) as i32, (rect.y0 + inset) as i32).of_size(w, h);
        draw_hollow_rect_mut(image, r, color);
    }
    Ok(())
}

fn blur(image: &mut RgbImage, rect: PixelRect, kernel_size: u32) -> Result<(), TransformError> {
    if !kernel_size_ok(kernel_size) {
        return Err(TransformError::InvalidKernel(kernel_size));
    }
    let patch =
        imageops::crop_imm(&*image, rect.x0, rect.y0, rect.width(), rect.height()).to_image();
    let blurred = gaussian_blur_f32(&patch, sigma_for_kernel(kernel_size));
    imageops::replace(image, &blurred, rect.x0 as i64, rect.y0 as i64);
    Ok(())
}

/// Sigma that a Gaussian kernel of `size` taps is conventionally built with
/// when no sigma is given explicitly.
pub fn sigma_for_kernel(size: u32) -> f32 {
    0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8
}
