use batch_redact::{
    engine::Detector,
    error::DetectionError,
    processor::{decode, encode, ItemOutcome, ItemProcessor, OutputEncoding},
    region::{DetectedRegion, Point, Quad, RedactionPolicy},
};
use image::{ImageFormat, Rgb, RgbImage};

struct Fixed(Vec<DetectedRegion>);

impl Detector for Fixed {
    fn detect(&self, _image: &RgbImage) -> Result<Vec<DetectedRegion>, DetectionError> {
        Ok(self.0.clone())
    }
}

struct Failing;

impl Detector for Failing {
    fn detect(&self, _image: &RgbImage) -> Result<Vec<DetectedRegion>, DetectionError> {
        Err(DetectionError::Engine("model not loaded".into()))
    }
}

struct Panicking;

impl Detector for Panicking {
    fn detect(&self, _image: &RgbImage) -> Result<Vec<DetectedRegion>, DetectionError> {
        panic!("detector blew up")
    }
}

fn patterned(w: u32, h: u32) -> RgbImage {
    RgbImage::from_fn(w, h, |x, y| Rgb([(x * 9 % 256) as u8, (y * 17 % 256) as u8, 128]))
}

fn png(img: &RgbImage) -> Vec<u8> {
    encode(img, ImageFormat::Png).expect("encode png")
}

fn region(x0: i32, y0: i32, x1: i32, y1: i32, confidence: f32) -> DetectedRegion {
    DetectedRegion::new(
        Quad::from_corners(Point::new(x0, y0), Point::new(x1, y1)),
        confidence,
        Some("text".into()),
    )
}

#[test]
fn no_regions_is_unchanged_and_pixel_identical() {
    let img = patterned(24, 24);
    let detector = Fixed(vec![]);
    let policy = RedactionPolicy::default();
    let proc = ItemProcessor::new(&detector, &policy, OutputEncoding::default());

    let r = proc.process(0, "plain.png", &png(&img));
    assert_eq!(r.outcome, ItemOutcome::Unchanged);
    assert!(r.error.is_none());
    assert_eq!(r.regions_detected, 0);
    assert_eq!(decode(&r.output).expect("decode output"), img);
}

#[test]
fn confident_regions_are_redacted() {
    let img = RgbImage::new(40, 40);
    let detector = Fixed(vec![region(2, 2, 12, 12, 0.9), region(20, 20, 35, 30, 0.9)]);
    let policy = RedactionPolicy::default();
    let proc = ItemProcessor::new(&detector, &policy, OutputEncoding::default());

    let r = proc.process(3, "scan.png", &png(&img));
    assert_eq!(r.index, 3);
    assert_eq!(r.outcome, ItemOutcome::Redacted);
    assert_eq!(r.regions_detected, 2);
    assert_eq!(r.regions_applied, 2);
    let out = decode(&r.output).expect("decode output");
    assert_eq!(*out.get_pixel(2, 2), Rgb([0, 255, 0]));
    assert_eq!(*out.get_pixel(20, 20), Rgb([0, 255, 0]));
    assert_eq!(*out.get_pixel(16, 16), Rgb([0, 0, 0]));
}

#[test]
fn regions_below_threshold_report_redacted_with_nothing_applied() {
    let img = patterned(24, 24);
    let detector = Fixed(vec![region(1, 1, 10, 10, 0.2)]);
    let policy = RedactionPolicy::default();
    let proc = ItemProcessor::new(&detector, &policy, OutputEncoding::default());

    let r = proc.process(0, "faint.png", &png(&img));
    assert_eq!(r.outcome, ItemOutcome::Redacted);
    assert_eq!(r.regions_detected, 1);
    assert_eq!(r.regions_applied, 0);
    assert_eq!(decode(&r.output).expect("decode output"), img);
}

#[test]
fn corrupted_payload_falls_back_to_raw_bytes() {
    let detector = Fixed(vec![region(0, 0, 5, 5, 0.9)]);
    let policy = RedactionPolicy::default();
    let proc = ItemProcessor::new(&detector, &policy, OutputEncoding::default());

    let raw = b"\x89PNG not really an image".to_vec();
    let r = proc.process(1, "broken.png", &raw);
    assert_eq!(r.outcome, ItemOutcome::FallbackOriginal);
    assert!(r.error.as_deref().is_some_and(|e| !e.is_empty()));
    assert_eq!(r.output, raw);
}

#[test]
fn detection_failure_keeps_the_original_pixels() {
    let img = patterned(16, 16);
    let policy = RedactionPolicy::default();
    let proc = ItemProcessor::new(&Failing, &policy, OutputEncoding::default());

    let r = proc.process(0, "a.png", &png(&img));
    assert_eq!(r.outcome, ItemOutcome::FallbackOriginal);
    assert!(r.error.as_deref().is_some_and(|e| e.contains("model not loaded")));
    assert_eq!(decode(&r.output).expect("decode output"), img);
}

#[test]
fn detector_panic_is_contained() {
    let img = patterned(16, 16);
    let policy = RedactionPolicy::default();
    let proc = ItemProcessor::new(&Panicking, &policy, OutputEncoding::default());

    let r = proc.process(0, "a.png", &png(&img));
    assert_eq!(r.outcome, ItemOutcome::FallbackOriginal);
    assert!(r.error.as_deref().is_some_and(|e| e.contains("detector blew up")));
    assert_eq!(decode(&r.output).expect("decode output"), img);
}

#[test]
fn match_name_encoding_follows_extension() {
    let img = patterned(8, 8);
    let detector = Fixed(vec![]);
    let policy = RedactionPolicy::default();
    let proc = ItemProcessor::new(&detector, &policy, OutputEncoding::MatchName);

    let r = proc.process(0, "photo.bmp", &png(&img));
    assert_eq!(r.format, ImageFormat::Bmp);
    assert_eq!(
        image::guess_format(&r.output).expect("guess format"),
        ImageFormat::Bmp
    );
    assert_eq!(OutputEncoding::MatchName.format_for("noext"), ImageFormat::Png);
}
