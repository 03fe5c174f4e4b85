use batch_redact::{
    batch::{BatchItem, BatchOptions, BatchOrchestrator},
    engine::Detector,
    error::{DetectionError, PackageError},
    package::ResultSink,
    processor::{decode, encode, ItemOutcome, ItemResult},
    progress::{NoProgress, ProgressEvent},
    region::{DetectedRegion, Point, Quad, RedactionPolicy},
};
use image::{ImageFormat, Rgb, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Reports two regions for images wider than 20px and nothing otherwise.
struct ByWidth;

impl Detector for ByWidth {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedRegion>, DetectionError> {
        if image.width() <= 20 {
            return Ok(vec![]);
        }
        Ok(vec![
            DetectedRegion::new(
                Quad::from_corners(Point::new(1, 1), Point::new(10, 10)),
                0.9,
                Some("a".into()),
            ),
            DetectedRegion::new(
                Quad::from_corners(Point::new(15, 15), Point::new(28, 28)),
                0.9,
                Some("b".into()),
            ),
        ])
    }
}

/// Sleeps longer for earlier items so parallel completion order is reversed.
struct Slow;

impl Detector for Slow {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedRegion>, DetectionError> {
        let delay = 60u64.saturating_sub(u64::from(image.width()) * 5);
        std::thread::sleep(Duration::from_millis(delay));
        Ok(vec![])
    }
}

fn png(img: &RgbImage) -> Vec<u8> {
    encode(img, ImageFormat::Png).expect("encode png")
}

fn gradient(w: u32, h: u32) -> RgbImage {
    RgbImage::from_fn(w, h, |x, y| Rgb([(x * 8 % 256) as u8, (y * 8 % 256) as u8, 40]))
}

fn orchestrator(detector: impl Detector + 'static, options: BatchOptions) -> BatchOrchestrator {
    BatchOrchestrator::new(Arc::new(detector), RedactionPolicy::default(), options)
}

fn mixed_batch() -> (Vec<BatchItem>, RgbImage) {
    let plain = gradient(16, 16);
    let items = vec![
        BatchItem::from_bytes("plain.png", png(&plain)),
        BatchItem::from_bytes("text.png", png(&RgbImage::new(32, 32))),
        BatchItem::from_bytes("corrupt.png", b"definitely not an image".to_vec()),
    ];
    (items, plain)
}

#[test]
fn mixed_batch_yields_one_of_each_outcome() {
    let (items, plain) = mixed_batch();
    let out = orchestrator(ByWidth, BatchOptions::default()).run(items, &NoProgress);

    assert_eq!(out.len(), 3);
    assert_eq!(out.summary.total, 3);
    assert_eq!(out.summary.unchanged, 1);
    assert_eq!(out.summary.redacted, 1);
    assert_eq!(out.summary.fallback, 1);

    let outcomes: Vec<ItemOutcome> = out.results.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            ItemOutcome::Unchanged,
            ItemOutcome::Redacted,
            ItemOutcome::FallbackOriginal
        ]
    );

    assert_eq!(decode(&out.results[0].output).expect("decode"), plain);
    let redacted = decode(&out.results[1].output).expect("decode");
    assert_eq!(*redacted.get_pixel(1, 1), Rgb([0, 255, 0]));
    assert_eq!(*redacted.get_pixel(15, 15), Rgb([0, 255, 0]));
    assert_eq!(out.results[1].regions_applied, 2);
    assert!(out.results[2].error.is_some());
}

#[test]
fn parallel_run_preserves_origin_order() {
    let items: Vec<BatchItem> = (1..=8)
        .map(|w| BatchItem::from_bytes(format!("img{w}.png"), png(&gradient(w, 4))))
        .collect();
    let options = BatchOptions {
        max_parallel_items: 4,
        ..BatchOptions::default()
    };

    let seen = Mutex::new(Vec::new());
    let progress = |e: &ProgressEvent<'_>| {
        seen.lock().expect("lock").push(e.index);
    };
    let out = orchestrator(Slow, options).run(items, &progress);

    assert_eq!(out.len(), 8);
    for (i, r) in out.results.iter().enumerate() {
        assert_eq!(r.index, i);
        assert_eq!(r.name, format!("img{}.png", i + 1));
    }
    assert_eq!(*seen.lock().expect("lock"), (0..8).collect::<Vec<_>>());
}

#[test]
fn panicking_progress_sink_does_not_abort_the_batch() {
    let (items, _) = mixed_batch();
    let progress = |e: &ProgressEvent<'_>| {
        if e.index == 0 {
            panic!("ui went away");
        }
    };
    let out = orchestrator(ByWidth, BatchOptions::default()).run(items, &progress);
    assert_eq!(out.len(), 3);
    assert_eq!(out.summary.total, 3);
}

#[test]
fn cancelled_batch_passes_everything_through() {
    let (items, plain) = mixed_batch();
    let orch = orchestrator(ByWidth, BatchOptions::default());
    orch.cancel_token().cancel();

    let out = orch.run(items, &NoProgress);
    assert_eq!(out.len(), 3);
    assert_eq!(out.summary.fallback, 3);
    assert!(out
        .results
        .iter()
        .all(|r| r.error.as_deref().is_some_and(|e| e.contains("cancelled"))));
    assert_eq!(decode(&out.results[0].output).expect("decode"), plain);
}

#[test]
fn elapsed_deadline_stops_detection() {
    let (items, _) = mixed_batch();
    let options = BatchOptions {
        deadline: Some(Duration::ZERO),
        ..BatchOptions::default()
    };
    let out = orchestrator(ByWidth, options).run(items, &NoProgress);
    assert_eq!(out.summary.fallback, 3);
    assert_eq!(out.summary.redacted, 0);
}

#[test]
fn oversized_payload_is_a_fallback() {
    let items = vec![BatchItem::from_bytes("big.png", png(&gradient(32, 32)))];
    let options = BatchOptions {
        max_input_file_bytes: 16,
        ..BatchOptions::default()
    };
    let out = orchestrator(ByWidth, options).run(items, &NoProgress);
    assert_eq!(out.results[0].outcome, ItemOutcome::FallbackOriginal);
    assert!(out.results[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("limit")));
}

#[test]
fn run_into_streams_in_order_and_reports() {
    let (items, _) = mixed_batch();
    let options = BatchOptions {
        max_parallel_items: 3,
        ..BatchOptions::default()
    };
    let mut sink: Vec<ItemResult> = Vec::new();
    let report = orchestrator(ByWidth, options)
        .run_into(items, &NoProgress, &mut sink)
        .expect("run_into");

    assert_eq!(sink.len(), 3);
    assert_eq!(report.expected, 3);
    assert_eq!(report.items.len(), 3);
    assert_eq!(report.summary.succeeded(), 2);
    assert!(report.finished.is_some());
    let names: Vec<&str> = sink.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["plain.png", "text.png", "corrupt.png"]);
    assert_eq!(report.items[1].output_bytes, sink[1].output.len());
}

#[test]
fn file_payloads_are_read_lazily() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("on_disk.png");
    std::fs::write(&path, png(&gradient(12, 12))).expect("write");

    let items = vec![
        BatchItem::from_file(path),
        BatchItem::from_file(dir.path().join("missing.png")),
    ];
    let out = orchestrator(ByWidth, BatchOptions::default()).run(items, &NoProgress);
    assert_eq!(out.results[0].name, "on_disk.png");
    assert_eq!(out.results[0].outcome, ItemOutcome::Unchanged);
    assert_eq!(out.results[1].outcome, ItemOutcome::FallbackOriginal);
}

#[test]
fn empty_batch_is_empty_result() {
    let out = orchestrator(ByWidth, BatchOptions::default()).run(vec![], &NoProgress);
    assert!(out.is_empty());
    assert_eq!(out.summary.total, 0);
}

/// Holds up the 1px-wide item and counts finished detections.
struct SlowFirst {
    finished: Arc<AtomicUsize>,
}

impl Detector for SlowFirst {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedRegion>, DetectionError> {
        if image.width() == 1 {
            std::thread::sleep(Duration::from_millis(400));
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(vec![])
    }
}

/// Records how many detections had finished when item 0 was delivered.
struct FirstDelivery {
    finished: Arc<AtomicUsize>,
    finished_at_first: Option<usize>,
    delivered: usize,
}

impl ResultSink for FirstDelivery {
    fn accept(&mut self, result: ItemResult) -> Result<(), PackageError> {
        if result.index == 0 {
            self.finished_at_first = Some(self.finished.load(Ordering::SeqCst));
        }
        self.delivered += 1;
        Ok(())
    }
}

#[test]
fn slow_first_item_bounds_how_far_workers_run_ahead() {
    let finished = Arc::new(AtomicUsize::new(0));
    let mut items = vec![BatchItem::from_bytes("slow.png", png(&gradient(1, 4)))];
    items.extend((1..40).map(|i| BatchItem::from_bytes(format!("f{i}.png"), png(&gradient(2, 4)))));
    let options = BatchOptions {
        max_parallel_items: 2,
        ..BatchOptions::default()
    };
    let detector = SlowFirst {
        finished: Arc::clone(&finished),
    };
    let mut sink = FirstDelivery {
        finished,
        finished_at_first: None,
        delivered: 0,
    };

    let report = orchestrator(detector, options)
        .run_into(items, &NoProgress, &mut sink)
        .expect("run_into");

    assert_eq!(sink.delivered, 40);
    assert_eq!(report.summary.unchanged, 40);
    let at_first = sink.finished_at_first.expect("item 0 delivered");
    assert!(
        at_first <= 4,
        "{at_first} detections had finished before item 0 was delivered"
    );
}

/// Panics on every odd-width image.
struct PanicsOnOdd;

impl Detector for PanicsOnOdd {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedRegion>, DetectionError> {
        if image.width() % 2 == 1 {
            panic!("engine crashed on {}px", image.width());
        }
        Ok(vec![])
    }
}

#[test]
fn panicking_items_keep_every_slot_in_parallel_runs() {
    let items: Vec<BatchItem> = (1..=10)
        .map(|w| BatchItem::from_bytes(format!("p{w}.png"), png(&gradient(w, 3))))
        .collect();
    let options = BatchOptions {
        max_parallel_items: 3,
        ..BatchOptions::default()
    };
    let out = orchestrator(PanicsOnOdd, options).run(items, &NoProgress);

    assert_eq!(out.len(), 10);
    assert_eq!(out.summary.fallback, 5);
    assert_eq!(out.summary.unchanged, 5);
    for (i, r) in out.results.iter().enumerate() {
        assert_eq!(r.index, i);
    }
}
