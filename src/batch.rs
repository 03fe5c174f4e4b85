use crate::{
    engine::Detector,
    error::{DecodeError, ItemError, PackageError},
    package::ResultSink,
    processor::{ItemProcessor, ItemResult, OutputEncoding},
    progress::{ProgressEvent, ProgressSink},
    region::RedactionPolicy,
    report::BatchReport,
    util::file_name_string,
};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub use crate::report::BatchSummary;

/// How many items per worker may finish ahead of the oldest undelivered one.
const REORDER_SLACK: usize = 2;

#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Vec<u8>),
    /// Read when the item starts, so only in-flight payloads are resident.
    File(PathBuf),
}

impl Payload {
    pub fn load(self, limit: u64) -> Result<Vec<u8>, DecodeError> {
        match self {
            Payload::Bytes(bytes) => {
                let len = bytes.len() as u64;
                if limit > 0 && len > limit {
                    return Err(DecodeError::TooLarge { bytes: len, limit });
                }
                Ok(bytes)
            }
            Payload::File(path) => {
                let unreadable = |source: std::io::Error| DecodeError::Unreadable {
                    path: path.display().to_string(),
                    source,
                };
                let len = std::fs::metadata(&path).map_err(unreadable)?.len();
                if limit > 0 && len > limit {
                    return Err(DecodeError::TooLarge { bytes: len, limit });
                }
                std::fs::read(&path).map_err(unreadable)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub name: String,
    pub payload: Payload,
}

impl BatchItem {
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload: Payload::Bytes(bytes),
        }
    }

    pub fn from_file(path: PathBuf) -> Self {
        Self {
            name: file_name_string(&path),
            payload: Payload::File(path),
        }
    }
}

/// Checked between items. Items not yet started when it trips come out as
/// `FallbackOriginal` without running detection.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_parallel_items: usize,
    /// 0 disables the limit.
    pub max_input_file_bytes: u64,
    pub deadline: Option<Duration>,
    pub encoding: OutputEncoding,
    pub cancel: CancelToken,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_parallel_items: 1,
            max_input_file_bytes: 0,
            deadline: None,
            encoding: OutputEncoding::default(),
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub results: Vec<ItemResult>,
    pub summary: BatchSummary,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

pub struct BatchOrchestrator {
    detector: Arc<dyn Detector>,
    policy: RedactionPolicy,
    options: BatchOptions,
}

impl BatchOrchestrator {
    pub fn new(
        detector: Arc<dyn Detector>,
        policy: RedactionPolicy,
        options: BatchOptions,
    ) -> Self {
        Self {
            detector,
            policy,
            options,
        }
    }

    pub fn policy(&self) -> &RedactionPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.options.cancel.clone()
    }

    /// Processes every item and keeps all results in memory.
    pub fn run(&self, items: Vec<BatchItem>, progress: &dyn ProgressSink) -> BatchResult {
        let mut results = Vec::with_capacity(items.len());
        let outcome = self.drive(items, progress, |r| -> Result<(), Infallible> {
            results.push(r);
            Ok(())
        });
        let report = match outcome {
            Ok(report) => report,
            Err(never) => match never {},
        };
        BatchResult {
            results,
            summary: report.summary,
        }
    }

    /// Processes every item, handing each result to `sink` in origin order
    /// as soon as it and all earlier items are done.
    pub fn run_into(
        &self,
        items: Vec<BatchItem>,
        progress: &dyn ProgressSink,
        sink: &mut dyn ResultSink,
    ) -> Result<BatchReport, PackageError> {
        self.drive(items, progress, |r| sink.accept(r))
    }

    fn drive<E>(
        &self,
        items: Vec<BatchItem>,
        progress: &dyn ProgressSink,
        mut deliver: impl FnMut(ItemResult) -> Result<(), E>,
    ) -> Result<BatchReport, E> {
        let total = items.len();
        let started = Instant::now();
        let mut report = BatchReport::new(total);

        let mut emit = |result: ItemResult| -> Result<(), E> {
            report.record(&result);
            notify(progress, &result, total);
            deliver(result)
        };

        let workers = self.options.max_parallel_items.clamp(1, total.max(1));
        if workers == 1 {
            for (index, item) in items.into_iter().enumerate() {
                emit(self.process_item(index, item, started))?;
            }
        } else {
            debug!("processing {} items on {} workers", total, workers);
            self.drive_parallel(items, workers, started, &mut emit)?;
        }

        report.finish();
        info!(
            "batch done in {:.2}s: total={} redacted={} unchanged={} fallback={}",
            started.elapsed().as_secs_f64(),
            report.summary.total,
            report.summary.redacted,
            report.summary.unchanged,
            report.summary.fallback
        );
        Ok(report)
    }

    // Workers pull from a shared queue; results are re-sequenced by origin
    // index before `emit` sees them. The gate keeps workers within a fixed
    // window of the last delivered index, which bounds `pending`.
    fn drive_parallel<E>(
        &self,
        items: Vec<BatchItem>,
        workers: usize,
        started: Instant,
        emit: &mut impl FnMut(ItemResult) -> Result<(), E>,
    ) -> Result<(), E> {
        let queue = Mutex::new(items.into_iter().enumerate());
        let gate = EmitGate::new(workers * REORDER_SLACK);

        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::sync_channel::<ItemResult>(workers);
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let gate = &gate;
                scope.spawn(move || {
                    loop {
                        let next = match queue.lock() {
                            Ok(mut q) => q.next(),
                            Err(_) => None,
                        };
                        let Some((index, item)) = next else {
                            break;
                        };
                        if !gate.admit(index) {
                            break;
                        }
                        let result = self.process_item(index, item, started);
                        if tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            let mut pending = BTreeMap::new();
            let mut next = 0;
            for result in rx {
                pending.insert(result.index, result);
                while let Some(ready) = pending.remove(&next) {
                    if let Err(err) = emit(ready) {
                        gate.close();
                        return Err(err);
                    }
                    next += 1;
                    gate.advance(next);
                }
            }
            Ok(())
        })
    }

    fn process_item(&self, index: usize, item: BatchItem, started: Instant) -> ItemResult {
        let processor =
            ItemProcessor::new(self.detector.as_ref(), &self.policy, self.options.encoding);
        let BatchItem { name, payload } = item;

        let raw = match payload.load(self.options.max_input_file_bytes) {
            Ok(raw) => raw,
            Err(err) => return processor.passthrough(index, &name, &[], err.into()),
        };

        if self.should_stop(started) {
            return processor.passthrough(index, &name, &raw, ItemError::Cancelled);
        }
        processor.process(index, &name, &raw)
    }

    fn should_stop(&self, started: Instant) -> bool {
        let token = &self.options.cancel;
        if token.is_cancelled() {
            return true;
        }
        if let Some(limit) = self.options.deadline {
            if started.elapsed() >= limit {
                warn!("batch deadline of {:?} reached; remaining items pass through", limit);
                token.cancel();
                return true;
            }
        }
        false
    }
}

/// Admits item `index` only while `index < delivered + window`.
struct EmitGate {
    window: usize,
    state: Mutex<GateState>,
    moved: Condvar,
}

struct GateState {
    delivered: usize,
    closed: bool,
}

impl EmitGate {
    fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            state: Mutex::new(GateState {
                delivered: 0,
                closed: false,
            }),
            moved: Condvar::new(),
        }
    }

    /// Blocks until `index` fits the window. `false` once the batch is
    /// being torn down.
    fn admit(&self, index: usize) -> bool {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self
            .moved
            .wait_while(guard, |st| !st.closed && index >= st.delivered + self.window)
            .unwrap_or_else(PoisonError::into_inner);
        !state.closed
    }

    fn advance(&self, delivered: usize) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).delivered = delivered;
        self.moved.notify_all();
    }

    fn close(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
        self.moved.notify_all();
    }
}

fn notify(progress: &dyn ProgressSink, result: &ItemResult, total: usize) {
    let event = ProgressEvent {
        index: result.index,
        total,
        name: &result.name,
        outcome: result.outcome,
    };
    if catch_unwind(AssertUnwindSafe(|| progress.on_item(&event))).is_err() {
        warn!("progress sink panicked on item {}; continuing", result.index);
    }
}
