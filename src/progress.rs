use crate::processor::ItemOutcome;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ProgressEvent<'a> {
    /// Origin index, 0-based.
    pub index: usize,
    pub total: usize,
    pub name: &'a str,
    pub outcome: ItemOutcome,
}

impl ProgressEvent<'_> {
    pub fn position(&self) -> usize {
        self.index + 1
    }

    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.position() as f32 / self.total as f32
        }
    }
}

/// Observer notified once per item, in origin order. Purely informational:
/// a panicking sink is logged and ignored.
pub trait ProgressSink {
    fn on_item(&self, event: &ProgressEvent<'_>);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent<'_>),
{
    fn on_item(&self, event: &ProgressEvent<'_>) {
        self(event)
    }
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_item(&self, _event: &ProgressEvent<'_>) {}
}

/// Writes one `info!` line per item.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_item(&self, event: &ProgressEvent<'_>) {
        info!(
            "[{}/{}] {} -> {} ({:.0}%)",
            event.position(),
            event.total,
            event.name,
            event.outcome,
            event.fraction() * 100.0
        );
    }
}
