//! Drives a stream of scan events through the engine, either on the calling
//! task or fanned out over a pool of workers.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{Stream, StreamExt};
use tracing::{info, warn};

use kura_model::ScanEvent;

use crate::error::{Result, ScanError};
use crate::library::LibraryHandle;
use crate::scanner::worker;
use crate::scanner::{ScanContext, WriterConcurrency, events};

/// What to do when committing an event fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Log the failure and keep going. One broken file should not stop a
    /// scan of a whole library.
    #[default]
    LogAndContinue,
    /// Abort on the first failure. Used by tests and interactive runs.
    Propagate,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Number of workers. `None` derives a count from the machine's
    /// parallelism; `Some(0)` is rejected.
    pub worker_count: Option<usize>,
    pub error_policy: ErrorPolicy,
}

/// Outcome of one run: how many events committed and how many failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub processed: u64,
    pub failed: u64,
}

impl ScanStats {
    pub fn merge(&mut self, other: ScanStats) {
        self.processed += other.processed;
        self.failed += other.failed;
    }
}

/// Run-wide progress counter shared by every worker, so the interval log
/// reflects the whole run rather than one worker's share.
#[derive(Debug, Clone)]
pub(crate) struct Progress {
    counter: Arc<AtomicU64>,
    interval: u64,
}

impl Progress {
    fn new(interval: u64) -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
            interval: interval.max(1),
        }
    }

    /// Count one committed event; returns the run-wide total when it just
    /// crossed a reporting interval.
    pub(crate) fn record(&self) -> Option<u64> {
        let total = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        (total % self.interval == 0).then_some(total)
    }
}

/// Resolve the worker count for this run. Defaults leave a little headroom
/// on the machine; single-writer databases and handlers holding an
/// exclusive device both force a single worker.
fn effective_worker_count(ctx: &ScanContext, options: &RunOptions) -> Result<usize> {
    let requested = match options.worker_count {
        Some(0) => {
            return Err(ScanError::Validation(
                "worker_count must be at least 1".to_string(),
            ));
        }
        Some(count) => count,
        None => {
            let available = std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1);
            (available * 9 / 10).max(1)
        }
    };

    if requested > 1 && ctx.concurrency == WriterConcurrency::SingleWriter {
        info!("database supports a single writer, running one worker instead of {requested}");
        return Ok(1);
    }
    if requested > 1 && ctx.handlers.any_exclusive_device() {
        info!("a handler requires an exclusive device, running one worker instead of {requested}");
        return Ok(1);
    }
    Ok(requested)
}

/// Commit every event of `events` for `library`.
pub async fn run(
    library: Arc<LibraryHandle>,
    ctx: &ScanContext,
    options: &RunOptions,
    events: impl Stream<Item = ScanEvent> + Send,
) -> Result<ScanStats> {
    let workers = effective_worker_count(ctx, options)?;
    if workers == 1 {
        run_sequential(library, ctx, options, events).await
    } else {
        run_parallel(library, ctx, options, events, workers).await
    }
}

async fn run_sequential(
    library: Arc<LibraryHandle>,
    ctx: &ScanContext,
    options: &RunOptions,
    events: impl Stream<Item = ScanEvent> + Send,
) -> Result<ScanStats> {
    let mut conn = ctx.pool.acquire().await?;
    let mut stats = ScanStats::default();
    let progress = Progress::new(ctx.config.report_interval);
    let mut events = pin!(events);

    while let Some(event) = events.next().await {
        match events::commit_on(&event, &mut conn, &library, ctx).await {
            Ok(()) => {
                stats.processed += 1;
                if let Some(total) = progress.record() {
                    info!("library {}: {total} events processed", library.record().id);
                }
            }
            Err(err) => match options.error_policy {
                ErrorPolicy::Propagate => return Err(err),
                ErrorPolicy::LogAndContinue => {
                    stats.failed += 1;
                    warn!(
                        "failed to commit {} event for {:?}: {err}",
                        event.kind_name(),
                        event.path()
                    );
                }
            },
        }
    }
    Ok(stats)
}

async fn run_parallel(
    library: Arc<LibraryHandle>,
    ctx: &ScanContext,
    options: &RunOptions,
    events: impl Stream<Item = ScanEvent> + Send,
    workers: usize,
) -> Result<ScanStats> {
    let depth = ctx.config.queue_depth_per_worker.max(1) * workers;
    let (tx, rx) = async_channel::bounded::<ScanEvent>(depth);
    let progress = Progress::new(ctx.config.report_interval);

    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        handles.push(tokio::spawn(worker::process(
            worker_id,
            Arc::clone(&library),
            rx.clone(),
            ctx.clone(),
            options.error_policy,
            progress.clone(),
        )));
    }
    drop(rx);

    let mut events = pin!(events);
    while let Some(event) = events.next().await {
        // Send fails only when every worker has exited.
        if tx.send(event).await.is_err() {
            break;
        }
    }
    drop(tx);

    let mut stats = ScanStats::default();
    let mut first_error = None;
    for handle in handles {
        match handle
            .await
            .map_err(|err| ScanError::Internal(format!("scan worker panicked: {err}")))?
        {
            Ok(worker_stats) => stats.merge(worker_stats),
            Err(err) => first_error = first_error.or(Some(err)),
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(stats),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_shared_across_clones() {
        let progress = Progress::new(4);
        let clones = [progress.clone(), progress.clone()];

        // Workers interleave increments; the interval fires on the run-wide
        // total, once, regardless of which clone crosses it.
        let mut reports = Vec::new();
        for step in 0..8 {
            if let Some(total) = clones[step % 2].record() {
                reports.push(total);
            }
        }
        assert_eq!(reports, vec![4, 8]);
    }

    #[test]
    fn zero_interval_does_not_panic() {
        let progress = Progress::new(0);
        // max(1) keeps the modulus valid; every event reports.
        assert_eq!(progress.record(), Some(1));
        assert_eq!(progress.record(), Some(2));
    }
}
