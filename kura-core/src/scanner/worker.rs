//! A single scan worker: pulls events off the shared queue and commits them
//! over its own database connection.

use std::sync::Arc;

use tracing::{debug, info, warn};

use kura_model::ScanEvent;

use crate::error::Result;
use crate::library::LibraryHandle;
use crate::scanner::runner::{ErrorPolicy, Progress, ScanStats};
use crate::scanner::{ScanContext, events};

pub(crate) async fn process(
    worker_id: usize,
    library: Arc<LibraryHandle>,
    events: async_channel::Receiver<ScanEvent>,
    ctx: ScanContext,
    error_policy: ErrorPolicy,
    progress: Progress,
) -> Result<ScanStats> {
    let mut conn = ctx.pool.acquire().await?;
    let mut stats = ScanStats::default();
    debug!("scan worker {worker_id} started");

    while let Ok(event) = events.recv().await {
        match events::commit_on(&event, &mut conn, &library, &ctx).await {
            Ok(()) => {
                stats.processed += 1;
                if let Some(total) = progress.record() {
                    info!("library {}: {total} events processed", library.record().id);
                }
            }
            Err(err) => match error_policy {
                ErrorPolicy::Propagate => {
                    // Close the queue so the other workers and the feeder
                    // stop too.
                    events.close();
                    return Err(err);
                }
                ErrorPolicy::LogAndContinue => {
                    stats.failed += 1;
                    warn!(
                        "worker {worker_id}: failed to commit {} event for {:?}: {err}",
                        event.kind_name(),
                        event.path()
                    );
                }
            },
        }
    }

    debug!(
        "scan worker {worker_id} finished: {} processed, {} failed",
        stats.processed, stats.failed
    );
    Ok(stats)
}
