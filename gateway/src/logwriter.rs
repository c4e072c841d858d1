use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::metrics::GatewayMetrics;
use crate::persistence::{LogRow, Persistence};

/// Bounded in-process queue in front of the transformation-log table. Writes
/// are best-effort: on overflow the oldest row is dropped and counted, and a
/// flush failure never reaches the request path.
#[derive(Clone)]
pub struct LogWriter {
    inner: Arc<LogWriterInner>,
}

struct LogWriterInner {
    queue: Mutex<VecDeque<LogRow>>,
    capacity: usize,
    metrics: Arc<GatewayMetrics>,
}

impl LogWriter {
    pub fn new(capacity: usize, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            inner: Arc::new(LogWriterInner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
                capacity: capacity.max(1),
                metrics,
            }),
        }
    }

    pub fn enqueue(&self, row: LogRow) {
        let mut queue = self.inner.queue.lock().expect("log queue poisoned");
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
            self.inner.metrics.record_log_queue_drop();
        }
        queue.push_back(row);
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().expect("log queue poisoned").len()
    }

    fn drain(&self, max: usize) -> Vec<LogRow> {
        let mut queue = self.inner.queue.lock().expect("log queue poisoned");
        let take = queue.len().min(max);
        queue.drain(..take).collect()
    }

    pub fn spawn_flush_task(&self, persistence: Persistence, flush_secs: u64) {
        let writer = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(flush_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let batch = writer.drain(256);
                if batch.is_empty() {
                    continue;
                }
                let count = batch.len();
                for row in batch {
                    if let Err(err) = persistence.append_transformation_log(&row).await {
                        // Appends are idempotent on id, so a lost row is the
                        // only consequence here.
                        warn!(%err, row_id = %row.id, "failed to append transformation log");
                    }
                }
                debug!(count, "flushed transformation log batch");
            }
        });
    }
}
