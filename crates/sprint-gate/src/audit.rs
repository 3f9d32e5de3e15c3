//! Bounded audit buffer.
//!
//! Admission decisions are buffered here and drained to storage by a
//! background writer. The buffer never blocks the admission path: on
//! overflow the oldest record is dropped and counted.

use parking_lot::Mutex;
use sprint_storage::{AuditRecord, GatewayDb};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct AuditSink {
    buffer: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl AuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a record, dropping the oldest when full.
    pub fn emit(&self, record: AuditRecord) {
        let mut buffer = self.buffer.lock();
        if buffer.len() == self.capacity {
            buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(record);
    }

    /// Remove up to `max` oldest records.
    pub fn drain(&self, max: usize) -> Vec<AuditRecord> {
        let mut buffer = self.buffer.lock();
        let take = max.min(buffer.len());
        buffer.drain(..take).collect()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Background writer: drains the buffer into the audit column family.
    pub fn spawn_writer(self: &Arc<Self>, db: Arc<GatewayDb>) -> tokio::task::JoinHandle<()> {
        let sink = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(sink) = sink.upgrade() else { break };
                let batch = sink.drain(512);
                if batch.is_empty() {
                    continue;
                }
                debug!(records = batch.len(), "flushing audit batch");
                for record in &batch {
                    if let Err(e) = db.append_audit(record) {
                        warn!(error = %e, "audit write failed");
                        break;
                    }
                }
            }
        })
    }
}
