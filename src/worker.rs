//! Worker Task (§4.7): single-threaded consumer of a priority queue of
//! deferred work items. Items whose execution may block on I/O run here so
//! the receiver/asender never do.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::state::PostChangeAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorRange {
    pub sector: u64,
    pub len: u32,
}

/// Tagged sum of deferred work (§9 design note: a tagged sum, not
/// function-pointer objects).
#[derive(Debug, Clone)]
pub enum WorkItem {
    ResyncTick,
    TrySendBarrier,
    SendWriteHint(SectorRange),
    SendBitmap,
    AfterStateChange(PostChangeAction),
}

/// FIFO work queue except for `front_queue`, which coalesces unplug hints
/// (§4.7): a second in-flight hint for the same range is dropped instead of
/// queued again.
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem>>,
    pending_hints: std::sync::Mutex<HashSet<SectorRange>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            pending_hints: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn push(&self, item: WorkItem) {
        if let WorkItem::SendWriteHint(range) = item {
            let mut pending = self.pending_hints.lock().unwrap();
            if !pending.insert(range) {
                return;
            }
        }
        let _ = self.tx.send(item);
    }

    async fn recv(&self) -> Option<WorkItem> {
        let item = self.rx.lock().await.recv().await;
        if let Some(WorkItem::SendWriteHint(range)) = &item {
            self.pending_hints.lock().unwrap().remove(range);
        }
        item
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handlers the worker task invokes for each item. Kept as a trait so
/// `device.rs` can wire this to real channel/state/resync machinery while
/// tests exercise the queue discipline against a fake.
#[async_trait::async_trait]
pub trait WorkHandler: Send + Sync {
    async fn resync_tick(&self, now: Instant);
    async fn try_send_barrier(&self);
    async fn send_write_hint(&self, range: SectorRange);
    async fn send_bitmap(&self);
    async fn after_state_change(&self, action: PostChangeAction);
}

pub async fn run(queue: Arc<WorkQueue>, handler: Arc<dyn WorkHandler>, cancel: CancellationToken) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("worker task started");
    }
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = queue.recv() => item,
        };
        let Some(item) = item else { break };
        match item {
            WorkItem::ResyncTick => handler.resync_tick(Instant::now()).await,
            WorkItem::TrySendBarrier => handler.try_send_barrier().await,
            WorkItem::SendWriteHint(range) => handler.send_write_hint(range).await,
            WorkItem::SendBitmap => handler.send_bitmap().await,
            WorkItem::AfterStateChange(action) => handler.after_state_change(action).await,
        }
    }
    if log::log_enabled!(log::Level::Info) {
        log::info!("worker task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        hints_seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl WorkHandler for CountingHandler {
        async fn resync_tick(&self, _now: Instant) {}
        async fn try_send_barrier(&self) {}
        async fn send_write_hint(&self, _range: SectorRange) {
            self.hints_seen.fetch_add(1, Ordering::SeqCst);
        }
        async fn send_bitmap(&self) {}
        async fn after_state_change(&self, _action: PostChangeAction) {}
    }

    #[tokio::test]
    async fn duplicate_write_hints_coalesce() {
        let queue = Arc::new(WorkQueue::new());
        let range = SectorRange { sector: 0, len: 8 };
        queue.push(WorkItem::SendWriteHint(range));
        queue.push(WorkItem::SendWriteHint(range));

        let handler = Arc::new(CountingHandler {
            hints_seen: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let queue_clone = queue.clone();
        let handler_clone = handler.clone();
        let task = tokio::spawn(run(queue_clone, handler_clone, cancel_clone));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        let _ = task.await;
        assert_eq!(handler.hints_seen.load(Ordering::SeqCst), 1);
    }
}
