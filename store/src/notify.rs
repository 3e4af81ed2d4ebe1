//! User notifications for applied and quorum-acked batches.
//!
//! Three modes: no callbacks, a blocking callback before each secondary ack,
//! or non-blocking delivery once the wire replicator reports the batch
//! quorum-acked. Non-blocking deliveries are serialized through a
//! single-consumer queue so the handler sees batches in LSN order, each
//! exactly once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::error::{CResult, Error};
use crate::local::{Lsn, StoreItem};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationMode {
    None,
    BlockSecondaryAck,
    NonBlockingQuorumAcked,
}

/// User-supplied handler for store events.
pub trait StoreEventHandler: Send + Sync {
    /// Invoked exactly once when a build completes, with a snapshot of the
    /// copied rows. The enumerator is released when this returns.
    fn on_copy_complete(&self, enumerator: &mut StoreEnumerator) -> CResult<()>;

    /// Invoked per applied batch, per the configured mode.
    fn on_replication_operation(&self, items: &[StoreItem]) -> CResult<()>;
}

/// A snapshot-scoped item enumerator handed to the copy-complete callback.
/// Using it after release returns `InvalidState`.
pub struct StoreEnumerator {
    items: Option<std::vec::IntoIter<StoreItem>>,
}

impl StoreEnumerator {
    pub(crate) fn new(items: Vec<StoreItem>) -> Self {
        StoreEnumerator { items: Some(items.into_iter()) }
    }

    pub fn next_item(&mut self) -> CResult<Option<StoreItem>> {
        match self.items.as_mut() {
            Some(iter) => Ok(iter.next()),
            None => Err(Error::InvalidState("enumerator released".to_string())),
        }
    }

    pub(crate) fn release(&mut self) {
        self.items = None;
    }
}

pub struct NotificationManager {
    mode: NotificationMode,
    handler: Option<Arc<dyn StoreEventHandler>>,
    /// Batches waiting for quorum ack, keyed by LSN.
    pending: Mutex<BTreeMap<Lsn, Vec<StoreItem>>>,
    dispatch_tx: Mutex<Option<mpsc::UnboundedSender<(Lsn, Vec<StoreItem>)>>>,
    queue_depth: Arc<AtomicU64>,
    last_dispatched: AtomicI64,
}

impl NotificationManager {
    pub fn new(mode: NotificationMode, handler: Option<Arc<dyn StoreEventHandler>>) -> Arc<Self> {
        let queue_depth = Arc::new(AtomicU64::new(0));

        let dispatch_tx = if mode == NotificationMode::NonBlockingQuorumAcked {
            let (tx, rx) = mpsc::unbounded_channel::<(Lsn, Vec<StoreItem>)>();
            let consumer_handler = handler.clone();
            let consumer_depth = queue_depth.clone();
            tokio::spawn(async move {
                let mut deliveries = UnboundedReceiverStream::new(rx);
                while let Some((lsn, items)) = deliveries.next().await {
                    consumer_depth.fetch_sub(1, Ordering::SeqCst);
                    if let Some(handler) = &consumer_handler {
                        if let Err(err) = handler.on_replication_operation(&items) {
                            log::warn!("notification handler failed at lsn {}: {}", lsn, err);
                        }
                    }
                }
            });
            Some(tx)
        } else {
            None
        };

        Arc::new(NotificationManager {
            mode,
            handler,
            pending: Mutex::new(BTreeMap::new()),
            dispatch_tx: Mutex::new(dispatch_tx),
            queue_depth,
            last_dispatched: AtomicI64::new(0),
        })
    }

    pub fn mode(&self) -> NotificationMode {
        self.mode
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::SeqCst)
    }

    /// Reports an applied batch. In `BlockSecondaryAck` mode the handler
    /// runs inline and its error propagates (the replica transient-faults);
    /// in `NonBlockingQuorumAcked` mode the batch buffers until eligible.
    pub fn on_batch_applied(&self, lsn: Lsn, items: Vec<StoreItem>) -> CResult<()> {
        match self.mode {
            NotificationMode::None => Ok(()),
            NotificationMode::BlockSecondaryAck => match &self.handler {
                Some(handler) => handler.on_replication_operation(&items),
                None => Ok(()),
            },
            NotificationMode::NonBlockingQuorumAcked => {
                lock(&self.pending).insert(lsn, items);
                Ok(())
            }
        }
    }

    /// Dispatches every buffered batch with `lsn <= quorum_acked`, in order.
    pub fn on_quorum_advanced(&self, quorum_acked: Lsn) {
        if self.mode != NotificationMode::NonBlockingQuorumAcked {
            return;
        }

        let eligible: Vec<(Lsn, Vec<StoreItem>)> = {
            let mut pending = lock(&self.pending);
            let keep = pending.split_off(&(quorum_acked + 1));
            let eligible = std::mem::replace(&mut *pending, keep);
            eligible.into_iter().collect()
        };

        let tx = lock(&self.dispatch_tx).clone();
        if let Some(tx) = tx {
            for (lsn, items) in eligible {
                // At-most-once: anything at or below the high mark was
                // already dispatched.
                if self.last_dispatched.fetch_max(lsn, Ordering::SeqCst) >= lsn {
                    continue;
                }
                self.queue_depth.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send((lsn, items));
            }
        }
    }

    /// Fires the copy-complete callback exactly once over a snapshot.
    pub fn notify_copy_complete(&self, items: Vec<StoreItem>) -> CResult<()> {
        let handler = match &self.handler {
            Some(handler) => handler.clone(),
            None => return Ok(()),
        };

        let mut enumerator = StoreEnumerator::new(items);
        let result = handler.on_copy_complete(&mut enumerator);
        enumerator.release();
        result
    }

    /// Drops batches still waiting for quorum ack, e.g. when the replica
    /// changes role. The dispatcher stays usable.
    pub fn clear_pending(&self) {
        lock(&self.pending).clear();
    }

    /// Drains buffered batches on close. Nothing further is delivered.
    pub fn drain(&self) {
        lock(&self.pending).clear();
        lock(&self.dispatch_tx).take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        delivered: Mutex<Vec<Lsn>>,
        copied: Mutex<Vec<String>>,
        fail_replication: AtomicBool,
    }

    impl StoreEventHandler for RecordingHandler {
        fn on_copy_complete(&self, enumerator: &mut StoreEnumerator) -> CResult<()> {
            while let Some(item) = enumerator.next_item()? {
                lock(&self.copied).push(item.key);
            }
            Ok(())
        }

        fn on_replication_operation(&self, items: &[StoreItem]) -> CResult<()> {
            if self.fail_replication.load(Ordering::SeqCst) {
                return Err(Error::Internal("handler failed".to_string()));
            }
            lock(&self.delivered).push(items[0].operation_lsn);
            Ok(())
        }
    }

    fn item(lsn: Lsn) -> StoreItem {
        StoreItem {
            item_type: "T".to_string(),
            key: format!("k{}", lsn),
            value: vec![],
            operation_lsn: lsn,
            last_modified_on_primary_utc: None,
        }
    }

    #[tokio::test]
    async fn quorum_acked_batches_deliver_in_order_exactly_once() {
        let handler = Arc::new(RecordingHandler::default());
        let manager = NotificationManager::new(
            NotificationMode::NonBlockingQuorumAcked,
            Some(handler.clone()),
        );

        for lsn in [3, 1, 2] {
            manager.on_batch_applied(lsn, vec![item(lsn)]).unwrap();
        }

        // Nothing delivered before quorum advances.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(lock(&handler.delivered).is_empty());

        manager.on_quorum_advanced(2);
        // Re-advancing must not redeliver.
        manager.on_quorum_advanced(2);
        manager.on_quorum_advanced(3);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*lock(&handler.delivered), vec![1, 2, 3]);
        assert_eq!(manager.queue_depth(), 0);
    }

    #[tokio::test]
    async fn blocking_mode_propagates_handler_errors() {
        let handler = Arc::new(RecordingHandler::default());
        handler.fail_replication.store(true, Ordering::SeqCst);
        let manager =
            NotificationManager::new(NotificationMode::BlockSecondaryAck, Some(handler));

        let result = manager.on_batch_applied(1, vec![item(1)]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn copy_complete_enumerator_is_single_use() {
        let handler = Arc::new(RecordingHandler::default());
        let manager = NotificationManager::new(
            NotificationMode::BlockSecondaryAck,
            Some(handler.clone()),
        );

        manager.notify_copy_complete(vec![item(1), item(2)]).unwrap();
        assert_eq!(*lock(&handler.copied), vec!["k1".to_string(), "k2".to_string()]);

        let mut released = StoreEnumerator::new(vec![item(3)]);
        released.release();
        assert!(matches!(released.next_item(), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn drained_manager_stops_delivering() {
        let handler = Arc::new(RecordingHandler::default());
        let manager = NotificationManager::new(
            NotificationMode::NonBlockingQuorumAcked,
            Some(handler.clone()),
        );

        manager.on_batch_applied(1, vec![item(1)]).unwrap();
        manager.drain();
        manager.on_quorum_advanced(10);

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(lock(&handler.delivered).is_empty());
    }
}
