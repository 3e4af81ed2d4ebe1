//! The wire replicator seam.
//!
//! The engine consumes a replicator that assigns LSNs, moves opaque
//! operation buffers, and exposes the copy and replication streams on
//! secondaries. `loopback` provides an in-process implementation wiring a
//! primary to its secondaries over channels, used by the integration tests
//! and by embedders that host all replicas in one process.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::{CResult, Error};
use crate::local::Lsn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultType {
    Transient,
    Permanent,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicationQueueCounters {
    pub queued_bytes: u64,
    pub queued_operation_count: u64,
}

/// An in-flight replication: the LSN assigned synchronously and the
/// completion that resolves once a quorum acks.
pub struct PendingReplication {
    pub lsn: Lsn,
    pub completion: oneshot::Receiver<CResult<Lsn>>,
}

/// The wire replicator as seen by a replica.
pub trait StateReplicator: Send + Sync {
    /// Hands a serialized operation buffer to the replicator. Returns the
    /// assigned LSN immediately; the completion resolves on quorum ack.
    fn begin_replicate(&self, payload: Vec<u8>) -> CResult<PendingReplication>;

    /// The copy stream pumped while building. Taken once.
    fn get_copy_stream(&self) -> CResult<OperationStream>;

    /// The replication stream pumped after copy. Taken once.
    fn get_replication_stream(&self) -> CResult<OperationStream>;

    /// Reports a replica fault to the hosting runtime.
    fn report_fault(&self, fault: FaultType);

    fn get_queue_counters(&self) -> ReplicationQueueCounters;

    fn last_quorum_acked_lsn(&self) -> Lsn;
}

/// One operation pumped from a stream. A `None` payload is the end-of-stream
/// sentinel; it still must be acked.
pub struct InboundOperation {
    pub lsn: Lsn,
    payload: Option<Vec<u8>>,
    acker: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl InboundOperation {
    pub fn new(lsn: Lsn, payload: Option<Vec<u8>>) -> Self {
        InboundOperation { lsn, payload, acker: None }
    }

    pub fn with_ack(lsn: Lsn, payload: Option<Vec<u8>>, acker: Box<dyn FnOnce() + Send + Sync>) -> Self {
        InboundOperation { lsn, payload, acker: Some(acker) }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.payload.is_none()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Acknowledges the operation back to the replicator.
    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker();
        }
    }
}

struct StreamShared {
    faulted: AtomicBool,
    notify: Notify,
}

/// Sender half of an operation stream.
#[derive(Clone)]
pub struct OperationSender {
    tx: mpsc::UnboundedSender<InboundOperation>,
    shared: Arc<StreamShared>,
}

impl OperationSender {
    pub fn send(&self, op: InboundOperation) -> CResult<()> {
        if self.shared.faulted.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("stream faulted".to_string()));
        }
        self.tx
            .send(op)
            .map_err(|_| Error::InvalidState("stream receiver dropped".to_string()))
    }

    pub fn send_end_of_stream(&self, lsn: Lsn) -> CResult<()> {
        self.send(InboundOperation::new(lsn, None))
    }

    pub fn is_faulted(&self) -> bool {
        self.shared.faulted.load(Ordering::SeqCst)
    }
}

/// Receiver half of an operation stream.
///
/// After `report_fault`, already-buffered operations keep draining and
/// `get_operation` returns `None` once the buffer is empty, which lets the
/// pump finish acking without restarting the replica.
pub struct OperationStream {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundOperation>>,
    shared: Arc<StreamShared>,
}

impl OperationStream {
    pub fn channel() -> (OperationSender, OperationStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(StreamShared {
            faulted: AtomicBool::new(false),
            notify: Notify::new(),
        });
        (
            OperationSender { tx, shared: shared.clone() },
            OperationStream { rx: tokio::sync::Mutex::new(rx), shared },
        )
    }

    /// Next operation, or `None` when the stream is closed or faulted dry.
    pub async fn get_operation(&self) -> CResult<Option<InboundOperation>> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.try_recv() {
                Ok(op) => return Ok(Some(op)),
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(None),
                Err(mpsc::error::TryRecvError::Empty) => {
                    if self.shared.faulted.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                    tokio::select! {
                        op = rx.recv() => return Ok(op),
                        _ = self.shared.notify.notified() => continue,
                    }
                }
            }
        }
    }

    /// Faults the stream: buffered operations still drain, then the stream
    /// reports end.
    pub fn report_fault(&self) {
        self.shared.faulted.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn is_faulted(&self) -> bool {
        self.shared.faulted.load(Ordering::SeqCst)
    }
}

pub mod loopback {
    //! A channel-backed replicator connecting one primary to its
    //! secondaries inside a single process.

    use super::*;

    struct AckState {
        remaining: AtomicUsize,
        completion: Mutex<Option<oneshot::Sender<CResult<Lsn>>>>,
    }

    struct PrimaryInner {
        next_lsn: AtomicI64,
        last_quorum_acked: AtomicI64,
        /// Acks required from secondaries before a replication completes.
        quorum_ack_count: usize,
        secondaries: Mutex<Vec<OperationSender>>,
        queued_bytes: AtomicU64,
        queued_ops: AtomicU64,
        faults: Mutex<Vec<FaultType>>,
    }

    /// The primary-side replicator handle.
    #[derive(Clone)]
    pub struct LoopbackReplicator {
        inner: Arc<PrimaryInner>,
    }

    impl LoopbackReplicator {
        /// `start_lsn` is the highest LSN already committed; the first
        /// replication is assigned `start_lsn + 1`. `quorum_ack_count` is
        /// how many secondary acks complete a replication (0 acks
        /// immediately, for single-replica configurations).
        pub fn new(start_lsn: Lsn, quorum_ack_count: usize) -> Self {
            LoopbackReplicator {
                inner: Arc::new(PrimaryInner {
                    next_lsn: AtomicI64::new(start_lsn),
                    last_quorum_acked: AtomicI64::new(start_lsn),
                    quorum_ack_count,
                    secondaries: Mutex::new(Vec::new()),
                    queued_bytes: AtomicU64::new(0),
                    queued_ops: AtomicU64::new(0),
                    faults: Mutex::new(Vec::new()),
                }),
            }
        }

        /// Registers a secondary and returns its replicator view plus the
        /// control handle used to feed its copy stream.
        pub fn attach_secondary(&self) -> (LoopbackSecondary, SecondaryControl) {
            let (copy_tx, copy_rx) = OperationStream::channel();
            let (repl_tx, repl_rx) = OperationStream::channel();

            lock(&self.inner.secondaries).push(repl_tx.clone());

            let secondary = LoopbackSecondary {
                inner: Arc::new(SecondaryInner {
                    copy: Mutex::new(Some(copy_rx)),
                    replication: Mutex::new(Some(repl_rx)),
                    primary: self.inner.clone(),
                    faults: Mutex::new(Vec::new()),
                }),
            };
            let control = SecondaryControl { copy_tx, repl_tx };
            (secondary, control)
        }

        pub fn reported_faults(&self) -> Vec<FaultType> {
            lock(&self.inner.faults).clone()
        }
    }

    impl StateReplicator for LoopbackReplicator {
        fn begin_replicate(&self, payload: Vec<u8>) -> CResult<PendingReplication> {
            let inner = &self.inner;
            let lsn = inner.next_lsn.fetch_add(1, Ordering::SeqCst) + 1;
            let (tx, rx) = oneshot::channel();

            let subs = lock(&inner.secondaries).clone();
            let needed = inner.quorum_ack_count.min(subs.len());

            if needed == 0 {
                inner.last_quorum_acked.fetch_max(lsn, Ordering::SeqCst);
                let _ = tx.send(Ok(lsn));
                return Ok(PendingReplication { lsn, completion: rx });
            }

            inner.queued_bytes.fetch_add(payload.len() as u64, Ordering::SeqCst);
            inner.queued_ops.fetch_add(1, Ordering::SeqCst);

            let ack_state = Arc::new(AckState {
                remaining: AtomicUsize::new(needed),
                completion: Mutex::new(Some(tx)),
            });

            let payload_len = payload.len() as u64;
            for sub in subs {
                let ack_state_cb = ack_state.clone();
                let ack_state = ack_state.clone();
                let primary = inner.clone();
                let op = InboundOperation::with_ack(
                    lsn,
                    Some(payload.clone()),
                    Box::new(move || {
                        if ack_state_cb.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                            primary.last_quorum_acked.fetch_max(lsn, Ordering::SeqCst);
                            primary
                                .queued_bytes
                                .fetch_sub(payload_len, Ordering::SeqCst);
                            primary.queued_ops.fetch_sub(1, Ordering::SeqCst);
                            if let Some(tx) = lock(&ack_state_cb.completion).take() {
                                let _ = tx.send(Ok(lsn));
                            }
                        }
                    }),
                );
                // A faulted or detached secondary counts as acked so the
                // remaining quorum can still complete.
                if sub.send(op).is_err() {
                    if ack_state.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                        inner.last_quorum_acked.fetch_max(lsn, Ordering::SeqCst);
                        inner.queued_bytes.fetch_sub(payload_len, Ordering::SeqCst);
                        inner.queued_ops.fetch_sub(1, Ordering::SeqCst);
                        if let Some(tx) = lock(&ack_state.completion).take() {
                            let _ = tx.send(Ok(lsn));
                        }
                    }
                }
            }

            Ok(PendingReplication { lsn, completion: rx })
        }

        fn get_copy_stream(&self) -> CResult<OperationStream> {
            Err(Error::InvalidOperation("primary has no copy stream".to_string()))
        }

        fn get_replication_stream(&self) -> CResult<OperationStream> {
            Err(Error::InvalidOperation("primary has no replication stream".to_string()))
        }

        fn report_fault(&self, fault: FaultType) {
            log::warn!("loopback primary fault reported: {:?}", fault);
            lock(&self.inner.faults).push(fault);
        }

        fn get_queue_counters(&self) -> ReplicationQueueCounters {
            ReplicationQueueCounters {
                queued_bytes: self.inner.queued_bytes.load(Ordering::SeqCst),
                queued_operation_count: self.inner.queued_ops.load(Ordering::SeqCst),
            }
        }

        fn last_quorum_acked_lsn(&self) -> Lsn {
            self.inner.last_quorum_acked.load(Ordering::SeqCst)
        }
    }

    struct SecondaryInner {
        copy: Mutex<Option<OperationStream>>,
        replication: Mutex<Option<OperationStream>>,
        primary: Arc<PrimaryInner>,
        faults: Mutex<Vec<FaultType>>,
    }

    /// A secondary's view of the replicator.
    #[derive(Clone)]
    pub struct LoopbackSecondary {
        inner: Arc<SecondaryInner>,
    }

    impl LoopbackSecondary {
        pub fn reported_faults(&self) -> Vec<FaultType> {
            lock(&self.inner.faults).clone()
        }
    }

    impl StateReplicator for LoopbackSecondary {
        fn begin_replicate(&self, _payload: Vec<u8>) -> CResult<PendingReplication> {
            Err(Error::NotPrimary)
        }

        fn get_copy_stream(&self) -> CResult<OperationStream> {
            lock(&self.inner.copy)
                .take()
                .ok_or_else(|| Error::InvalidState("copy stream already taken".to_string()))
        }

        fn get_replication_stream(&self) -> CResult<OperationStream> {
            lock(&self.inner.replication)
                .take()
                .ok_or_else(|| Error::InvalidState("replication stream already taken".to_string()))
        }

        fn report_fault(&self, fault: FaultType) {
            log::warn!("loopback secondary fault reported: {:?}", fault);
            lock(&self.inner.faults).push(fault);
        }

        fn get_queue_counters(&self) -> ReplicationQueueCounters {
            ReplicationQueueCounters::default()
        }

        fn last_quorum_acked_lsn(&self) -> Lsn {
            self.inner.primary.last_quorum_acked.load(Ordering::SeqCst)
        }
    }

    /// Harness handle for one attached secondary: feeds the copy stream and
    /// terminates the replication stream.
    pub struct SecondaryControl {
        copy_tx: OperationSender,
        repl_tx: OperationSender,
    }

    impl SecondaryControl {
        pub fn send_copy_operation(&self, lsn: Lsn, payload: Vec<u8>) -> CResult<()> {
            self.copy_tx.send(InboundOperation::new(lsn, Some(payload)))
        }

        /// Injects an operation directly into the replication stream,
        /// bypassing `begin_replicate`. Used by harnesses that replay a
        /// stream without a live primary.
        pub fn send_replication_operation(&self, lsn: Lsn, payload: Vec<u8>) -> CResult<()> {
            self.repl_tx.send(InboundOperation::new(lsn, Some(payload)))
        }

        pub fn send_copy_end_of_stream(&self, lsn: Lsn) -> CResult<()> {
            self.copy_tx.send_end_of_stream(lsn)
        }

        pub fn send_replication_end_of_stream(&self, lsn: Lsn) -> CResult<()> {
            self.repl_tx.send_end_of_stream(lsn)
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
