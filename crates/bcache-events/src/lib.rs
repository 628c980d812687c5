//! Event Stream (core component 4.8): fire-and-forget broadcast of content
//! lifecycle changes (add/touch/delete) from cache sessions to interested
//! listeners, partitioned by sender so that two senders never serialize
//! behind one another, while a single sender's events are always applied in
//! the order its batches were published.
//!
//! The wire frame reuses this codebase's existing length-prefixed binary
//! frame idiom (magic + frame-type tag + payload length, then payload)
//! rather than inventing a new envelope. The RPC transport that actually
//! moves frames between processes is out of scope here: publishers and
//! subscribers are wired together through the `EventTransport` capability,
//! referenced only through its interface.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bcache_hash::ContentHash;
use bcache_storage::{bucket_of, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Magic bytes opening every event frame, mirroring this codebase's IPC
/// frame header.
pub const FRAME_MAGIC: [u8; 2] = *b"EV";
pub const FRAME_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("transient transport error: {0}")]
    Transient(String),
    #[error("terminal transport error: {0}")]
    Terminal(String),
}

pub type Result<T> = std::result::Result<T, EventError>;

impl From<EventError> for bcache_storage::StorageError {
    fn from(e: EventError) -> Self {
        match e {
            EventError::Transient(m) => bcache_storage::StorageError::Transient(m),
            other => bcache_storage::StorageError::Terminal(other.to_string()),
        }
    }
}

/// A single content lifecycle change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Add { path: String, hash: ContentHash, size: u64 },
    Touch { path: String, hash: ContentHash, size: u64 },
    Delete { path: String, hash: ContentHash },
}

/// An `Event` wrapped with the metadata needed to route, order, and
/// validate it: the epoch it was published under, the sender that produced
/// it, and an opaque operation id for tracing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub epoch: String,
    pub sender: String,
    pub operation_id: String,
    pub event: Event,
}

/// A published unit of work: one or more envelopes sharing a sequence
/// point. `last_seq` is the sequence point this batch completes; a
/// subscriber's `last_processed_sequence` only ever advances to a batch's
/// `last_seq` once every envelope in it has been applied.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventBatch {
    pub envelopes: Vec<EventEnvelope>,
    pub last_seq: u64,
}

/// Result of decoding one wire frame: the envelopes that decoded cleanly,
/// plus a count of envelopes that didn't. A single corrupted envelope must
/// not cost the rest of the batch, and the sequence point still advances
/// past it.
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    pub batch: EventBatch,
    pub decode_failures: usize,
}

pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
/// Conservative ceiling under which a batch is guaranteed to fit in one
/// frame; larger batches are split across multiple frames by the publisher
/// rather than widening the frame's length field.
pub const MAX_FRAME_PAYLOAD: usize = 60 * 1024;

/// How strictly a subscriber checks that decoded envelopes round-trip
/// through the codec before applying them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Skip validation entirely.
    Off,
    /// Validate and log a warning on mismatch, but still apply the event.
    Trace,
    /// Validate and drop (count, do not apply) on mismatch.
    Fail,
}

/// Pluggable wire encoding for a batch. The default, length-prefixed-span
/// codec frames each envelope with its own length inside the payload so a
/// decoder can skip a corrupt envelope without losing the rest of the
/// batch; the legacy codec encodes the whole batch as one `bincode` blob.
pub trait EventCodec: Send + Sync {
    fn encode(&self, batch: &EventBatch) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<DecodedBatch>;
}

pub struct SpanCodec;

impl EventCodec for SpanCodec {
    fn encode(&self, batch: &EventBatch) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&batch.last_seq.to_le_bytes());
        out.extend_from_slice(&(batch.envelopes.len() as u32).to_le_bytes());
        for envelope in &batch.envelopes {
            let span = bincode::serialize(envelope).map_err(|e| EventError::Encode(e.to_string()))?;
            out.extend_from_slice(&(span.len() as u32).to_le_bytes());
            out.extend_from_slice(&span);
        }
        if out.len() > MAX_FRAME_PAYLOAD {
            return Err(EventError::FrameTooLarge(out.len()));
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedBatch> {
        if bytes.len() < 12 {
            return Err(EventError::Decode("frame shorter than header".into()));
        }
        let last_seq = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let count = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let mut envelopes = Vec::with_capacity(count);
        let mut decode_failures = 0usize;
        let mut cursor = 12usize;
        for _ in 0..count {
            if cursor + 4 > bytes.len() {
                return Err(EventError::Decode("truncated span length".into()));
            }
            let len = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
            cursor += 4;
            if cursor + len > bytes.len() {
                return Err(EventError::Decode("truncated span body".into()));
            }
            // A corrupt individual span only costs that one envelope: the
            // frame's remaining spans are still well-formed and the
            // sequence point this batch completes must still advance.
            match bincode::deserialize::<EventEnvelope>(&bytes[cursor..cursor + len]) {
                Ok(envelope) => envelopes.push(envelope),
                Err(_) => decode_failures += 1,
            }
            cursor += len;
        }
        Ok(DecodedBatch {
            batch: EventBatch { envelopes, last_seq },
            decode_failures,
        })
    }
}

pub struct LegacyCodec;

impl EventCodec for LegacyCodec {
    fn encode(&self, batch: &EventBatch) -> Result<Vec<u8>> {
        bincode::serialize(batch).map_err(|e| EventError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<DecodedBatch> {
        let batch = bincode::deserialize(bytes).map_err(|e| EventError::Decode(e.to_string()))?;
        Ok(DecodedBatch {
            batch,
            decode_failures: 0,
        })
    }
}

/// Out-of-process delivery of an encoded frame. Deliberately minimal: the
/// actual RPC client/server pairing this talks to is out of scope here.
pub trait EventTransport: Send + Sync {
    fn send_frame(&self, bytes: &[u8]) -> Result<()>;
}

/// Publishes batches of events under a fixed epoch and sender id, retrying
/// transient transport failures with the same bounded backoff used by the
/// Blob Storage Adapter.
pub struct Publisher<T: EventTransport> {
    transport: T,
    codec: Arc<dyn EventCodec>,
    epoch: String,
    sender: String,
    retry: RetryPolicy,
    max_batch_size: usize,
}

impl<T: EventTransport> Publisher<T> {
    pub fn new(transport: T, epoch: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            transport,
            codec: Arc::new(SpanCodec),
            epoch: epoch.into(),
            sender: sender.into(),
            retry: RetryPolicy::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn EventCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Publish `events` as one or more batches (chunked to `max_batch_size`),
    /// each carrying a monotonically increasing sequence point derived from
    /// `next_seq`. Returns the last sequence point published.
    pub fn publish(&self, events: &[Event], next_seq: impl Fn() -> u64) -> Result<u64> {
        let mut last_seq = 0;
        for chunk in events.chunks(self.max_batch_size.max(1)) {
            let envelopes = chunk
                .iter()
                .map(|event| EventEnvelope {
                    epoch: self.epoch.clone(),
                    sender: self.sender.clone(),
                    operation_id: uuid::Uuid::new_v4().to_string(),
                    event: event.clone(),
                })
                .collect();
            last_seq = next_seq();
            let batch = EventBatch { envelopes, last_seq };
            let bytes = self.codec.encode(&batch)?;
            self.retry
                .run(|_attempt| {
                    self.transport
                        .send_frame(&bytes)
                        .map_err(bcache_storage::StorageError::from)
                })
                .map_err(|e| EventError::Terminal(e.to_string()))?;
        }
        Ok(last_seq)
    }
}

/// Shared completion counter for one published batch: decremented as each
/// envelope finishes processing (success or failure both count), and
/// marked `done` once it reaches zero. The subscriber's advance routine
/// only pops a batch off `pending_queue` once its `done` flag is set.
struct SharedState {
    remaining: AtomicUsize,
    done: AtomicBool,
    seq: u64,
}

impl SharedState {
    fn new(count: usize, seq: u64) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            done: AtomicBool::new(count == 0),
            seq,
        }
    }

    /// Returns true the instant this call observes the last outstanding
    /// envelope complete.
    fn complete_one(&self) -> bool {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.done.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SubscriberMetrics {
    pub applied: u64,
    pub dropped_epoch_mismatch: u64,
    pub dropped_decode_failure: u64,
}

/// Lifecycle state of a `Subscriber`, per SPEC_FULL §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Idle,
    Processing,
    Suspended,
    Stopped,
}

type PartitionItem = (EventEnvelope, Arc<SharedState>);

struct Inner {
    state: Mutex<SubscriberState>,
    pending_queue: Mutex<VecDeque<Arc<SharedState>>>,
    last_processed_sequence: AtomicU64,
    advancing: AtomicBool,
    epoch: Mutex<String>,
    metrics: Mutex<SubscriberMetrics>,
    senders: Mutex<Vec<mpsc::Sender<PartitionItem>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Consumes batches handed to it by `dispatch_batch`, fanning each
/// envelope out to one of `partitions` single-threaded workers keyed by
/// `hash(sender) % partitions`, so that one sender's events are always
/// applied in publish order while unrelated senders never block each
/// other. Advancing `last_processed_sequence` is gated by a
/// compare-and-swap so only one task at a time walks `pending_queue`.
pub struct Subscriber {
    inner: Arc<Inner>,
    codec: Arc<dyn EventCodec>,
    validation: ValidationMode,
    partitions: usize,
    channel_capacity: usize,
    handler: Arc<dyn Fn(&Event) + Send + Sync>,
}

impl Subscriber {
    pub fn new(
        partitions: usize,
        channel_capacity: usize,
        handler: Arc<dyn Fn(&Event) + Send + Sync>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SubscriberState::Idle),
                pending_queue: Mutex::new(VecDeque::new()),
                last_processed_sequence: AtomicU64::new(0),
                advancing: AtomicBool::new(false),
                epoch: Mutex::new(String::new()),
                metrics: Mutex::new(SubscriberMetrics::default()),
                senders: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
            codec: Arc::new(SpanCodec),
            validation: ValidationMode::Fail,
            partitions: partitions.max(1),
            channel_capacity: channel_capacity.max(1),
            handler,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn EventCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_validation(mut self, mode: ValidationMode) -> Self {
        self.validation = mode;
        self
    }

    pub fn state(&self) -> SubscriberState {
        *self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn last_processed_sequence(&self) -> u64 {
        self.inner.last_processed_sequence.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> SubscriberMetrics {
        *self.inner.metrics.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Transition Idle/Suspended -> Processing, seeding
    /// `last_processed_sequence` and spawning one worker task per
    /// partition. A no-op if already `Processing`.
    pub fn start(&self, epoch: impl Into<String>, seed_seq: u64) {
        let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state == SubscriberState::Processing {
            return;
        }
        *self.inner.epoch.lock().unwrap_or_else(|p| p.into_inner()) = epoch.into();
        self.inner
            .last_processed_sequence
            .store(seed_seq, Ordering::Release);

        let mut senders = self.inner.senders.lock().unwrap_or_else(|p| p.into_inner());
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
        senders.clear();
        tasks.clear();
        for _ in 0..self.partitions {
            let (tx, rx) = mpsc::channel(self.channel_capacity);
            senders.push(tx);
            tasks.push(spawn_partition_worker(
                rx,
                self.inner.clone(),
                self.handler.clone(),
                self.validation,
            ));
        }
        *state = SubscriberState::Processing;
    }

    /// Transition Processing -> Suspended: aborts in-flight partition
    /// workers and drops anything still queued. Events already applied
    /// stay applied; `last_processed_sequence` is not rewound.
    pub fn suspend(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != SubscriberState::Processing {
            return;
        }
        for task in self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
        self.inner.senders.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.inner.pending_queue.lock().unwrap_or_else(|p| p.into_inner()).clear();
        *state = SubscriberState::Suspended;
    }

    /// Transition any state -> Stopped, permanently.
    pub fn stop(&self) {
        for task in self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
        self.inner.senders.lock().unwrap_or_else(|p| p.into_inner()).clear();
        *self.inner.state.lock().unwrap_or_else(|p| p.into_inner()) = SubscriberState::Stopped;
    }

    /// Decode and fan out one wire frame. The batch's `SharedState` is
    /// pushed onto `pending_queue` before any envelope is handed to a
    /// partition, so the advance routine always has a gate to wait on even
    /// if dispatch itself is still in progress (per the out-of-order
    /// publish / in-order advance property).
    pub async fn dispatch_frame(&self, bytes: &[u8]) -> Result<()> {
        let decoded = self.codec.decode(bytes)?;
        if decoded.decode_failures > 0 {
            self.inner
                .metrics
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .dropped_decode_failure += decoded.decode_failures as u64;
        }
        self.dispatch_batch(decoded.batch).await;
        Ok(())
    }

    pub async fn dispatch_batch(&self, batch: EventBatch) {
        if self.state() != SubscriberState::Processing {
            return;
        }
        let shared = Arc::new(SharedState::new(batch.envelopes.len(), batch.last_seq));
        self.inner
            .pending_queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(shared.clone());

        if batch.envelopes.is_empty() {
            try_advance(&self.inner);
            return;
        }

        let senders: Vec<_> = self
            .inner
            .senders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if senders.is_empty() {
            return;
        }
        for envelope in batch.envelopes {
            let partition = bucket_of(&envelope.sender, senders.len());
            let tx = senders[partition].clone();
            let shared = shared.clone();
            if tx.send((envelope, shared.clone())).await.is_err() {
                // Worker gone (suspended/stopped mid-dispatch): count the
                // envelope as handled so the batch can still complete.
                if shared.complete_one() {
                    try_advance(&self.inner);
                }
            }
        }
    }
}

/// Structural check applied after decode: the codec already guarantees the
/// bytes deserialized into an `EventEnvelope`, but a Trace/Fail subscriber
/// still wants to catch an envelope that deserialized fine yet carries
/// nonsensical fields (an empty path, an empty operation id).
fn validate_envelope(envelope: &EventEnvelope) -> std::result::Result<(), &'static str> {
    if envelope.operation_id.is_empty() {
        return Err("empty operation id");
    }
    let path = match &envelope.event {
        Event::Add { path, .. } | Event::Touch { path, .. } | Event::Delete { path, .. } => path,
    };
    if path.is_empty() {
        return Err("empty path");
    }
    Ok(())
}

fn spawn_partition_worker(
    mut rx: mpsc::Receiver<PartitionItem>,
    inner: Arc<Inner>,
    handler: Arc<dyn Fn(&Event) + Send + Sync>,
    validation: ValidationMode,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((envelope, shared)) = rx.recv().await {
            let current_epoch = inner.epoch.lock().unwrap_or_else(|p| p.into_inner()).clone();
            if envelope.epoch != current_epoch {
                inner.metrics.lock().unwrap_or_else(|p| p.into_inner()).dropped_epoch_mismatch += 1;
            } else {
                match validation {
                    ValidationMode::Off => {
                        (handler)(&envelope.event);
                        inner.metrics.lock().unwrap_or_else(|p| p.into_inner()).applied += 1;
                    }
                    ValidationMode::Trace => {
                        if let Err(reason) = validate_envelope(&envelope) {
                            tracing::warn!(operation_id = %envelope.operation_id, %reason, "event validation discrepancy");
                        }
                        (handler)(&envelope.event);
                        inner.metrics.lock().unwrap_or_else(|p| p.into_inner()).applied += 1;
                    }
                    ValidationMode::Fail => {
                        if let Err(reason) = validate_envelope(&envelope) {
                            tracing::warn!(operation_id = %envelope.operation_id, %reason, "rejecting invalid event");
                            inner.metrics.lock().unwrap_or_else(|p| p.into_inner()).dropped_decode_failure += 1;
                        } else {
                            (handler)(&envelope.event);
                            inner.metrics.lock().unwrap_or_else(|p| p.into_inner()).applied += 1;
                        }
                    }
                }
            }
            if shared.complete_one() {
                try_advance(&inner);
            }
        }
    })
}

/// Walk `pending_queue` from the front, advancing
/// `last_processed_sequence` past every contiguously-complete batch.
/// Guarded by a compare-and-swap so at most one caller runs this at a
/// time; a caller that loses the race simply returns, trusting the
/// winner to observe its own completion too (it already pushed before
/// returning).
fn try_advance(inner: &Arc<Inner>) {
    if inner
        .advancing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    loop {
        let mut queue = inner.pending_queue.lock().unwrap_or_else(|p| p.into_inner());
        match queue.front() {
            Some(front) if front.done.load(Ordering::Acquire) => {
                inner
                    .last_processed_sequence
                    .store(front.seq, Ordering::Release);
                queue.pop_front();
            }
            _ => break,
        }
    }
    inner.advancing.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    struct LoopbackTransport(std_mpsc::Sender<Vec<u8>>);

    impl EventTransport for LoopbackTransport {
        fn send_frame(&self, bytes: &[u8]) -> Result<()> {
            self.0.send(bytes.to_vec()).unwrap();
            Ok(())
        }
    }

    fn sample_event(n: u64) -> Event {
        Event::Add {
            path: format!("file-{n}"),
            hash: ContentHash::from_blake3(blake3::hash(n.to_le_bytes().as_slice())),
            size: n,
        }
    }

    #[test]
    fn span_codec_round_trips() {
        let codec = SpanCodec;
        let batch = EventBatch {
            envelopes: vec![EventEnvelope {
                epoch: "e1".into(),
                sender: "s1".into(),
                operation_id: "op1".into(),
                event: sample_event(1),
            }],
            last_seq: 7,
        };
        let bytes = codec.encode(&batch).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.batch.last_seq, 7);
        assert_eq!(decoded.batch.envelopes.len(), 1);
        assert_eq!(decoded.decode_failures, 0);
    }

    #[test]
    fn span_codec_tolerates_one_corrupt_span() {
        let codec = SpanCodec;
        let batch = EventBatch {
            envelopes: vec![
                EventEnvelope {
                    epoch: "e1".into(),
                    sender: "s1".into(),
                    operation_id: "op1".into(),
                    event: sample_event(1),
                },
                EventEnvelope {
                    epoch: "e1".into(),
                    sender: "s1".into(),
                    operation_id: "op2".into(),
                    event: sample_event(2),
                },
            ],
            last_seq: 9,
        };
        let mut bytes = codec.encode(&batch).unwrap();
        // Flip a byte inside the first span's body to corrupt it without
        // touching the header or the second span's bytes.
        bytes[12] ^= 0xff;

        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.batch.last_seq, 9);
        assert_eq!(decoded.decode_failures, 1);
        assert_eq!(decoded.batch.envelopes.len(), 1);
    }

    #[test]
    fn publisher_chunks_and_retries() {
        let (tx, rx) = std_mpsc::channel();
        let publisher = Publisher::new(LoopbackTransport(tx), "e1", "sender-a");
        let events: Vec<_> = (0..5).map(sample_event).collect();
        let mut seq = 0u64;
        let last = publisher.publish(&events, || {
            seq += 1;
            seq
        }).unwrap();
        assert_eq!(last, 1);
        let frame = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let decoded = SpanCodec.decode(&frame).unwrap();
        assert_eq!(decoded.batch.envelopes.len(), 5);
    }

    #[tokio::test]
    async fn out_of_order_dispatch_advances_in_order() {
        let applied = Arc::new(StdAtomicUsize::new(0));
        let applied2 = applied.clone();
        let subscriber = Subscriber::new(4, 16, Arc::new(move |_event: &Event| {
            applied2.fetch_add(1, Ordering::SeqCst);
        }));
        subscriber.start("epoch-1", 0);

        let batch_a = EventBatch {
            envelopes: vec![EventEnvelope {
                epoch: "epoch-1".into(),
                sender: "sender-a".into(),
                operation_id: "op-a".into(),
                event: sample_event(1),
            }],
            last_seq: 1,
        };
        let batch_b = EventBatch {
            envelopes: vec![EventEnvelope {
                epoch: "epoch-1".into(),
                sender: "sender-b".into(),
                operation_id: "op-b".into(),
                event: sample_event(2),
            }],
            last_seq: 2,
        };

        // Dispatch batch 2 before batch 1 completes processing; the
        // pending_queue still advances in publish order only once batch 1
        // finishes.
        subscriber.dispatch_batch(batch_a).await;
        subscriber.dispatch_batch(batch_b).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(subscriber.last_processed_sequence(), 2);
        assert_eq!(applied.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn epoch_mismatch_is_dropped_not_applied() {
        let applied = Arc::new(StdAtomicUsize::new(0));
        let applied2 = applied.clone();
        let subscriber = Subscriber::new(2, 16, Arc::new(move |_e: &Event| {
            applied2.fetch_add(1, Ordering::SeqCst);
        }));
        subscriber.start("epoch-2", 0);

        let batch = EventBatch {
            envelopes: vec![EventEnvelope {
                epoch: "epoch-stale".into(),
                sender: "sender-a".into(),
                operation_id: "op".into(),
                event: sample_event(9),
            }],
            last_seq: 5,
        };
        subscriber.dispatch_batch(batch).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(applied.load(Ordering::SeqCst), 0);
        assert_eq!(subscriber.metrics().dropped_epoch_mismatch, 1);
        assert_eq!(subscriber.last_processed_sequence(), 5);
    }

    #[tokio::test]
    async fn fail_mode_drops_structurally_invalid_envelope() {
        let applied = Arc::new(StdAtomicUsize::new(0));
        let applied2 = applied.clone();
        let subscriber = Subscriber::new(1, 8, Arc::new(move |_e: &Event| {
            applied2.fetch_add(1, Ordering::SeqCst);
        }))
        .with_validation(ValidationMode::Fail);
        subscriber.start("e", 0);

        let batch = EventBatch {
            envelopes: vec![EventEnvelope {
                epoch: "e".into(),
                sender: "s".into(),
                operation_id: String::new(),
                event: sample_event(1),
            }],
            last_seq: 1,
        };
        subscriber.dispatch_batch(batch).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(applied.load(Ordering::SeqCst), 0);
        assert_eq!(subscriber.metrics().dropped_decode_failure, 1);
        assert_eq!(subscriber.last_processed_sequence(), 1);
    }

    #[tokio::test]
    async fn trace_mode_applies_despite_invalid_envelope() {
        let applied = Arc::new(StdAtomicUsize::new(0));
        let applied2 = applied.clone();
        let subscriber = Subscriber::new(1, 8, Arc::new(move |_e: &Event| {
            applied2.fetch_add(1, Ordering::SeqCst);
        }))
        .with_validation(ValidationMode::Trace);
        subscriber.start("e", 0);

        let batch = EventBatch {
            envelopes: vec![EventEnvelope {
                epoch: "e".into(),
                sender: "s".into(),
                operation_id: String::new(),
                event: sample_event(1),
            }],
            last_seq: 1,
        };
        subscriber.dispatch_batch(batch).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert_eq!(subscriber.metrics().applied, 1);
    }

    #[tokio::test]
    async fn suspend_then_restart_resets_workers() {
        let subscriber = Subscriber::new(2, 8, Arc::new(|_e: &Event| {}));
        subscriber.start("e", 0);
        assert_eq!(subscriber.state(), SubscriberState::Processing);
        subscriber.suspend();
        assert_eq!(subscriber.state(), SubscriberState::Suspended);
        subscriber.start("e", 10);
        assert_eq!(subscriber.state(), SubscriberState::Processing);
        assert_eq!(subscriber.last_processed_sequence(), 10);
    }
}
