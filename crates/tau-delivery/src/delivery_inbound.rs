//! Inbound buffer for messages that arrive while the channel is not connected.
//!
//! Entries are held FIFO with a TTL. A drain hands live entries to the
//! registered [`InboundProcessor`] one at a time, in arrival order, and never
//! holds the buffer lock across the processor call. A failing entry stays put
//! for the next drain and eventually ages out through the TTL sweep.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::delivery_config::InboundBufferConfig;
use crate::delivery_connection::{lock_unpoisoned, ConnectionStateMachine};
use crate::delivery_contract::{DeliveryContext, InboundProcessor};
use crate::delivery_error::{require_non_empty, DeliveryInputError};
use crate::delivery_time::{is_expired_at, SharedDeliveryClock};
use crate::delivery_trace::{
    DecisionTraceInput, DecisionTraceRecorder, TraceDecision, TraceReasonCode, TraceStage,
};

pub const INBOUND_MESSAGE_ID_MAX_CHARS: usize = 256;
pub const INBOUND_ADDRESS_MAX_CHARS: usize = 256;
pub const INBOUND_CONTENT_MAX_CHARS: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One buffered inbound item, owned by the buffer until hand-off or expiry.
pub struct QueuedInboundMessage {
    pub message_id: String,
    pub address: String,
    pub content: String,
    pub enqueued_at_unix_ms: u64,
    pub expires_at_unix_ms: u64,
    #[serde(default)]
    pub context: DeliveryContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `InboundEnqueueOutcome` values.
pub enum InboundEnqueueOutcome {
    Queued { expires_at_unix_ms: u64 },
    ProcessImmediately,
    Duplicate,
    Rejected { error: DeliveryInputError },
}

impl InboundEnqueueOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `InboundDrainStatus` values.
pub enum InboundDrainStatus {
    Completed,
    Busy,
    NoProcessor,
    Interrupted,
}

impl InboundDrainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Busy => "busy",
            Self::NoProcessor => "no_processor",
            Self::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
/// Public struct `InboundDrainReport` used across Tau components.
pub struct InboundDrainReport {
    pub status: InboundDrainStatus,
    pub processed: usize,
    pub expired: usize,
    pub failed: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Public struct `InboundBufferStats` used across Tau components.
pub struct InboundBufferStats {
    pub queued: usize,
    pub capacity: usize,
    pub ttl_ms: u64,
    pub oldest_enqueued_at_unix_ms: Option<u64>,
    pub next_expiry_at_unix_ms: Option<u64>,
    pub processor_registered: bool,
    pub draining: bool,
    pub enqueued_total: u64,
    pub drained_total: u64,
    pub expired_total: u64,
    pub evicted_total: u64,
    pub failed_total: u64,
    pub rejected_total: u64,
}

#[derive(Debug, Default)]
struct InboundCounters {
    enqueued: AtomicU64,
    drained: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// RAII claim on a busy flag; a second claimant gets `None` instead of waiting.
pub(crate) struct BusyFlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyFlagGuard<'a> {
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for BusyFlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// FIFO holding area for inbound messages received while disconnected.
pub struct InboundBuffer {
    config: InboundBufferConfig,
    connection: Arc<ConnectionStateMachine>,
    recorder: Arc<DecisionTraceRecorder>,
    clock: SharedDeliveryClock,
    entries: Mutex<VecDeque<QueuedInboundMessage>>,
    processor: Mutex<Option<Arc<dyn InboundProcessor>>>,
    draining: AtomicBool,
    sweeping: AtomicBool,
    counters: InboundCounters,
}

impl std::fmt::Debug for InboundBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundBuffer")
            .field("config", &self.config)
            .field("queued", &self.len())
            .finish_non_exhaustive()
    }
}

impl InboundBuffer {
    pub fn new(
        config: InboundBufferConfig,
        connection: Arc<ConnectionStateMachine>,
        recorder: Arc<DecisionTraceRecorder>,
        clock: SharedDeliveryClock,
    ) -> Self {
        Self {
            config,
            connection,
            recorder,
            clock,
            entries: Mutex::new(VecDeque::new()),
            processor: Mutex::new(None),
            draining: AtomicBool::new(false),
            sweeping: AtomicBool::new(false),
            counters: InboundCounters::default(),
        }
    }

    pub fn should_queue(&self) -> bool {
        !self.connection.is_connected()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, message_id: &str) -> bool {
        let message_id = message_id.trim();
        lock_unpoisoned(&self.entries)
            .iter()
            .any(|entry| entry.message_id == message_id)
    }

    pub(crate) fn held_expiry(&self, message_id: &str) -> Option<u64> {
        lock_unpoisoned(&self.entries)
            .iter()
            .find(|entry| entry.message_id == message_id)
            .map(|entry| entry.expires_at_unix_ms)
    }

    pub fn set_processor(&self, processor: Arc<dyn InboundProcessor>) {
        *lock_unpoisoned(&self.processor) = Some(processor);
    }

    pub fn processor(&self) -> Option<Arc<dyn InboundProcessor>> {
        lock_unpoisoned(&self.processor).clone()
    }

    pub fn clear_processor(&self) -> bool {
        lock_unpoisoned(&self.processor).take().is_some()
    }

    /// Buffers one inbound item unless the channel is connected.
    ///
    /// Malformed input is rejected before any state changes. At capacity the
    /// single oldest entry is evicted and traced.
    pub fn enqueue(
        &self,
        message_id: &str,
        address: &str,
        content: &str,
        context: DeliveryContext,
    ) -> InboundEnqueueOutcome {
        if let Err(error) = validate_inbound_fields(message_id, address, content) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            self.recorder.record(
                DecisionTraceInput::new(
                    message_id,
                    address,
                    TraceStage::InboundBuffer,
                    TraceDecision::Skip,
                    TraceReasonCode::InboundRejectedMalformed,
                )
                .with_detail(error.to_string())
                .with_context(&context),
            );
            return InboundEnqueueOutcome::Rejected { error };
        }
        if self.connection.is_connected() {
            return InboundEnqueueOutcome::ProcessImmediately;
        }
        let detail = format!("connection {}", self.connection.state());
        self.hold(message_id, address, content, context, &detail)
    }

    /// Buffers a validated item regardless of connection state. Used when a
    /// connected pipeline has nowhere to hand the item yet, or its processor
    /// just failed on it.
    pub(crate) fn hold(
        &self,
        message_id: &str,
        address: &str,
        content: &str,
        context: DeliveryContext,
        detail: &str,
    ) -> InboundEnqueueOutcome {
        let message_id = message_id.trim();
        let address = address.trim();
        let now_unix_ms = self.clock.now_unix_ms();
        let expires_at_unix_ms = now_unix_ms.saturating_add(self.config.ttl_ms);
        let mut evicted = Vec::new();
        {
            let mut entries = lock_unpoisoned(&self.entries);
            if entries.iter().any(|entry| entry.message_id == message_id) {
                drop(entries);
                self.recorder.record_deduped(message_id, address, &context);
                return InboundEnqueueOutcome::Duplicate;
            }
            while entries.len() >= self.config.capacity.max(1) {
                match entries.pop_front() {
                    Some(oldest) => evicted.push(oldest),
                    None => break,
                }
            }
            entries.push_back(QueuedInboundMessage {
                message_id: message_id.to_string(),
                address: address.to_string(),
                content: content.to_string(),
                enqueued_at_unix_ms: now_unix_ms,
                expires_at_unix_ms,
                context: context.clone(),
            });
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        for dropped in &evicted {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                message_id = %dropped.message_id,
                destination = %self.recorder.hash_destination(&dropped.address),
                capacity = self.config.capacity,
                "inbound buffer full, evicted oldest entry"
            );
            self.recorder.record(
                DecisionTraceInput::new(
                    &dropped.message_id,
                    &dropped.address,
                    TraceStage::InboundBuffer,
                    TraceDecision::Skip,
                    TraceReasonCode::InboundEvictedCapacity,
                )
                .with_detail(format!("capacity {} reached", self.config.capacity))
                .with_context(&dropped.context),
            );
        }
        self.recorder.record(
            DecisionTraceInput::new(
                message_id,
                address,
                TraceStage::InboundBuffer,
                TraceDecision::Defer,
                TraceReasonCode::InboundQueuedDisconnected,
            )
            .with_detail(detail)
            .with_next_eligible_at(Some(expires_at_unix_ms))
            .with_context(&context),
        );
        InboundEnqueueOutcome::Queued { expires_at_unix_ms }
    }

    /// Hands every buffered entry to the processor, oldest first.
    ///
    /// Only one drain runs at a time; a concurrent call reports `Busy`. The
    /// pass stops early when the connection leaves Connected.
    #[tracing::instrument(name = "tau_delivery.inbound.drain", skip(self))]
    pub async fn drain(&self) -> InboundDrainReport {
        let Some(_busy) = BusyFlagGuard::try_acquire(&self.draining) else {
            tracing::debug!("inbound drain already in progress");
            return self.report(InboundDrainStatus::Busy, 0, 0, 0);
        };
        let Some(processor) = self.processor() else {
            let remaining = self.len();
            if remaining > 0 {
                tracing::error!(
                    remaining,
                    "inbound drain skipped: no processor registered, entries stay buffered"
                );
            }
            return self.report(InboundDrainStatus::NoProcessor, 0, 0, 0);
        };

        let pending_ids = lock_unpoisoned(&self.entries)
            .iter()
            .map(|entry| entry.message_id.clone())
            .collect::<Vec<_>>();
        let mut processed = 0usize;
        let mut expired = 0usize;
        let mut failed = 0usize;

        for message_id in pending_ids {
            if !self.connection.is_connected() {
                tracing::info!(
                    processed,
                    state = %self.connection.state(),
                    "inbound drain interrupted by connection change"
                );
                return self.report(InboundDrainStatus::Interrupted, processed, expired, failed);
            }
            let now_unix_ms = self.clock.now_unix_ms();
            let candidate = {
                let mut entries = lock_unpoisoned(&self.entries);
                let Some(position) = entries
                    .iter()
                    .position(|entry| entry.message_id == message_id)
                else {
                    continue;
                };
                if is_expired_at(entries[position].expires_at_unix_ms, now_unix_ms) {
                    entries.remove(position).map(DrainCandidate::Expired)
                } else {
                    Some(DrainCandidate::Live(entries[position].clone()))
                }
            };
            match candidate {
                Some(DrainCandidate::Expired(entry)) => {
                    expired += 1;
                    self.trace_expired(&entry);
                }
                Some(DrainCandidate::Live(entry)) => match processor.process(&entry).await {
                    Ok(()) => {
                        self.remove_entry(&entry.message_id);
                        processed += 1;
                        self.counters.drained.fetch_add(1, Ordering::Relaxed);
                        self.recorder.record(
                            DecisionTraceInput::new(
                                &entry.message_id,
                                &entry.address,
                                TraceStage::InboundBuffer,
                                TraceDecision::Respond,
                                TraceReasonCode::InboundDrained,
                            )
                            .with_context(&entry.context),
                        );
                    }
                    Err(error) => {
                        failed += 1;
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            message_id = %entry.message_id,
                            error = %format!("{error:#}"),
                            "inbound processor failed, entry kept for next drain"
                        );
                        self.recorder.record(
                            DecisionTraceInput::new(
                                &entry.message_id,
                                &entry.address,
                                TraceStage::InboundBuffer,
                                TraceDecision::Defer,
                                TraceReasonCode::InboundProcessFailed,
                            )
                            .with_detail(format!("{error:#}"))
                            .with_next_eligible_at(Some(entry.expires_at_unix_ms))
                            .with_context(&entry.context),
                        );
                    }
                },
                None => {}
            }
        }
        let report = self.report(InboundDrainStatus::Completed, processed, expired, failed);
        tracing::debug!(
            processed,
            expired,
            failed,
            remaining = report.remaining,
            "inbound drain completed"
        );
        report
    }

    /// Removes and traces TTL-expired entries. Returns the number removed.
    #[tracing::instrument(name = "tau_delivery.inbound.sweep", skip(self))]
    pub fn sweep_expired(&self) -> usize {
        let Some(_busy) = BusyFlagGuard::try_acquire(&self.sweeping) else {
            return 0;
        };
        let now_unix_ms = self.clock.now_unix_ms();
        let expired = {
            let mut entries = lock_unpoisoned(&self.entries);
            let (expired, live): (VecDeque<_>, VecDeque<_>) = entries
                .drain(..)
                .partition(|entry| is_expired_at(entry.expires_at_unix_ms, now_unix_ms));
            *entries = live;
            expired
        };
        for entry in &expired {
            self.trace_expired(entry);
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "swept expired inbound entries");
        }
        expired.len()
    }

    /// Spawns the periodic TTL sweep on the current tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        let period = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                buffer.sweep_expired();
            }
        })
    }

    pub fn stats(&self) -> InboundBufferStats {
        let entries = lock_unpoisoned(&self.entries);
        InboundBufferStats {
            queued: entries.len(),
            capacity: self.config.capacity,
            ttl_ms: self.config.ttl_ms,
            oldest_enqueued_at_unix_ms: entries.front().map(|entry| entry.enqueued_at_unix_ms),
            next_expiry_at_unix_ms: entries.iter().map(|entry| entry.expires_at_unix_ms).min(),
            processor_registered: lock_unpoisoned(&self.processor).is_some(),
            draining: self.draining.load(Ordering::Acquire),
            enqueued_total: self.counters.enqueued.load(Ordering::Relaxed),
            drained_total: self.counters.drained.load(Ordering::Relaxed),
            expired_total: self.counters.expired.load(Ordering::Relaxed),
            evicted_total: self.counters.evicted.load(Ordering::Relaxed),
            failed_total: self.counters.failed.load(Ordering::Relaxed),
            rejected_total: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Drops a held copy once a fresh delivery of the same id was processed.
    pub(crate) fn release_held(&self, message_id: &str) -> bool {
        self.remove_entry(message_id)
    }

    fn remove_entry(&self, message_id: &str) -> bool {
        let mut entries = lock_unpoisoned(&self.entries);
        match entries
            .iter()
            .position(|entry| entry.message_id == message_id)
        {
            Some(position) => entries.remove(position).is_some(),
            None => false,
        }
    }

    fn trace_expired(&self, entry: &QueuedInboundMessage) {
        self.counters.expired.fetch_add(1, Ordering::Relaxed);
        self.recorder.record(
            DecisionTraceInput::new(
                &entry.message_id,
                &entry.address,
                TraceStage::InboundBuffer,
                TraceDecision::Skip,
                TraceReasonCode::InboundExpired,
            )
            .with_detail(format!("ttl {}ms elapsed", self.config.ttl_ms))
            .with_context(&entry.context),
        );
    }

    fn report(
        &self,
        status: InboundDrainStatus,
        processed: usize,
        expired: usize,
        failed: usize,
    ) -> InboundDrainReport {
        InboundDrainReport {
            status,
            processed,
            expired,
            failed,
            remaining: self.len(),
        }
    }
}

enum DrainCandidate {
    Expired(QueuedInboundMessage),
    Live(QueuedInboundMessage),
}

pub(crate) fn validate_inbound_fields(
    message_id: &str,
    address: &str,
    content: &str,
) -> Result<(), DeliveryInputError> {
    require_non_empty("message_id", message_id)?;
    require_non_empty("address", address)?;
    require_non_empty("content", content)?;
    for (field, value, max) in [
        ("message_id", message_id, INBOUND_MESSAGE_ID_MAX_CHARS),
        ("address", address, INBOUND_ADDRESS_MAX_CHARS),
        ("content", content, INBOUND_CONTENT_MAX_CHARS),
    ] {
        if value.chars().count() > max {
            return Err(DeliveryInputError::TooLong { field, max });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use super::*;
    use crate::delivery_config::DecisionTraceConfig;
    use crate::delivery_time::ManualDeliveryClock;
    use crate::delivery_trace::DecisionTraceFilter;
    use crate::delivery_trace_store::InMemoryDecisionTraceStore;

    #[derive(Default)]
    struct RecordingProcessor {
        seen: Mutex<Vec<String>>,
        fail_ids: Vec<String>,
    }

    impl RecordingProcessor {
        fn seen(&self) -> Vec<String> {
            lock_unpoisoned(&self.seen).clone()
        }
    }

    #[async_trait]
    impl InboundProcessor for RecordingProcessor {
        async fn process(&self, message: &QueuedInboundMessage) -> Result<()> {
            lock_unpoisoned(&self.seen).push(message.message_id.clone());
            if self.fail_ids.contains(&message.message_id) {
                bail!("processor rejected {}", message.message_id);
            }
            Ok(())
        }
    }

    struct Fixture {
        clock: Arc<ManualDeliveryClock>,
        connection: Arc<ConnectionStateMachine>,
        recorder: Arc<DecisionTraceRecorder>,
        buffer: InboundBuffer,
    }

    fn fixture(capacity: usize, ttl_ms: u64) -> Fixture {
        let clock = Arc::new(ManualDeliveryClock::new(1_000_000));
        let connection = Arc::new(ConnectionStateMachine::new(clock.clone()));
        let recorder = Arc::new(DecisionTraceRecorder::new(
            DecisionTraceConfig::default(),
            Arc::new(InMemoryDecisionTraceStore::default()),
            clock.clone(),
        ));
        let buffer = InboundBuffer::new(
            InboundBufferConfig {
                capacity,
                ttl_ms,
                ..InboundBufferConfig::default()
            },
            connection.clone(),
            recorder.clone(),
            clock.clone(),
        );
        Fixture {
            clock,
            connection,
            recorder,
            buffer,
        }
    }

    fn reason_count(recorder: &DecisionTraceRecorder, reason_code: TraceReasonCode) -> usize {
        recorder
            .summary(&DecisionTraceFilter {
                reason_code: Some(reason_code),
                ..DecisionTraceFilter::default()
            })
            .expect("summary")
            .total
    }

    #[test]
    fn unit_enqueue_rejects_malformed_input_without_mutation() {
        let fixture = fixture(10, 1_000);
        let outcome = fixture
            .buffer
            .enqueue(" ", "user-1", "hola", DeliveryContext::default());
        assert_eq!(
            outcome,
            InboundEnqueueOutcome::Rejected {
                error: DeliveryInputError::EmptyField {
                    field: "message_id"
                }
            }
        );
        let outcome = fixture
            .buffer
            .enqueue("m-1", "user-1", "", DeliveryContext::default());
        assert!(matches!(outcome, InboundEnqueueOutcome::Rejected { .. }));
        assert!(fixture.buffer.is_empty());
        assert_eq!(fixture.buffer.stats().rejected_total, 2);
    }

    #[test]
    fn unit_enqueue_while_connected_processes_immediately() {
        let fixture = fixture(10, 1_000);
        fixture.connection.set_connected().expect("connect");
        assert!(!fixture.buffer.should_queue());
        assert_eq!(
            fixture
                .buffer
                .enqueue("m-1", "user-1", "hola", DeliveryContext::default()),
            InboundEnqueueOutcome::ProcessImmediately
        );
        assert!(fixture.buffer.is_empty());
    }

    #[test]
    fn functional_enqueue_defers_with_expiry_and_rejects_duplicates() {
        let fixture = fixture(10, 5_000);
        let outcome = fixture
            .buffer
            .enqueue("m-1", "user-1", "hola", DeliveryContext::default());
        assert_eq!(
            outcome,
            InboundEnqueueOutcome::Queued {
                expires_at_unix_ms: 1_005_000
            }
        );
        assert_eq!(
            fixture
                .buffer
                .enqueue("m-1", "user-1", "hola", DeliveryContext::default()),
            InboundEnqueueOutcome::Duplicate
        );
        assert_eq!(fixture.buffer.len(), 1);

        let traces = fixture.recorder.by_message_id("m-1").expect("traces");
        let deferred = traces
            .iter()
            .find(|trace| trace.decision == TraceDecision::Defer)
            .expect("defer trace");
        assert_eq!(deferred.next_eligible_at_unix_ms, Some(1_005_000));
        assert_eq!(reason_count(&fixture.recorder, TraceReasonCode::DuplicateMessage), 1);
    }

    #[test]
    fn functional_capacity_evicts_single_oldest_entry() {
        let fixture = fixture(2, 60_000);
        for id in ["m-1", "m-2", "m-3"] {
            fixture
                .buffer
                .enqueue(id, "user-1", "hola", DeliveryContext::default());
        }
        assert_eq!(fixture.buffer.len(), 2);
        assert!(!fixture.buffer.contains("m-1"));
        assert!(fixture.buffer.contains("m-2"));
        assert!(fixture.buffer.contains("m-3"));
        assert_eq!(
            reason_count(&fixture.recorder, TraceReasonCode::InboundEvictedCapacity),
            1
        );
        assert_eq!(fixture.buffer.stats().evicted_total, 1);
    }

    #[test]
    fn regression_ttl_boundary_present_before_absent_after() {
        let fixture = fixture(10, 10_000);
        fixture
            .buffer
            .enqueue("m-1", "user-1", "hola", DeliveryContext::default());

        fixture.clock.advance(10_000 - 1);
        assert_eq!(fixture.buffer.sweep_expired(), 0);
        assert!(fixture.buffer.contains("m-1"));

        fixture.clock.advance(2);
        assert_eq!(fixture.buffer.sweep_expired(), 1);
        assert!(!fixture.buffer.contains("m-1"));
        let expired = fixture.recorder.by_message_id("m-1").expect("traces");
        assert!(expired.iter().any(|trace| {
            trace.decision == TraceDecision::Skip
                && trace.reason_code == TraceReasonCode::InboundExpired
        }));
    }

    #[tokio::test]
    async fn integration_reconnect_drains_buffered_messages_once_in_order() {
        let fixture = fixture(10, 60_000);
        let processor = Arc::new(RecordingProcessor::default());
        fixture.buffer.set_processor(processor.clone());
        fixture
            .connection
            .set_reconnecting("socket closed")
            .expect("reconnecting");
        for id in ["m-1", "m-2", "m-3"] {
            assert!(fixture
                .buffer
                .enqueue(id, "user-1", "hola", DeliveryContext::default())
                .is_queued());
        }
        fixture.connection.set_connected().expect("connect");

        let report = fixture.buffer.drain().await;
        assert_eq!(report.status, InboundDrainStatus::Completed);
        assert_eq!(report.processed, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(processor.seen(), vec!["m-1", "m-2", "m-3"]);

        let again = fixture.buffer.drain().await;
        assert_eq!(again.processed, 0);
        assert_eq!(processor.seen().len(), 3);
    }

    #[tokio::test]
    async fn functional_drain_without_processor_keeps_entries() {
        let fixture = fixture(10, 60_000);
        fixture
            .buffer
            .enqueue("m-1", "user-1", "hola", DeliveryContext::default());
        fixture.connection.set_connected().expect("connect");
        let report = fixture.buffer.drain().await;
        assert_eq!(report.status, InboundDrainStatus::NoProcessor);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn functional_drain_keeps_failed_entries_and_expires_stale_ones() {
        let fixture = fixture(10, 60_000);
        let processor = Arc::new(RecordingProcessor {
            fail_ids: vec!["m-2".to_string()],
            ..RecordingProcessor::default()
        });
        fixture.buffer.set_processor(processor.clone());
        fixture
            .buffer
            .enqueue("m-stale", "user-1", "hola", DeliveryContext::default());
        fixture.clock.advance(30_000);
        for id in ["m-1", "m-2", "m-3"] {
            fixture
                .buffer
                .enqueue(id, "user-1", "hola", DeliveryContext::default());
        }
        fixture.clock.advance(30_000);
        fixture.connection.set_connected().expect("connect");

        let report = fixture.buffer.drain().await;
        assert_eq!(report.status, InboundDrainStatus::Completed);
        assert_eq!(report.expired, 1);
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);
        assert!(fixture.buffer.contains("m-2"));
        assert_eq!(processor.seen(), vec!["m-1", "m-2", "m-3"]);
    }

    #[tokio::test]
    async fn regression_drain_stops_when_connection_drops() {
        let fixture = fixture(10, 60_000);
        fixture
            .buffer
            .set_processor(Arc::new(RecordingProcessor::default()));
        fixture
            .buffer
            .enqueue("m-1", "user-1", "hola", DeliveryContext::default());
        let report = fixture.buffer.drain().await;
        assert_eq!(report.status, InboundDrainStatus::Interrupted);
        assert_eq!(report.remaining, 1);
    }

    #[test]
    fn unit_busy_flag_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let first = BusyFlagGuard::try_acquire(&flag);
        assert!(first.is_some());
        assert!(BusyFlagGuard::try_acquire(&flag).is_none());
        drop(first);
        assert!(BusyFlagGuard::try_acquire(&flag).is_some());
    }
}
