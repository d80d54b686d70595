//! Priority follow-up scheduler.
//!
//! Holds at most one pending follow-up per destination. Each entry owns a
//! tokio timer whose `AbortHandle` lives next to it in the map; every timer
//! carries the entry generation it was armed for, so a fire that races a
//! removal or an upgrade finds a different generation and does nothing.
//! An entry also owns a cancellation token that is tripped when it leaves the
//! map, which stops a send already waiting in the gate's pacing delay.
//! The admission gate is the only send path.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::delivery_config::FollowUpSchedulerConfig;
use crate::delivery_connection::lock_unpoisoned;
use crate::delivery_contract::{DeliveryContext, MessageKind, SessionStore};
use crate::delivery_error::require_non_empty;
use crate::delivery_gate::{
    AdmissionGate, DeliveryCancellationToken, OutboundSendRequest, OutboundSendResult,
    SEND_CANCELLED_REASON,
};
use crate::delivery_inbound::BusyFlagGuard;
use crate::delivery_redaction::redact_detail;
use crate::delivery_time::SharedDeliveryClock;
use crate::delivery_trace::{
    DecisionTraceInput, DecisionTraceRecorder, TraceDecision, TraceReasonCode, TraceStage,
};

const SUMMARY_REASON_MAX_CHARS: usize = 120;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
/// Coarse follow-up priority; ordering is `Low < Medium < High`.
pub enum FollowUpUrgency {
    #[default]
    Low,
    Medium,
    High,
}

impl FollowUpUrgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Input to [`FollowUpScheduler::add`].
pub struct FollowUpRequest {
    pub destination: String,
    pub urgency: FollowUpUrgency,
    pub delay_ms: u64,
    pub reason: String,
    pub content: String,
    pub context: DeliveryContext,
}

impl FollowUpRequest {
    pub fn new(
        destination: impl Into<String>,
        urgency: FollowUpUrgency,
        delay_ms: u64,
        reason: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            urgency,
            delay_ms,
            reason: reason.into(),
            content: content.into(),
            context: DeliveryContext::new(MessageKind::FollowUp),
        }
    }

    pub fn with_context(mut self, context: DeliveryContext) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Snapshot of one queued follow-up.
pub struct QueuedFollowUp {
    pub follow_up_id: String,
    pub destination: String,
    pub urgency: FollowUpUrgency,
    pub queued_at_unix_ms: u64,
    pub scheduled_for_unix_ms: u64,
    pub attempts: u32,
    pub reason: String,
    pub content: String,
    pub context: DeliveryContext,
    pub generation: u64,
}

struct FollowUpEntry {
    follow_up: QueuedFollowUp,
    timer: Option<AbortHandle>,
    cancellation: DeliveryCancellationToken,
}

impl FollowUpEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Stops the timer and any in-flight send for this entry.
    fn retire(&mut self) {
        self.cancel_timer();
        self.cancellation.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `FollowUpAddOutcome` values.
pub enum FollowUpAddOutcome {
    Added,
    Upgraded { previous: FollowUpUrgency },
    Rejected { reason: String },
}

impl FollowUpAddOutcome {
    pub fn accepted(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `FollowUpProcessOutcome` values.
pub enum FollowUpProcessOutcome {
    Sent,
    Skipped,
    Rescheduled { at_unix_ms: u64 },
    Retrying { attempt: u32, at_unix_ms: u64 },
    Abandoned,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Public struct `FollowUpSummaryEntry` used across Tau components.
pub struct FollowUpSummaryEntry {
    pub destination_hash: String,
    pub urgency: FollowUpUrgency,
    pub scheduled_for_unix_ms: u64,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Observability snapshot: counts by urgency and the next entries due.
pub struct FollowUpSummary {
    pub total: usize,
    pub capacity: usize,
    pub by_urgency: BTreeMap<String, usize>,
    pub upcoming: Vec<FollowUpSummaryEntry>,
}

/// Single-owner map of pending follow-ups keyed by destination.
pub struct FollowUpScheduler {
    config: FollowUpSchedulerConfig,
    gate: Arc<AdmissionGate>,
    sessions: Arc<dyn SessionStore>,
    recorder: Arc<DecisionTraceRecorder>,
    clock: SharedDeliveryClock,
    entries: Mutex<HashMap<String, FollowUpEntry>>,
    next_generation: AtomicU64,
    last_send: tokio::sync::Mutex<Option<tokio::time::Instant>>,
    sweeping: AtomicBool,
    shut_down: AtomicBool,
    this: Weak<FollowUpScheduler>,
}

impl std::fmt::Debug for FollowUpScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowUpScheduler")
            .field("config", &self.config)
            .field("queued", &self.len())
            .finish_non_exhaustive()
    }
}

impl FollowUpScheduler {
    pub fn new(
        config: FollowUpSchedulerConfig,
        gate: Arc<AdmissionGate>,
        sessions: Arc<dyn SessionStore>,
        recorder: Arc<DecisionTraceRecorder>,
        clock: SharedDeliveryClock,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            gate,
            sessions,
            recorder,
            clock,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            last_send: tokio::sync::Mutex::new(None),
            sweeping: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, destination: &str) -> bool {
        lock_unpoisoned(&self.entries).contains_key(destination.trim())
    }

    pub fn get(&self, destination: &str) -> Option<QueuedFollowUp> {
        lock_unpoisoned(&self.entries)
            .get(destination.trim())
            .map(|entry| entry.follow_up.clone())
    }

    /// Queues a follow-up, upgrading or evicting as needed.
    ///
    /// An existing entry for the destination is replaced only by a strictly
    /// more urgent request. At capacity the lowest-urgency entry (earliest
    /// scheduled first on ties) is evicted to make room.
    pub fn add(&self, request: FollowUpRequest) -> FollowUpAddOutcome {
        let destination = request.destination.trim().to_string();
        if let Err(error) = require_non_empty("destination", &destination)
            .and_then(|()| require_non_empty("content", &request.content))
        {
            return FollowUpAddOutcome::Rejected {
                reason: error.reason_code().to_string(),
            };
        }
        if self.shut_down.load(Ordering::Acquire) {
            return FollowUpAddOutcome::Rejected {
                reason: "scheduler_shut_down".to_string(),
            };
        }

        let now_unix_ms = self.clock.now_unix_ms();
        let scheduled_for_unix_ms = now_unix_ms.saturating_add(request.delay_ms);
        let generation = self.allocate_generation();
        let follow_up = QueuedFollowUp {
            follow_up_id: Uuid::new_v4().to_string(),
            destination: destination.clone(),
            urgency: request.urgency,
            queued_at_unix_ms: now_unix_ms,
            scheduled_for_unix_ms,
            attempts: 0,
            reason: request.reason,
            content: request.content,
            context: request.context,
            generation,
        };

        let mut traces = Vec::new();
        let outcome = {
            let mut entries = lock_unpoisoned(&self.entries);
            let mut outcome = FollowUpAddOutcome::Added;
            if let Some(existing) = entries.get(&destination) {
                if follow_up.urgency <= existing.follow_up.urgency {
                    let existing_urgency = existing.follow_up.urgency;
                    drop(entries);
                    self.recorder.record(
                        follow_up_trace(
                            &follow_up,
                            TraceDecision::Skip,
                            TraceReasonCode::FollowUpRejected,
                        )
                        .with_detail(format!(
                            "pending {} follow-up outranks {}",
                            existing_urgency.as_str(),
                            follow_up.urgency.as_str()
                        )),
                    );
                    return FollowUpAddOutcome::Rejected {
                        reason: "follow_up_already_queued".to_string(),
                    };
                }
                if let Some(mut replaced) = entries.remove(&destination) {
                    replaced.retire();
                    outcome = FollowUpAddOutcome::Upgraded {
                        previous: replaced.follow_up.urgency,
                    };
                }
            } else if entries.len() >= self.config.capacity.max(1) {
                let victim = entries
                    .values()
                    .min_by_key(|entry| {
                        (
                            entry.follow_up.urgency,
                            entry.follow_up.scheduled_for_unix_ms,
                            entry.follow_up.queued_at_unix_ms,
                        )
                    })
                    .map(|entry| entry.follow_up.destination.clone());
                let Some(mut evicted) = victim.and_then(|key| entries.remove(&key)) else {
                    return FollowUpAddOutcome::Rejected {
                        reason: "no_evictable_follow_up".to_string(),
                    };
                };
                evicted.retire();
                traces.push(
                    follow_up_trace(
                        &evicted.follow_up,
                        TraceDecision::Skip,
                        TraceReasonCode::FollowUpEvicted,
                    )
                    .with_detail(format!(
                        "capacity {} reached, evicted {}",
                        self.config.capacity,
                        evicted.follow_up.urgency.as_str()
                    )),
                );
            }
            let timer = self.arm_timer(&destination, generation, scheduled_for_unix_ms);
            entries.insert(
                destination.clone(),
                FollowUpEntry {
                    follow_up: follow_up.clone(),
                    timer,
                    cancellation: DeliveryCancellationToken::new(),
                },
            );
            outcome
        };

        let reason_code = match outcome {
            FollowUpAddOutcome::Upgraded { .. } => TraceReasonCode::FollowUpUpgraded,
            _ => TraceReasonCode::FollowUpQueued,
        };
        traces.push(
            follow_up_trace(&follow_up, TraceDecision::Defer, reason_code)
                .with_detail(format!(
                    "urgency {}: {}",
                    follow_up.urgency.as_str(),
                    follow_up.reason
                ))
                .with_next_eligible_at(Some(scheduled_for_unix_ms)),
        );
        for trace in traces {
            self.recorder.record(trace);
        }
        outcome
    }

    /// Removes the pending follow-up for `destination` and cancels its timer.
    pub fn remove(&self, destination: &str, reason: &str) -> bool {
        let removed = lock_unpoisoned(&self.entries).remove(destination.trim());
        let Some(mut entry) = removed else {
            return false;
        };
        entry.retire();
        self.recorder.record(
            follow_up_trace(
                &entry.follow_up,
                TraceDecision::Skip,
                TraceReasonCode::FollowUpRemoved,
            )
            .with_detail(reason),
        );
        true
    }

    /// Re-validates and attempts the follow-up for `destination`.
    #[tracing::instrument(name = "tau_delivery.follow_up.process", skip(self, destination))]
    pub async fn process(&self, destination: &str) -> FollowUpProcessOutcome {
        let Some((follow_up, cancellation)) = self.snapshot(destination) else {
            return FollowUpProcessOutcome::Stale;
        };
        let generation = follow_up.generation;

        let session = self.sessions.get_session(&follow_up.destination).await;
        let ineligible = match &session {
            None => Some((TraceReasonCode::SessionMissing, "session missing")),
            Some(session) => session
                .follow_up_ineligible_reason()
                .map(|reason| (TraceReasonCode::DestinationIneligible, reason)),
        };
        if let Some((reason_code, detail)) = ineligible {
            if self.take_if_current(&follow_up.destination, generation).is_none() {
                return FollowUpProcessOutcome::Stale;
            }
            self.recorder.record(
                follow_up_trace(&follow_up, TraceDecision::Skip, reason_code).with_detail(detail),
            );
            return FollowUpProcessOutcome::Skipped;
        }

        let now_unix_ms = self.clock.now_unix_ms();
        if !self.gate.provider_ready() {
            let at_unix_ms = now_unix_ms.saturating_add(self.gate.provider_retry_after_ms());
            return self.reschedule(&follow_up, at_unix_ms, "provider not connected");
        }
        if !self.gate.window_open_at(now_unix_ms) {
            let at_unix_ms = self.gate.next_window_open_at(now_unix_ms);
            return self.reschedule(&follow_up, at_unix_ms, "outside delivery window");
        }
        if let Some(denial) = self.gate.global_rate_block(now_unix_ms) {
            let at_unix_ms = now_unix_ms.saturating_add(self.config.rate_limited_backoff_ms);
            return self.reschedule(
                &follow_up,
                at_unix_ms,
                &format!("global rate limit {}", denial.scope.as_str()),
            );
        }

        // Settled under the pacer lock so a concurrent fire for the same
        // generation sees the outcome before it can send.
        let mut last_send = self.last_send.lock().await;
        if let Some(previous) = *last_send {
            let min_interval = Duration::from_millis(self.config.min_send_interval_ms);
            let elapsed = previous.elapsed();
            if elapsed < min_interval {
                tokio::time::sleep(min_interval - elapsed).await;
            }
        }
        if self.get(&follow_up.destination).map(|entry| entry.generation) != Some(generation) {
            return FollowUpProcessOutcome::Stale;
        }
        let result = self
            .gate
            .send_with_cancellation(self.send_request(&follow_up), Some(&cancellation))
            .await;
        if !result.sent && result.reason == SEND_CANCELLED_REASON {
            tracing::debug!(
                follow_up_id = %follow_up.follow_up_id,
                "follow-up withdrawn while pacing"
            );
            return FollowUpProcessOutcome::Stale;
        }
        *last_send = Some(tokio::time::Instant::now());
        self.settle(&follow_up, result)
    }

    /// Drops entries whose destination disappeared or became ineligible.
    #[tracing::instrument(name = "tau_delivery.follow_up.sweep", skip(self))]
    pub async fn sweep_ineligible(&self) -> usize {
        let Some(_busy) = BusyFlagGuard::try_acquire(&self.sweeping) else {
            return 0;
        };
        let candidates = lock_unpoisoned(&self.entries)
            .values()
            .map(|entry| entry.follow_up.clone())
            .collect::<Vec<_>>();
        let mut removed = 0usize;
        for follow_up in candidates {
            let session = self.sessions.get_session(&follow_up.destination).await;
            let (reason_code, detail) = match &session {
                None => (TraceReasonCode::SessionMissing, "session missing"),
                Some(session) => match session.follow_up_ineligible_reason() {
                    Some(reason) => (TraceReasonCode::DestinationIneligible, reason),
                    None => continue,
                },
            };
            if self
                .take_if_current(&follow_up.destination, follow_up.generation)
                .is_none()
            {
                continue;
            }
            removed += 1;
            self.recorder.record(
                follow_up_trace(&follow_up, TraceDecision::Skip, reason_code).with_detail(detail),
            );
        }
        if removed > 0 {
            tracing::debug!(removed, "swept ineligible follow-ups");
        }
        removed
    }

    pub fn summary(&self) -> FollowUpSummary {
        let entries = lock_unpoisoned(&self.entries);
        let mut by_urgency = BTreeMap::new();
        for entry in entries.values() {
            *by_urgency
                .entry(entry.follow_up.urgency.as_str().to_string())
                .or_insert(0usize) += 1;
        }
        let mut upcoming = entries
            .values()
            .map(|entry| FollowUpSummaryEntry {
                destination_hash: self.recorder.hash_destination(&entry.follow_up.destination),
                urgency: entry.follow_up.urgency,
                scheduled_for_unix_ms: entry.follow_up.scheduled_for_unix_ms,
                attempts: entry.follow_up.attempts,
                reason: redact_detail(&entry.follow_up.reason, SUMMARY_REASON_MAX_CHARS),
            })
            .collect::<Vec<_>>();
        upcoming.sort_by(|left, right| {
            left.scheduled_for_unix_ms
                .cmp(&right.scheduled_for_unix_ms)
                .then_with(|| right.urgency.cmp(&left.urgency))
        });
        upcoming.truncate(self.config.summary_top_n);
        FollowUpSummary {
            total: entries.len(),
            capacity: self.config.capacity,
            by_urgency,
            upcoming,
        }
    }

    /// Spawns the periodic eligibility sweep on the current tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                scheduler.sweep_ineligible().await;
            }
        })
    }

    /// Aborts every pending timer and in-flight send; queued entries stay
    /// for inspection.
    pub fn shutdown(&self) -> usize {
        self.shut_down.store(true, Ordering::Release);
        let mut entries = lock_unpoisoned(&self.entries);
        let mut cancelled = 0usize;
        for entry in entries.values_mut() {
            if entry.timer.is_some() {
                cancelled += 1;
            }
            entry.retire();
        }
        tracing::info!(cancelled, "follow-up scheduler shut down");
        cancelled
    }

    fn settle(
        &self,
        follow_up: &QueuedFollowUp,
        result: OutboundSendResult,
    ) -> FollowUpProcessOutcome {
        if result.sent {
            if self
                .take_if_current(&follow_up.destination, follow_up.generation)
                .is_none()
            {
                tracing::debug!(
                    follow_up_id = %follow_up.follow_up_id,
                    "follow-up replaced while sending"
                );
            }
            return FollowUpProcessOutcome::Sent;
        }
        if result.deferred {
            let at_unix_ms = self
                .clock
                .now_unix_ms()
                .saturating_add(result.retry_after_ms.unwrap_or(0));
            return self.reschedule(follow_up, at_unix_ms, "provider deferred send");
        }

        let attempt = follow_up.attempts.saturating_add(1);
        let blocked_by = result
            .blocked_by
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>()
            .join(",");
        if attempt > self.config.max_retries {
            if self
                .take_if_current(&follow_up.destination, follow_up.generation)
                .is_none()
            {
                return FollowUpProcessOutcome::Stale;
            }
            tracing::warn!(
                follow_up_id = %follow_up.follow_up_id,
                destination = %self.recorder.hash_destination(&follow_up.destination),
                attempts = follow_up.attempts,
                reason = %result.reason,
                "follow-up abandoned after retries"
            );
            self.recorder.record(
                follow_up_trace(
                    follow_up,
                    TraceDecision::Skip,
                    TraceReasonCode::FollowUpAbandoned,
                )
                .with_detail(format!("{}: {blocked_by}", result.reason)),
            );
            return FollowUpProcessOutcome::Abandoned;
        }

        let at_unix_ms = self
            .clock
            .now_unix_ms()
            .saturating_add(self.config.retry_backoff_ms);
        if !self.rearm(follow_up, at_unix_ms, attempt) {
            return FollowUpProcessOutcome::Stale;
        }
        self.recorder.record(
            follow_up_trace(follow_up, TraceDecision::Defer, TraceReasonCode::FollowUpRetry)
                .with_detail(format!(
                    "attempt {attempt}/{}: {}: {blocked_by}",
                    self.config.max_retries, result.reason
                ))
                .with_next_eligible_at(Some(at_unix_ms)),
        );
        FollowUpProcessOutcome::Retrying {
            attempt,
            at_unix_ms,
        }
    }

    fn reschedule(
        &self,
        follow_up: &QueuedFollowUp,
        at_unix_ms: u64,
        detail: &str,
    ) -> FollowUpProcessOutcome {
        if !self.rearm(follow_up, at_unix_ms, follow_up.attempts) {
            return FollowUpProcessOutcome::Stale;
        }
        self.recorder.record(
            follow_up_trace(
                follow_up,
                TraceDecision::Defer,
                TraceReasonCode::FollowUpRescheduled,
            )
            .with_detail(detail)
            .with_next_eligible_at(Some(at_unix_ms)),
        );
        FollowUpProcessOutcome::Rescheduled { at_unix_ms }
    }

    /// Moves the entry to `at_unix_ms` under a fresh generation. Returns false
    /// when the entry was removed or replaced meanwhile.
    fn rearm(&self, follow_up: &QueuedFollowUp, at_unix_ms: u64, attempts: u32) -> bool {
        let generation = self.allocate_generation();
        let mut entries = lock_unpoisoned(&self.entries);
        let Some(entry) = entries
            .get_mut(&follow_up.destination)
            .filter(|entry| entry.follow_up.generation == follow_up.generation)
        else {
            return false;
        };
        entry.cancel_timer();
        entry.follow_up.generation = generation;
        entry.follow_up.scheduled_for_unix_ms = at_unix_ms;
        entry.follow_up.attempts = attempts;
        entry.timer = self.arm_timer(&follow_up.destination, generation, at_unix_ms);
        true
    }

    fn take_if_current(&self, destination: &str, generation: u64) -> Option<FollowUpEntry> {
        let mut entries = lock_unpoisoned(&self.entries);
        let current = entries
            .get(destination)
            .is_some_and(|entry| entry.follow_up.generation == generation);
        if !current {
            return None;
        }
        let mut entry = entries.remove(destination)?;
        entry.retire();
        Some(entry)
    }

    fn snapshot(&self, destination: &str) -> Option<(QueuedFollowUp, DeliveryCancellationToken)> {
        lock_unpoisoned(&self.entries)
            .get(destination.trim())
            .map(|entry| (entry.follow_up.clone(), entry.cancellation.clone()))
    }

    fn arm_timer(&self, destination: &str, generation: u64, at_unix_ms: u64) -> Option<AbortHandle> {
        if self.shut_down.load(Ordering::Acquire) {
            return None;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(error) => {
                tracing::warn!(%error, "no tokio runtime, follow-up timer not armed");
                return None;
            }
        };
        let delay = Duration::from_millis(at_unix_ms.saturating_sub(self.clock.now_unix_ms()));
        let scheduler = self.this.clone();
        let destination = destination.to_string();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.fire(&destination, generation).await;
            }
        });
        Some(task.abort_handle())
    }

    /// Timer entry point: detaches the spent handle so processing can re-arm
    /// without aborting the task it runs on.
    async fn fire(&self, destination: &str, generation: u64) {
        let armed = {
            let mut entries = lock_unpoisoned(&self.entries);
            match entries.get_mut(destination) {
                Some(entry) if entry.follow_up.generation == generation => {
                    entry.timer = None;
                    true
                }
                _ => false,
            }
        };
        if !armed {
            tracing::debug!(generation, "ignoring stale follow-up timer");
            return;
        }
        let outcome = self.process(destination).await;
        tracing::debug!(?outcome, "follow-up timer fired");
    }

    fn send_request(&self, follow_up: &QueuedFollowUp) -> OutboundSendRequest {
        let mut request = OutboundSendRequest::new(&follow_up.destination, &follow_up.content)
            .with_context(follow_up.context.clone())
            .with_message_id(&follow_up.follow_up_id);
        if follow_up.urgency == FollowUpUrgency::High {
            request = request.high_priority();
        }
        request
    }

    fn allocate_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }
}

fn follow_up_trace(
    follow_up: &QueuedFollowUp,
    decision: TraceDecision,
    reason_code: TraceReasonCode,
) -> DecisionTraceInput {
    DecisionTraceInput::new(
        &follow_up.follow_up_id,
        &follow_up.destination,
        TraceStage::FollowUp,
        decision,
        reason_code,
    )
    .with_context(&follow_up.context)
}
