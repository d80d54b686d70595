//! Outbound admission gate.
//!
//! Checks run in a fixed order. The provider-state check short-circuits with a
//! deferral; every other check is evaluated so a blocked send reports all of
//! its reasons at once. A fully admitted candidate holds a rate-limit
//! reservation while it is paced and sent with a timeout; the reservation is
//! counted only once the transport confirms the send.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::delivery_config::AdmissionGateConfig;
use crate::delivery_connection::{lock_unpoisoned, ConnectionStateMachine};
use crate::delivery_contract::{
    ChannelSendReceipt, DeliveryCollaborators, DeliveryContext, DeliverySession, MessageKind,
};
use crate::delivery_error::{require_non_empty, ChannelSendError, DeliveryInputError};
use crate::delivery_rate_limit::{
    DeliveryRateLimiter, RateLimitDenial, RateLimitPolicy, RateLimitReservation, RateLimiterStats,
};
use crate::delivery_time::SharedDeliveryClock;
use crate::delivery_trace::{DecisionTraceRecorder, TraceReasonCode, TraceStage};
use crate::delivery_window::DeliveryWindow;

/// `OutboundSendResult::reason` for a send abandoned through its cancellation token.
pub const SEND_CANCELLED_REASON: &str = "send_cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Gate identifiers reported in [`OutboundSendResult::blocked_by`].
pub enum AdmissionGateKind {
    ProviderState,
    NoReach,
    OrderStatus,
    Cooldown,
    Recency,
    TimeWindow,
    RateLimit,
    ContentPolicy,
    Error,
}

impl AdmissionGateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProviderState => "provider-state",
            Self::NoReach => "no-reach",
            Self::OrderStatus => "order-status",
            Self::Cooldown => "cooldown",
            Self::Recency => "recency",
            Self::TimeWindow => "time-window",
            Self::RateLimit => "rate-limit",
            Self::ContentPolicy => "content-policy",
            Self::Error => "error",
        }
    }
}

/// Cooperative cancellation shared between a send and whoever owns its intent.
#[derive(Debug, Clone, Default)]
pub struct DeliveryCancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl DeliveryCancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token as cancelled and wakes pending waiters.
    pub fn cancel(&self) {
        let already_cancelled = self.cancelled.swap(true, Ordering::SeqCst);
        if !already_cancelled {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One candidate outbound message.
pub struct OutboundSendRequest {
    pub destination: String,
    pub content: String,
    pub context: DeliveryContext,
    pub message_id: Option<String>,
    pub high_priority: bool,
    pub bypass_time_window: bool,
    pub bypass_rate_limit: bool,
}

impl OutboundSendRequest {
    pub fn new(destination: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            content: content.into(),
            context: DeliveryContext::default(),
            message_id: None,
            high_priority: false,
            bypass_time_window: false,
            bypass_rate_limit: false,
        }
    }

    pub fn with_context(mut self, context: DeliveryContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_kind(mut self, message_kind: MessageKind) -> Self {
        self.context.message_kind = message_kind;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }

    /// Urgent notifications only: skips the time-window check.
    pub fn bypass_time_window(mut self) -> Self {
        self.bypass_time_window = true;
        self
    }

    /// Urgent notifications only: skips the rate-limit check.
    pub fn bypass_rate_limit(mut self) -> Self {
        self.bypass_rate_limit = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Structured outcome of [`AdmissionGate::send`].
pub struct OutboundSendResult {
    pub message_id: String,
    pub sent: bool,
    pub reason: String,
    pub blocked_by: Vec<AdmissionGateKind>,
    pub deferred: bool,
    pub retry_after_ms: Option<u64>,
    pub delivered_content: Option<String>,
    pub provider_message_id: Option<String>,
    pub trace_id: Option<String>,
}

impl OutboundSendResult {
    fn not_sent(message_id: String, reason: impl Into<String>) -> Self {
        Self {
            message_id,
            sent: false,
            reason: reason.into(),
            blocked_by: Vec::new(),
            deferred: false,
            retry_after_ms: None,
            delivered_content: None,
            provider_message_id: None,
            trace_id: None,
        }
    }

    pub fn is_blocked_by(&self, kind: AdmissionGateKind) -> bool {
        self.blocked_by.contains(&kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Public struct `AdmissionGateStats` used across Tau components.
pub struct AdmissionGateStats {
    pub sent: u64,
    pub blocked: u64,
    pub deferred: u64,
    pub failed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub blocked_by_gate: BTreeMap<String, u64>,
    pub rate_limiter: RateLimiterStats,
}

#[derive(Debug, Default)]
struct GateCounters {
    sent: AtomicU64,
    blocked: AtomicU64,
    deferred: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    blocked_by_gate: Mutex<BTreeMap<String, u64>>,
}

struct GateBlock {
    kind: AdmissionGateKind,
    reason_code: TraceReasonCode,
    detail: String,
    clears_at_unix_ms: Option<u64>,
}

/// Ordered policy checks in front of the channel transport.
pub struct AdmissionGate {
    config: AdmissionGateConfig,
    window: DeliveryWindow,
    connection: Arc<ConnectionStateMachine>,
    collaborators: DeliveryCollaborators,
    recorder: Arc<DecisionTraceRecorder>,
    limiter: DeliveryRateLimiter,
    clock: SharedDeliveryClock,
    counters: GateCounters,
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("config", &self.config)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl AdmissionGate {
    pub fn new(
        config: AdmissionGateConfig,
        window: DeliveryWindow,
        connection: Arc<ConnectionStateMachine>,
        collaborators: DeliveryCollaborators,
        recorder: Arc<DecisionTraceRecorder>,
        clock: SharedDeliveryClock,
    ) -> Self {
        let limiter = DeliveryRateLimiter::new(RateLimitPolicy::from_gate_config(&config));
        Self {
            config,
            window,
            connection,
            collaborators,
            recorder,
            limiter,
            clock,
            counters: GateCounters::default(),
        }
    }

    pub fn window(&self) -> &DeliveryWindow {
        &self.window
    }

    pub fn rate_limiter(&self) -> &DeliveryRateLimiter {
        &self.limiter
    }

    pub fn provider_retry_after_ms(&self) -> u64 {
        self.config.provider_retry_after_ms
    }

    pub fn provider_ready(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn window_open_at(&self, now_unix_ms: u64) -> bool {
        self.window.is_open_at(now_unix_ms)
    }

    pub fn next_window_open_at(&self, now_unix_ms: u64) -> u64 {
        self.window.next_open_at(now_unix_ms)
    }

    pub fn global_rate_block(&self, now_unix_ms: u64) -> Option<RateLimitDenial> {
        self.limiter.global_block(now_unix_ms)
    }

    pub fn collect_idle_buckets(&self) -> usize {
        let removed = self.limiter.collect_idle(self.clock.now_unix_ms());
        if removed > 0 {
            tracing::debug!(removed, "collected idle rate-limit buckets");
        }
        removed
    }

    /// Spawns periodic idle-bucket collection on the current tokio runtime.
    pub fn spawn_bucket_collector(self: &Arc<Self>) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        let period = Duration::from_millis(self.config.bucket_gc_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                gate.collect_idle_buckets();
            }
        })
    }

    pub fn stats(&self) -> AdmissionGateStats {
        AdmissionGateStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            blocked_by_gate: lock_unpoisoned(&self.counters.blocked_by_gate).clone(),
            rate_limiter: self.limiter.stats(self.clock.now_unix_ms()),
        }
    }

    /// Admits, paces and sends one candidate, or reports why it was held back.
    pub async fn send(&self, request: OutboundSendRequest) -> OutboundSendResult {
        self.send_with_cancellation(request, None).await
    }

    /// Same as [`send`](Self::send), but gives up without touching the
    /// transport once `cancellation_token` fires during admission or pacing.
    #[tracing::instrument(
        name = "tau_delivery.gate.send",
        skip(self, request, cancellation_token),
        fields(kind = request.context.message_kind.as_str())
    )]
    pub async fn send_with_cancellation(
        &self,
        request: OutboundSendRequest,
        cancellation_token: Option<&DeliveryCancellationToken>,
    ) -> OutboundSendResult {
        let message_id = request
            .message_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Err(error) = validate_outbound_fields(&request) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%message_id, %error, "outbound send rejected at boundary");
            return OutboundSendResult::not_sent(message_id, error.reason_code());
        }
        let destination = request.destination.trim();
        let context = &request.context;
        let now_unix_ms = self.clock.now_unix_ms();

        if !self.connection.is_connected() {
            let retry_after_ms = self.config.provider_retry_after_ms;
            self.counters.deferred.fetch_add(1, Ordering::Relaxed);
            let trace = self.recorder.record_queued(
                &message_id,
                destination,
                TraceStage::AdmissionGate,
                TraceReasonCode::ProviderNotConnected,
                Some(now_unix_ms.saturating_add(retry_after_ms)),
                context,
            );
            return OutboundSendResult {
                blocked_by: vec![AdmissionGateKind::ProviderState],
                deferred: true,
                retry_after_ms: Some(retry_after_ms),
                trace_id: Some(trace.trace_id),
                ..OutboundSendResult::not_sent(message_id, TraceReasonCode::ProviderNotConnected.as_str())
            };
        }

        let session = self.collaborators.sessions.get_session(destination).await;
        let destination_key = self.recorder.hash_destination(destination);
        let mut blocks = self.evaluate_session_gates(session.as_ref(), &request, now_unix_ms);

        if !request.bypass_time_window && !self.window.is_open_at(now_unix_ms) {
            blocks.push(GateBlock {
                kind: AdmissionGateKind::TimeWindow,
                reason_code: TraceReasonCode::OutsideDeliveryWindow,
                detail: format!(
                    "outside {:02}:00-{:02}:00 {}",
                    self.window.start_hour(),
                    self.window.end_hour(),
                    self.window.timezone()
                ),
                clears_at_unix_ms: Some(self.window.next_open_at(now_unix_ms)),
            });
        }

        let mut reservation = None;
        if !request.bypass_rate_limit {
            match self.limiter.try_reserve(&destination_key, now_unix_ms) {
                Ok(slot) => reservation = Some(slot),
                Err(denial) => blocks.push(GateBlock {
                    kind: AdmissionGateKind::RateLimit,
                    reason_code: TraceReasonCode::RateLimited,
                    detail: format!("rate limit {}", denial.scope.as_str()),
                    clears_at_unix_ms: Some(now_unix_ms.saturating_add(denial.retry_after_ms)),
                }),
            }
        }

        let mut content = request.content.clone();
        match self
            .collaborators
            .content_policy
            .validate(&request.content, context)
            .await
        {
            Ok(verdict) if verdict.ok => {
                if let Some(transformed) = verdict
                    .transformed_content
                    .filter(|value| !value.trim().is_empty())
                {
                    content = transformed;
                }
            }
            Ok(verdict) => blocks.push(GateBlock {
                kind: AdmissionGateKind::ContentPolicy,
                reason_code: TraceReasonCode::ContentPolicyBlocked,
                detail: verdict
                    .reason
                    .unwrap_or_else(|| "content policy rejected message".to_string()),
                clears_at_unix_ms: None,
            }),
            Err(error) => {
                tracing::warn!(
                    %message_id,
                    error = %format!("{error:#}"),
                    "content policy evaluator failed, allowing message"
                );
            }
        }

        if !blocks.is_empty() {
            return self.blocked_result(message_id, destination, context, blocks, now_unix_ms);
        }

        if !self
            .pace(request.context.message_kind, cancellation_token)
            .await
            || cancellation_token.is_some_and(DeliveryCancellationToken::is_cancelled)
        {
            return self.cancelled_result(message_id, &destination_key, reservation);
        }

        match self.send_with_timeout(destination, &content).await {
            Ok(receipt) => {
                let sent_at_unix_ms = self.clock.now_unix_ms();
                match reservation {
                    Some(slot) => slot.commit(sent_at_unix_ms),
                    None => self.limiter.record_send(&destination_key, sent_at_unix_ms),
                }
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                let trace = self.recorder.record_success(
                    &message_id,
                    destination,
                    &format!("kind={}", context.message_kind.as_str()),
                    context,
                );
                OutboundSendResult {
                    sent: true,
                    delivered_content: Some(content),
                    provider_message_id: receipt.provider_message_id,
                    trace_id: Some(trace.trace_id),
                    ..OutboundSendResult::not_sent(message_id, TraceReasonCode::Sent.as_str())
                }
            }
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let reason_code = match error {
                    ChannelSendError::Timeout { .. } => TraceReasonCode::SendTimeout,
                    ChannelSendError::Transport(_) | ChannelSendError::EmptyResult => {
                        TraceReasonCode::SendFailed
                    }
                };
                tracing::warn!(
                    %message_id,
                    destination = %destination_key,
                    %error,
                    "outbound send failed"
                );
                let trace = self.recorder.record_send_failed(
                    &message_id,
                    destination,
                    reason_code,
                    &error.to_string(),
                    context,
                );
                OutboundSendResult {
                    blocked_by: vec![AdmissionGateKind::Error],
                    trace_id: Some(trace.trace_id),
                    ..OutboundSendResult::not_sent(message_id, error.reason_code())
                }
            }
        }
    }

    /// Gates 2 through 5. A missing session passes; the caller decides what
    /// an unknown destination means.
    fn evaluate_session_gates(
        &self,
        session: Option<&DeliverySession>,
        request: &OutboundSendRequest,
        now_unix_ms: u64,
    ) -> Vec<GateBlock> {
        let mut blocks = Vec::new();
        let Some(session) = session else {
            return blocks;
        };
        let proactive = request.context.message_kind.is_proactive();

        if let Some(reason) = session.no_reach_reason_for(request.context.message_kind) {
            blocks.push(GateBlock {
                kind: AdmissionGateKind::NoReach,
                reason_code: TraceReasonCode::NoReach,
                detail: reason.to_string(),
                clears_at_unix_ms: None,
            });
        }

        if proactive && session.order_status.is_active() {
            blocks.push(GateBlock {
                kind: AdmissionGateKind::OrderStatus,
                reason_code: TraceReasonCode::OrderInProgress,
                detail: format!("order {}", session.order_status.as_str()),
                clears_at_unix_ms: None,
            });
        }

        if let Some(cooldown_until) = session
            .cooldown_until_unix_ms
            .filter(|until| *until > now_unix_ms)
        {
            blocks.push(GateBlock {
                kind: AdmissionGateKind::Cooldown,
                reason_code: TraceReasonCode::CooldownActive,
                detail: "cooldown active".to_string(),
                clears_at_unix_ms: Some(cooldown_until),
            });
        }

        if proactive && !request.high_priority {
            let follow_up_clears = session
                .last_follow_up_unix_ms
                .map(|at| at.saturating_add(self.config.follow_up_recency_ms))
                .filter(|clears| *clears > now_unix_ms);
            let activity_clears = session
                .last_user_interaction_unix_ms
                .map(|at| at.saturating_add(self.config.user_activity_recency_ms))
                .filter(|clears| *clears > now_unix_ms);
            if let Some(clears) = follow_up_clears {
                blocks.push(GateBlock {
                    kind: AdmissionGateKind::Recency,
                    reason_code: TraceReasonCode::RecentFollowUp,
                    detail: "follow-up sent recently".to_string(),
                    clears_at_unix_ms: Some(clears),
                });
            } else if let Some(clears) = activity_clears {
                blocks.push(GateBlock {
                    kind: AdmissionGateKind::Recency,
                    reason_code: TraceReasonCode::RecentUserActivity,
                    detail: "user active recently".to_string(),
                    clears_at_unix_ms: Some(clears),
                });
            }
        }
        blocks
    }

    fn blocked_result(
        &self,
        message_id: String,
        destination: &str,
        context: &DeliveryContext,
        blocks: Vec<GateBlock>,
        now_unix_ms: u64,
    ) -> OutboundSendResult {
        self.counters.blocked.fetch_add(1, Ordering::Relaxed);
        {
            let mut by_gate = lock_unpoisoned(&self.counters.blocked_by_gate);
            for block in &blocks {
                *by_gate.entry(block.kind.as_str().to_string()).or_default() += 1;
            }
        }
        let blocked_by = blocks.iter().map(|block| block.kind).collect::<Vec<_>>();
        let next_eligible_at = if blocks.iter().all(|block| block.clears_at_unix_ms.is_some()) {
            blocks
                .iter()
                .filter_map(|block| block.clears_at_unix_ms)
                .max()
        } else {
            None
        };
        let detail = blocks
            .iter()
            .map(|block| format!("{}: {}", block.kind.as_str(), block.detail))
            .collect::<Vec<_>>()
            .join("; ");
        let primary = blocks[0].reason_code;
        tracing::debug!(
            %message_id,
            blocked_by = %blocked_by.iter().map(|kind| kind.as_str()).collect::<Vec<_>>().join(","),
            "outbound send blocked"
        );
        let trace = self.recorder.record_policy_blocked(
            &message_id,
            destination,
            primary,
            &detail,
            next_eligible_at,
            context,
        );
        OutboundSendResult {
            blocked_by,
            retry_after_ms: next_eligible_at.map(|at| at.saturating_sub(now_unix_ms)),
            trace_id: Some(trace.trace_id),
            ..OutboundSendResult::not_sent(message_id, primary.as_str())
        }
    }

    fn cancelled_result(
        &self,
        message_id: String,
        destination_key: &str,
        reservation: Option<RateLimitReservation<'_>>,
    ) -> OutboundSendResult {
        drop(reservation);
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            %message_id,
            destination = %destination_key,
            "outbound send cancelled before transport"
        );
        OutboundSendResult::not_sent(message_id, SEND_CANCELLED_REASON)
    }

    /// Sleeps the randomized pacing delay. Returns false when cancelled first.
    async fn pace(
        &self,
        message_kind: MessageKind,
        cancellation_token: Option<&DeliveryCancellationToken>,
    ) -> bool {
        let range = self.config.pacing_for(message_kind.pacing_category());
        if range.max_ms == 0 {
            return true;
        }
        let delay_ms = {
            let mut rng = StdRng::from_entropy();
            rng.gen_range(range.min_ms.min(range.max_ms)..=range.max_ms)
        };
        let delay = Duration::from_millis(delay_ms);
        match cancellation_token {
            Some(token) => tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            },
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }

    async fn send_with_timeout(
        &self,
        destination: &str,
        content: &str,
    ) -> Result<ChannelSendReceipt, ChannelSendError> {
        let timeout_ms = self.config.send_timeout_ms;
        let send = self
            .collaborators
            .transport
            .send_message(destination, content);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), send).await {
            Err(_) => Err(ChannelSendError::Timeout { timeout_ms }),
            Ok(Err(error)) => Err(error),
            Ok(Ok(None)) => Err(ChannelSendError::EmptyResult),
            Ok(Ok(Some(receipt))) => Ok(receipt),
        }
    }
}

fn validate_outbound_fields(request: &OutboundSendRequest) -> Result<(), DeliveryInputError> {
    require_non_empty("destination", &request.destination)?;
    require_non_empty("content", &request.content)
}
