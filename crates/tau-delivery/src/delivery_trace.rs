//! Decision trace recorder.
//!
//! Every skip/defer/send decision in the pipeline produces one immutable
//! [`DecisionTrace`]. Destinations are hashed and free-text detail is scrubbed
//! before anything reaches the store or the log. A failing store never fails
//! the decision being described: errors are logged and the trace is still
//! returned to the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delivery_config::DecisionTraceConfig;
use crate::delivery_contract::DeliveryContext;
use crate::delivery_redaction::{hash_destination, redact_detail};
use crate::delivery_time::SharedDeliveryClock;
use crate::delivery_trace_store::DecisionTraceStore;

const DAY_MS: u64 = 24 * 60 * 60 * 1_000;
pub const DECISION_TRACE_QUERY_MAX_LIMIT: usize = 500;
pub const DECISION_TRACE_QUERY_DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Enumerates supported `TraceDecision` values.
pub enum TraceDecision {
    Respond,
    Skip,
    Defer,
    Error,
}

impl TraceDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Respond => "RESPOND",
            Self::Skip => "SKIP",
            Self::Defer => "DEFER",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `TraceStage` values.
pub enum TraceStage {
    Received,
    Dedupe,
    InboundBuffer,
    Policy,
    Routing,
    Generation,
    AdmissionGate,
    Send,
    FollowUp,
}

impl TraceStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Dedupe => "dedupe",
            Self::InboundBuffer => "inbound_buffer",
            Self::Policy => "policy",
            Self::Routing => "routing",
            Self::Generation => "generation",
            Self::AdmissionGate => "admission_gate",
            Self::Send => "send",
            Self::FollowUp => "follow_up",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Closed reason-code taxonomy shared by every pipeline stage.
pub enum TraceReasonCode {
    InboundReceived,
    DuplicateMessage,
    InboundRejectedMalformed,
    InboundQueuedDisconnected,
    InboundEvictedCapacity,
    InboundExpired,
    InboundDrained,
    InboundProcessFailed,
    ProviderNotConnected,
    NoReach,
    OrderInProgress,
    CooldownActive,
    RecentFollowUp,
    RecentUserActivity,
    OutsideDeliveryWindow,
    RateLimited,
    ContentPolicyBlocked,
    PolicyBlocked,
    NoRoute,
    AiErrorFallback,
    AiErrorNoFallback,
    SendFailed,
    SendTimeout,
    Sent,
    FollowUpQueued,
    FollowUpUpgraded,
    FollowUpRejected,
    FollowUpEvicted,
    FollowUpRescheduled,
    FollowUpRetry,
    FollowUpAbandoned,
    FollowUpRemoved,
    SessionMissing,
    DestinationIneligible,
}

impl TraceReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InboundReceived => "inbound_received",
            Self::DuplicateMessage => "duplicate_message",
            Self::InboundRejectedMalformed => "inbound_rejected_malformed",
            Self::InboundQueuedDisconnected => "inbound_queued_disconnected",
            Self::InboundEvictedCapacity => "inbound_evicted_capacity",
            Self::InboundExpired => "inbound_expired",
            Self::InboundDrained => "inbound_drained",
            Self::InboundProcessFailed => "inbound_process_failed",
            Self::ProviderNotConnected => "provider_not_connected",
            Self::NoReach => "no_reach",
            Self::OrderInProgress => "order_in_progress",
            Self::CooldownActive => "cooldown_active",
            Self::RecentFollowUp => "recent_follow_up",
            Self::RecentUserActivity => "recent_user_activity",
            Self::OutsideDeliveryWindow => "outside_delivery_window",
            Self::RateLimited => "rate_limited",
            Self::ContentPolicyBlocked => "content_policy_blocked",
            Self::PolicyBlocked => "policy_blocked",
            Self::NoRoute => "no_route",
            Self::AiErrorFallback => "ai_error_fallback",
            Self::AiErrorNoFallback => "ai_error_no_fallback",
            Self::SendFailed => "send_failed",
            Self::SendTimeout => "send_timeout",
            Self::Sent => "sent",
            Self::FollowUpQueued => "follow_up_queued",
            Self::FollowUpUpgraded => "follow_up_upgraded",
            Self::FollowUpRejected => "follow_up_rejected",
            Self::FollowUpEvicted => "follow_up_evicted",
            Self::FollowUpRescheduled => "follow_up_rescheduled",
            Self::FollowUpRetry => "follow_up_retry",
            Self::FollowUpAbandoned => "follow_up_abandoned",
            Self::FollowUpRemoved => "follow_up_removed",
            Self::SessionMissing => "session_missing",
            Self::DestinationIneligible => "destination_ineligible",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Immutable audit record of one pipeline decision.
pub struct DecisionTrace {
    pub trace_id: String,
    pub message_id: String,
    pub destination_hash: String,
    pub timestamp_unix_ms: u64,
    pub stage: TraceStage,
    pub decision: TraceDecision,
    pub reason_code: TraceReasonCode,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub next_eligible_at_unix_ms: Option<u64>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Recorder input; `destination` is the raw address and never leaves the recorder.
pub struct DecisionTraceInput {
    pub message_id: String,
    pub destination: String,
    pub stage: TraceStage,
    pub decision: TraceDecision,
    pub reason_code: TraceReasonCode,
    pub detail: Option<String>,
    pub next_eligible_at_unix_ms: Option<u64>,
    pub correlation_id: Option<String>,
}

impl DecisionTraceInput {
    pub fn new(
        message_id: impl Into<String>,
        destination: impl Into<String>,
        stage: TraceStage,
        decision: TraceDecision,
        reason_code: TraceReasonCode,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            destination: destination.into(),
            stage,
            decision,
            reason_code,
            detail: None,
            next_eligible_at_unix_ms: None,
            correlation_id: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_next_eligible_at(mut self, next_eligible_at_unix_ms: Option<u64>) -> Self {
        self.next_eligible_at_unix_ms = next_eligible_at_unix_ms;
        self
    }

    pub fn with_context(mut self, context: &DeliveryContext) -> Self {
        self.correlation_id = context.correlation_id.clone();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Filters for paginated trace queries; unset fields match everything.
pub struct DecisionTraceFilter {
    pub destination_hash: Option<String>,
    pub message_id: Option<String>,
    pub stage: Option<TraceStage>,
    pub decision: Option<TraceDecision>,
    pub reason_code: Option<TraceReasonCode>,
    pub correlation_id: Option<String>,
    pub since_unix_ms: Option<u64>,
    pub until_unix_ms: Option<u64>,
}

impl DecisionTraceFilter {
    pub fn matches(&self, trace: &DecisionTrace) -> bool {
        self.destination_hash
            .as_deref()
            .map_or(true, |value| trace.destination_hash == value)
            && self
                .message_id
                .as_deref()
                .map_or(true, |value| trace.message_id == value)
            && self.stage.map_or(true, |value| trace.stage == value)
            && self.decision.map_or(true, |value| trace.decision == value)
            && self.reason_code.map_or(true, |value| trace.reason_code == value)
            && self
                .correlation_id
                .as_deref()
                .map_or(true, |value| trace.correlation_id.as_deref() == Some(value))
            && self
                .since_unix_ms
                .map_or(true, |value| trace.timestamp_unix_ms >= value)
            && self
                .until_unix_ms
                .map_or(true, |value| trace.timestamp_unix_ms <= value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Offset/limit page request; the limit is capped at [`DECISION_TRACE_QUERY_MAX_LIMIT`].
pub struct DecisionTracePageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl Default for DecisionTracePageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DECISION_TRACE_QUERY_DEFAULT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Public struct `DecisionTracePage` used across Tau components.
pub struct DecisionTracePage {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub traces: Vec<DecisionTrace>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Public struct `DecisionTraceSummary` used across Tau components.
pub struct DecisionTraceSummary {
    pub total: usize,
    pub by_decision: BTreeMap<String, usize>,
    pub by_reason_code: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Funnel-style message counts with skip/error breakdowns.
pub struct DeliveryFunnel {
    pub received: usize,
    pub queued: usize,
    pub processing: usize,
    pub responded: usize,
    pub skipped: usize,
    pub errored: usize,
    pub skip_reasons: BTreeMap<String, usize>,
    pub error_reasons: BTreeMap<String, usize>,
}

/// Hashes, scrubs, persists and logs pipeline decisions.
pub struct DecisionTraceRecorder {
    config: DecisionTraceConfig,
    store: Arc<dyn DecisionTraceStore>,
    clock: SharedDeliveryClock,
}

impl std::fmt::Debug for DecisionTraceRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionTraceRecorder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DecisionTraceRecorder {
    pub fn new(
        config: DecisionTraceConfig,
        store: Arc<dyn DecisionTraceStore>,
        clock: SharedDeliveryClock,
    ) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn hash_destination(&self, destination: &str) -> String {
        hash_destination(destination, self.config.hash_salt.as_deref())
    }

    /// Records one decision. Never fails: store errors are logged and swallowed.
    pub fn record(&self, input: DecisionTraceInput) -> DecisionTrace {
        let trace = DecisionTrace {
            trace_id: Uuid::new_v4().to_string(),
            message_id: input.message_id.trim().to_string(),
            destination_hash: self.hash_destination(&input.destination),
            timestamp_unix_ms: self.clock.now_unix_ms(),
            stage: input.stage,
            decision: input.decision,
            reason_code: input.reason_code,
            detail: input
                .detail
                .as_deref()
                .map(|detail| redact_detail(detail, self.config.detail_max_chars))
                .filter(|detail| !detail.is_empty()),
            next_eligible_at_unix_ms: input.next_eligible_at_unix_ms,
            correlation_id: input.correlation_id,
        };
        if let Err(error) = self.store.append(&trace) {
            tracing::warn!(
                trace_id = %trace.trace_id,
                reason_code = trace.reason_code.as_str(),
                error = %format!("{error:#}"),
                "decision trace persistence failed"
            );
        }
        tracing::debug!(
            trace_id = %trace.trace_id,
            message_id = %trace.message_id,
            destination = %trace.destination_hash,
            stage = trace.stage.as_str(),
            decision = trace.decision.as_str(),
            reason_code = trace.reason_code.as_str(),
            next_eligible_at_unix_ms = trace.next_eligible_at_unix_ms,
            "delivery decision"
        );
        trace
    }

    pub fn record_received(
        &self,
        message_id: &str,
        destination: &str,
        context: &DeliveryContext,
    ) -> DecisionTrace {
        self.record(
            DecisionTraceInput::new(
                message_id,
                destination,
                TraceStage::Received,
                TraceDecision::Respond,
                TraceReasonCode::InboundReceived,
            )
            .with_context(context),
        )
    }

    pub fn record_deduped(
        &self,
        message_id: &str,
        destination: &str,
        context: &DeliveryContext,
    ) -> DecisionTrace {
        self.record(
            DecisionTraceInput::new(
                message_id,
                destination,
                TraceStage::Dedupe,
                TraceDecision::Skip,
                TraceReasonCode::DuplicateMessage,
            )
            .with_context(context),
        )
    }

    pub fn record_policy_blocked(
        &self,
        message_id: &str,
        destination: &str,
        reason_code: TraceReasonCode,
        detail: &str,
        next_eligible_at_unix_ms: Option<u64>,
        context: &DeliveryContext,
    ) -> DecisionTrace {
        self.record(
            DecisionTraceInput::new(
                message_id,
                destination,
                TraceStage::Policy,
                TraceDecision::Skip,
                reason_code,
            )
            .with_detail(detail)
            .with_next_eligible_at(next_eligible_at_unix_ms)
            .with_context(context),
        )
    }

    pub fn record_no_route(
        &self,
        message_id: &str,
        destination: &str,
        detail: &str,
        context: &DeliveryContext,
    ) -> DecisionTrace {
        self.record(
            DecisionTraceInput::new(
                message_id,
                destination,
                TraceStage::Routing,
                TraceDecision::Skip,
                TraceReasonCode::NoRoute,
            )
            .with_detail(detail)
            .with_context(context),
        )
    }

    /// A generation failure that still answered with a fallback is a RESPOND;
    /// one without a fallback is an ERROR.
    pub fn record_ai_error(
        &self,
        message_id: &str,
        destination: &str,
        fallback_used: bool,
        detail: &str,
        context: &DeliveryContext,
    ) -> DecisionTrace {
        let (decision, reason_code) = if fallback_used {
            (TraceDecision::Respond, TraceReasonCode::AiErrorFallback)
        } else {
            (TraceDecision::Error, TraceReasonCode::AiErrorNoFallback)
        };
        self.record(
            DecisionTraceInput::new(
                message_id,
                destination,
                TraceStage::Generation,
                decision,
                reason_code,
            )
            .with_detail(detail)
            .with_context(context),
        )
    }

    pub fn record_send_failed(
        &self,
        message_id: &str,
        destination: &str,
        reason_code: TraceReasonCode,
        detail: &str,
        context: &DeliveryContext,
    ) -> DecisionTrace {
        self.record(
            DecisionTraceInput::new(
                message_id,
                destination,
                TraceStage::Send,
                TraceDecision::Error,
                reason_code,
            )
            .with_detail(detail)
            .with_context(context),
        )
    }

    pub fn record_queued(
        &self,
        message_id: &str,
        destination: &str,
        stage: TraceStage,
        reason_code: TraceReasonCode,
        next_eligible_at_unix_ms: Option<u64>,
        context: &DeliveryContext,
    ) -> DecisionTrace {
        self.record(
            DecisionTraceInput::new(
                message_id,
                destination,
                stage,
                TraceDecision::Defer,
                reason_code,
            )
            .with_next_eligible_at(next_eligible_at_unix_ms)
            .with_context(context),
        )
    }

    pub fn record_success(
        &self,
        message_id: &str,
        destination: &str,
        detail: &str,
        context: &DeliveryContext,
    ) -> DecisionTrace {
        self.record(
            DecisionTraceInput::new(
                message_id,
                destination,
                TraceStage::Send,
                TraceDecision::Respond,
                TraceReasonCode::Sent,
            )
            .with_detail(detail)
            .with_context(context),
        )
    }

    pub fn by_destination(&self, destination: &str) -> Result<Vec<DecisionTrace>> {
        self.by_destination_hash(&self.hash_destination(destination))
    }

    pub fn by_destination_hash(&self, destination_hash: &str) -> Result<Vec<DecisionTrace>> {
        self.filtered(&DecisionTraceFilter {
            destination_hash: Some(destination_hash.to_string()),
            ..DecisionTraceFilter::default()
        })
    }

    pub fn by_message_id(&self, message_id: &str) -> Result<Vec<DecisionTrace>> {
        self.filtered(&DecisionTraceFilter {
            message_id: Some(message_id.trim().to_string()),
            ..DecisionTraceFilter::default()
        })
    }

    /// Returns matching traces newest first, paginated.
    pub fn query(
        &self,
        filter: &DecisionTraceFilter,
        page: DecisionTracePageRequest,
    ) -> Result<DecisionTracePage> {
        let matched = self.filtered(filter)?;
        let limit = page.limit.clamp(1, DECISION_TRACE_QUERY_MAX_LIMIT);
        let total = matched.len();
        let traces = matched
            .into_iter()
            .skip(page.offset)
            .take(limit)
            .collect::<Vec<_>>();
        Ok(DecisionTracePage {
            total,
            offset: page.offset,
            limit,
            traces,
        })
    }

    pub fn summary(&self, filter: &DecisionTraceFilter) -> Result<DecisionTraceSummary> {
        let matched = self.filtered(filter)?;
        let mut summary = DecisionTraceSummary {
            total: matched.len(),
            ..DecisionTraceSummary::default()
        };
        for trace in &matched {
            *summary
                .by_decision
                .entry(trace.decision.as_str().to_string())
                .or_default() += 1;
            *summary
                .by_reason_code
                .entry(trace.reason_code.as_str().to_string())
                .or_default() += 1;
        }
        Ok(summary)
    }

    /// Projects traces into received/queued/processing/responded/skipped/errored
    /// counts. A received message counts as processing until a terminal trace
    /// (sent, skip or error) is recorded for its id.
    pub fn funnel(&self) -> Result<DeliveryFunnel> {
        let mut traces = self.store.load_all()?;
        traces.sort_by_key(|trace| trace.timestamp_unix_ms);
        let mut funnel = DeliveryFunnel::default();
        let mut received_ids = BTreeSet::new();
        let mut terminal_ids = BTreeSet::new();
        for trace in &traces {
            match (trace.stage, trace.decision) {
                (TraceStage::Received, _) => {
                    funnel.received += 1;
                    received_ids.insert(trace.message_id.as_str());
                    continue;
                }
                (_, TraceDecision::Defer) => funnel.queued += 1,
                (_, TraceDecision::Skip) => {
                    funnel.skipped += 1;
                    *funnel
                        .skip_reasons
                        .entry(trace.reason_code.as_str().to_string())
                        .or_default() += 1;
                }
                (_, TraceDecision::Error) => {
                    funnel.errored += 1;
                    *funnel
                        .error_reasons
                        .entry(trace.reason_code.as_str().to_string())
                        .or_default() += 1;
                }
                (_, TraceDecision::Respond) => {
                    if trace.reason_code == TraceReasonCode::Sent {
                        funnel.responded += 1;
                    }
                }
            }
            let terminal = matches!(trace.decision, TraceDecision::Skip | TraceDecision::Error)
                || trace.reason_code == TraceReasonCode::Sent
                || trace.reason_code == TraceReasonCode::InboundDrained;
            if terminal {
                terminal_ids.insert(trace.message_id.as_str());
            }
        }
        funnel.processing = received_ids
            .iter()
            .filter(|id| !terminal_ids.contains(*id))
            .count();
        Ok(funnel)
    }

    /// Bulk-deletes traces older than `days` days. Returns the number removed.
    pub fn purge_older_than_days(&self, days: u32) -> Result<usize> {
        let cutoff = self
            .clock
            .now_unix_ms()
            .saturating_sub(u64::from(days).saturating_mul(DAY_MS));
        let removed = self.store.purge_before(cutoff)?;
        if removed > 0 {
            tracing::info!(removed, days, "purged expired decision traces");
        }
        Ok(removed)
    }

    /// Applies the configured retention window, logging instead of failing.
    pub fn purge_expired(&self) -> usize {
        match self.purge_older_than_days(self.config.retention_days) {
            Ok(removed) => removed,
            Err(error) => {
                tracing::warn!(error = %format!("{error:#}"), "decision trace retention purge failed");
                0
            }
        }
    }

    pub fn retention_sweep_interval_ms(&self) -> u64 {
        self.config.retention_sweep_interval_ms
    }

    fn filtered(&self, filter: &DecisionTraceFilter) -> Result<Vec<DecisionTrace>> {
        let mut traces = self
            .store
            .load_all()?
            .into_iter()
            .filter(|trace| filter.matches(trace))
            .collect::<Vec<_>>();
        traces.sort_by(|left, right| right.timestamp_unix_ms.cmp(&left.timestamp_unix_ms));
        Ok(traces)
    }
}
