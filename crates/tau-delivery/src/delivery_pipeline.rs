//! Wiring for the full delivery pipeline.
//!
//! [`DeliveryPipeline`] owns one instance of every component, injects the
//! shared clock, connection and recorder into each, and connects the
//! connection state machine to the inbound drain. Background maintenance
//! (TTL sweep, follow-up eligibility sweep, trace retention, idle bucket GC)
//! runs as tokio tasks that `shutdown` aborts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::delivery_config::{
    validate_delivery_pipeline_config, DeliveryPipelineConfig, InboundBufferConfig,
};
use crate::delivery_connection::{
    lock_unpoisoned, ConnectionSnapshot, ConnectionState, ConnectionStateMachine,
};
use crate::delivery_contract::{DeliveryCollaborators, DeliveryContext, InboundProcessor};
use crate::delivery_error::DeliveryInputError;
use crate::delivery_followup::{
    FollowUpAddOutcome, FollowUpRequest, FollowUpScheduler, FollowUpSummary,
};
use crate::delivery_gate::{
    AdmissionGate, AdmissionGateStats, OutboundSendRequest, OutboundSendResult,
};
use crate::delivery_inbound::{
    validate_inbound_fields, InboundBuffer, InboundBufferStats, InboundDrainReport,
    InboundEnqueueOutcome, QueuedInboundMessage,
};
use crate::delivery_time::{is_expired_at, SharedDeliveryClock};
use crate::delivery_trace::{
    DecisionTraceInput, DecisionTraceRecorder, DeliveryFunnel, TraceDecision, TraceReasonCode,
    TraceStage,
};
use crate::delivery_trace_store::{
    DecisionTraceStore, InMemoryDecisionTraceStore, JsonlDecisionTraceStore,
};
use crate::delivery_window::DeliveryWindow;

pub const INBOUND_DRAIN_SUBSCRIBER_ID: &str = "inbound-drain";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `InboundAcceptOutcome` values.
pub enum InboundAcceptOutcome {
    Processed,
    Queued { expires_at_unix_ms: u64 },
    Duplicate,
    ProcessFailed { error: String },
    Rejected { error: DeliveryInputError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Aggregate read-only statistics across every pipeline component.
pub struct DeliveryPipelineStats {
    pub connection: ConnectionSnapshot,
    pub inbound: InboundBufferStats,
    pub gate: AdmissionGateStats,
    pub follow_ups: FollowUpSummary,
    pub funnel: Option<DeliveryFunnel>,
    pub dedupe_tracked: usize,
    pub background_tasks: usize,
}

/// Recently seen inbound message ids, bounded by age and count.
#[derive(Debug)]
struct DedupeWindow {
    window_ms: u64,
    capacity: usize,
    seen: HashMap<String, u64>,
    order: VecDeque<(String, u64)>,
}

impl DedupeWindow {
    fn new(config: &InboundBufferConfig) -> Self {
        Self {
            window_ms: config.dedupe_window_ms,
            capacity: config.dedupe_capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true when `message_id` was already seen inside the window;
    /// otherwise remembers it.
    fn check_and_insert(&mut self, message_id: &str, now_unix_ms: u64) -> bool {
        self.prune(now_unix_ms);
        if self.seen.contains_key(message_id) {
            return true;
        }
        self.seen.insert(message_id.to_string(), now_unix_ms);
        self.order.push_back((message_id.to_string(), now_unix_ms));
        while self.order.len() > self.capacity {
            self.evict_front();
        }
        false
    }

    fn prune(&mut self, now_unix_ms: u64) {
        while let Some((_, seen_at)) = self.order.front() {
            if seen_at.saturating_add(self.window_ms) > now_unix_ms {
                break;
            }
            self.evict_front();
        }
    }

    fn evict_front(&mut self) {
        if let Some((message_id, seen_at)) = self.order.pop_front() {
            if self.seen.get(&message_id) == Some(&seen_at) {
                self.seen.remove(&message_id);
            }
        }
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Connection state machine, inbound buffer, admission gate, follow-up
/// scheduler and decision trace recorder wired together.
pub struct DeliveryPipeline {
    config: DeliveryPipelineConfig,
    clock: SharedDeliveryClock,
    connection: Arc<ConnectionStateMachine>,
    recorder: Arc<DecisionTraceRecorder>,
    inbound: Arc<InboundBuffer>,
    gate: Arc<AdmissionGate>,
    follow_ups: Arc<FollowUpScheduler>,
    dedupe: Mutex<DedupeWindow>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field("config", &self.config)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl DeliveryPipeline {
    /// Builds the pipeline, opening the JSONL trace store when
    /// `trace.store_path` is configured.
    pub fn new(
        config: DeliveryPipelineConfig,
        collaborators: DeliveryCollaborators,
        clock: SharedDeliveryClock,
    ) -> Result<Self> {
        let store: Arc<dyn DecisionTraceStore> = match config.trace.store_path.as_ref() {
            Some(path) => Arc::new(
                JsonlDecisionTraceStore::new(path.clone())
                    .context("failed to open decision trace store")?,
            ),
            None => Arc::new(InMemoryDecisionTraceStore::default()),
        };
        Self::with_trace_store(config, collaborators, store, clock)
    }

    pub fn with_trace_store(
        config: DeliveryPipelineConfig,
        collaborators: DeliveryCollaborators,
        store: Arc<dyn DecisionTraceStore>,
        clock: SharedDeliveryClock,
    ) -> Result<Self> {
        validate_delivery_pipeline_config(&config)?;
        let window = DeliveryWindow::from_config(&config.window)?;
        let connection = Arc::new(ConnectionStateMachine::new(clock.clone()));
        let recorder = Arc::new(DecisionTraceRecorder::new(
            config.trace.clone(),
            store,
            clock.clone(),
        ));
        let inbound = Arc::new(InboundBuffer::new(
            config.inbound.clone(),
            connection.clone(),
            recorder.clone(),
            clock.clone(),
        ));
        let sessions = collaborators.sessions.clone();
        let gate = Arc::new(AdmissionGate::new(
            config.gate.clone(),
            window,
            connection.clone(),
            collaborators,
            recorder.clone(),
            clock.clone(),
        ));
        let follow_ups = FollowUpScheduler::new(
            config.follow_up.clone(),
            gate.clone(),
            sessions,
            recorder.clone(),
            clock.clone(),
        );
        install_drain_trigger(&connection, &inbound);
        Ok(Self {
            dedupe: Mutex::new(DedupeWindow::new(&config.inbound)),
            config,
            clock,
            connection,
            recorder,
            inbound,
            gate,
            follow_ups,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &DeliveryPipelineConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionStateMachine> {
        &self.connection
    }

    pub fn recorder(&self) -> &Arc<DecisionTraceRecorder> {
        &self.recorder
    }

    pub fn inbound(&self) -> &Arc<InboundBuffer> {
        &self.inbound
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    pub fn follow_ups(&self) -> &Arc<FollowUpScheduler> {
        &self.follow_ups
    }

    pub fn set_inbound_processor(&self, processor: Arc<dyn InboundProcessor>) {
        self.inbound.set_processor(processor);
    }

    /// Entry point for every inbound message.
    ///
    /// Records receipt, drops ids already seen inside the dedupe window, then
    /// buffers the message or hands it straight to the processor. A message
    /// the processor failed on stays buffered until its TTL; a redelivery of
    /// its id while connected runs a drain so the held copy is retried.
    pub async fn accept_inbound(
        &self,
        message_id: &str,
        address: &str,
        content: &str,
        context: DeliveryContext,
    ) -> InboundAcceptOutcome {
        if let Err(error) = validate_inbound_fields(message_id, address, content) {
            // The buffer traces and counts the malformed item.
            let _ = self.inbound.enqueue(message_id, address, content, context);
            return InboundAcceptOutcome::Rejected { error };
        }
        let message_id = message_id.trim();
        let address = address.trim();
        self.recorder.record_received(message_id, address, &context);

        let duplicate = lock_unpoisoned(&self.dedupe)
            .check_and_insert(message_id, self.clock.now_unix_ms());
        if duplicate {
            self.recorder.record_deduped(message_id, address, &context);
            return self.retry_held(message_id).await;
        }

        match self
            .inbound
            .enqueue(message_id, address, content, context.clone())
        {
            InboundEnqueueOutcome::Queued { expires_at_unix_ms } => {
                InboundAcceptOutcome::Queued { expires_at_unix_ms }
            }
            InboundEnqueueOutcome::Duplicate => InboundAcceptOutcome::Duplicate,
            InboundEnqueueOutcome::Rejected { error } => InboundAcceptOutcome::Rejected { error },
            InboundEnqueueOutcome::ProcessImmediately => {
                self.process_now(message_id, address, content, context).await
            }
        }
    }

    pub async fn drain_inbound(&self) -> InboundDrainReport {
        self.inbound.drain().await
    }

    pub async fn send(&self, request: OutboundSendRequest) -> OutboundSendResult {
        self.gate.send(request).await
    }

    pub fn schedule_follow_up(&self, request: FollowUpRequest) -> FollowUpAddOutcome {
        self.follow_ups.add(request)
    }

    pub fn cancel_follow_up(&self, destination: &str, reason: &str) -> bool {
        self.follow_ups.remove(destination, reason)
    }

    /// Spawns the periodic maintenance tasks. Returns the number started;
    /// a second call while tasks are running starts nothing.
    pub fn start_background_tasks(&self) -> usize {
        let mut background = lock_unpoisoned(&self.background);
        if !background.is_empty() {
            return 0;
        }
        background.push(self.inbound.spawn_sweeper());
        background.push(self.follow_ups.spawn_sweeper());
        background.push(self.gate.spawn_bucket_collector());
        background.push(spawn_trace_retention(self.recorder.clone()));
        tracing::info!(tasks = background.len(), "delivery background tasks started");
        background.len()
    }

    /// Stops background tasks, cancels follow-up timers and detaches the
    /// drain trigger.
    pub fn shutdown(&self) {
        let handles = std::mem::take(&mut *lock_unpoisoned(&self.background));
        for handle in &handles {
            handle.abort();
        }
        let cancelled_timers = self.follow_ups.shutdown();
        self.connection
            .remove_state_change(INBOUND_DRAIN_SUBSCRIBER_ID);
        tracing::info!(
            background_tasks = handles.len(),
            cancelled_timers,
            "delivery pipeline shut down"
        );
    }

    pub fn stats(&self) -> DeliveryPipelineStats {
        let funnel = match self.recorder.funnel() {
            Ok(funnel) => Some(funnel),
            Err(error) => {
                tracing::warn!(error = %format!("{error:#}"), "decision funnel unavailable");
                None
            }
        };
        DeliveryPipelineStats {
            connection: self.connection.snapshot(),
            inbound: self.inbound.stats(),
            gate: self.gate.stats(),
            follow_ups: self.follow_ups.summary(),
            funnel,
            dedupe_tracked: lock_unpoisoned(&self.dedupe).len(),
            background_tasks: lock_unpoisoned(&self.background).len(),
        }
    }

    async fn process_now(
        &self,
        message_id: &str,
        address: &str,
        content: &str,
        context: DeliveryContext,
    ) -> InboundAcceptOutcome {
        let Some(processor) = self.inbound.processor() else {
            tracing::error!(
                %message_id,
                "no inbound processor registered, holding message in buffer"
            );
            return match self.inbound.hold(
                message_id,
                address,
                content,
                context,
                "connected without processor",
            ) {
                InboundEnqueueOutcome::Queued { expires_at_unix_ms } => {
                    InboundAcceptOutcome::Queued { expires_at_unix_ms }
                }
                _ => InboundAcceptOutcome::Duplicate,
            };
        };
        let now_unix_ms = self.clock.now_unix_ms();
        let message = QueuedInboundMessage {
            message_id: message_id.to_string(),
            address: address.to_string(),
            content: content.to_string(),
            enqueued_at_unix_ms: now_unix_ms,
            expires_at_unix_ms: now_unix_ms.saturating_add(self.config.inbound.ttl_ms),
            context,
        };
        let processed = processor.process(&message).await;
        match processed {
            Ok(()) => {
                if self.inbound.release_held(message_id) {
                    tracing::debug!(%message_id, "dropped held copy after fresh delivery");
                }
                InboundAcceptOutcome::Processed
            }
            Err(error) => {
                let error = format!("{error:#}");
                tracing::warn!(%message_id, %error, "inbound processor failed");
                self.recorder.record(
                    DecisionTraceInput::new(
                        message_id,
                        address,
                        TraceStage::InboundBuffer,
                        TraceDecision::Error,
                        TraceReasonCode::InboundProcessFailed,
                    )
                    .with_detail(&error)
                    .with_context(&message.context),
                );
                self.inbound.hold(
                    message_id,
                    address,
                    content,
                    message.context,
                    "held after processor failure",
                );
                InboundAcceptOutcome::ProcessFailed { error }
            }
        }
    }

    /// Redelivered id: if an earlier copy is still held, drain now and report
    /// whether it went through.
    async fn retry_held(&self, message_id: &str) -> InboundAcceptOutcome {
        let Some(expires_at_unix_ms) = self.inbound.held_expiry(message_id) else {
            return InboundAcceptOutcome::Duplicate;
        };
        if !self.connection.is_connected()
            || is_expired_at(expires_at_unix_ms, self.clock.now_unix_ms())
        {
            return InboundAcceptOutcome::Duplicate;
        }
        let report = self.inbound.drain().await;
        tracing::debug!(
            %message_id,
            status = report.status.as_str(),
            processed = report.processed,
            "redelivery retried held inbound message"
        );
        if self.inbound.contains(message_id) {
            InboundAcceptOutcome::Duplicate
        } else {
            InboundAcceptOutcome::Processed
        }
    }
}

impl Drop for DeliveryPipeline {
    fn drop(&mut self) {
        for handle in lock_unpoisoned(&self.background).drain(..) {
            handle.abort();
        }
    }
}

/// Subscribes a drain to every transition into Connected.
fn install_drain_trigger(connection: &Arc<ConnectionStateMachine>, inbound: &Arc<InboundBuffer>) {
    let buffer = Arc::downgrade(inbound);
    let captured_runtime = Handle::try_current().ok();
    let installed = connection.on_state_change(
        INBOUND_DRAIN_SUBSCRIBER_ID,
        Arc::new(move |new_state, old_state| {
            if new_state != ConnectionState::Connected || old_state == ConnectionState::Connected {
                return;
            }
            let Some(buffer) = buffer.upgrade() else {
                return;
            };
            let Some(runtime) = Handle::try_current().ok().or_else(|| captured_runtime.clone())
            else {
                tracing::warn!("no tokio runtime available, inbound drain not started");
                return;
            };
            runtime.spawn(async move {
                let report = buffer.drain().await;
                tracing::debug!(
                    status = report.status.as_str(),
                    processed = report.processed,
                    remaining = report.remaining,
                    "reconnect drain finished"
                );
            });
        }),
    );
    if !installed {
        tracing::debug!("inbound drain trigger already installed");
    }
}

fn spawn_trace_retention(recorder: Arc<DecisionTraceRecorder>) -> JoinHandle<()> {
    let period = Duration::from_millis(recorder.retention_sweep_interval_ms().max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            recorder.purge_expired();
        }
    })
}
