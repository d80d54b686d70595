use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tau_delivery::{
    AdmissionGateKind, ChannelSendError, ChannelSendReceipt, ChannelTransport,
    DecisionTraceFilter, DeliveryCollaborators, DeliveryContext, DeliveryPipeline,
    DeliveryPipelineConfig, DeliverySession, DeliveryWindowConfig, FollowUpAddOutcome,
    FollowUpRequest, FollowUpUrgency, InMemorySessionStore, InboundAcceptOutcome,
    InboundDrainStatus, InboundProcessor, ManualDeliveryClock, OutboundSendRequest,
    QueuedInboundMessage, TraceDecision, TraceReasonCode,
};

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
    latency: Duration,
}

impl RecordingTransport {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn sent_to(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("transport lock")
            .iter()
            .map(|(address, _)| address.clone())
            .collect()
    }
}

#[async_trait]
impl ChannelTransport for RecordingTransport {
    async fn send_message(
        &self,
        address: &str,
        content: &str,
    ) -> Result<Option<ChannelSendReceipt>, ChannelSendError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.sent
            .lock()
            .expect("transport lock")
            .push((address.to_string(), content.to_string()));
        Ok(Some(ChannelSendReceipt {
            provider_message_id: Some("wamid-integration".to_string()),
        }))
    }
}

#[derive(Default)]
struct RecordingProcessor {
    processed: Mutex<Vec<String>>,
}

impl RecordingProcessor {
    fn processed(&self) -> Vec<String> {
        self.processed.lock().expect("processor lock").clone()
    }
}

#[async_trait]
impl InboundProcessor for RecordingProcessor {
    async fn process(&self, message: &QueuedInboundMessage) -> Result<()> {
        self.processed
            .lock()
            .expect("processor lock")
            .push(message.message_id.clone());
        Ok(())
    }
}

struct Harness {
    clock: Arc<ManualDeliveryClock>,
    sessions: Arc<InMemorySessionStore>,
    transport: Arc<RecordingTransport>,
    pipeline: DeliveryPipeline,
}

fn utc_ms(hour: u32, minute: u32) -> u64 {
    let value = Utc
        .with_ymd_and_hms(2026, 3, 10, hour, minute, 0)
        .single()
        .expect("valid time");
    u64::try_from(value.timestamp_millis()).expect("positive timestamp")
}

fn harness(configure: impl FnOnce(&mut DeliveryPipelineConfig)) -> Harness {
    harness_with_transport(RecordingTransport::default(), configure)
}

fn harness_with_transport(
    transport: RecordingTransport,
    configure: impl FnOnce(&mut DeliveryPipelineConfig),
) -> Harness {
    let clock = Arc::new(ManualDeliveryClock::new(utc_ms(12, 0)));
    let sessions = Arc::new(InMemorySessionStore::new());
    let transport = Arc::new(transport);
    let mut config = DeliveryPipelineConfig::default();
    config.gate = config.gate.without_pacing();
    config.follow_up.min_send_interval_ms = 0;
    config.window = DeliveryWindowConfig {
        timezone: "UTC".to_string(),
        start_hour: 9,
        end_hour: 21,
    };
    configure(&mut config);
    let pipeline = DeliveryPipeline::new(
        config,
        DeliveryCollaborators::new(transport.clone(), sessions.clone()),
        clock.clone(),
    )
    .expect("pipeline");
    Harness {
        clock,
        sessions,
        transport,
        pipeline,
    }
}

#[tokio::test]
async fn integration_blocked_send_reports_reach_window_and_rate_gates_together() {
    let harness = harness(|config| config.gate.global_hourly_cap = 1);
    harness.pipeline.connection().set_connected().expect("connect");
    harness
        .sessions
        .upsert("user-2", DeliverySession::default());
    harness.sessions.upsert(
        "user-1",
        DeliverySession {
            blacklisted: true,
            ..DeliverySession::default()
        },
    );

    harness.clock.set(utc_ms(20, 45));
    let warmup = harness
        .pipeline
        .send(OutboundSendRequest::new("user-2", "Tu pedido salió"))
        .await;
    assert!(warmup.sent);

    harness.clock.set(utc_ms(21, 15));
    let result = harness
        .pipeline
        .send(OutboundSendRequest::new("user-1", "¿Sigues ahí?"))
        .await;
    assert!(!result.sent);
    assert!(!result.deferred);
    for gate in [
        AdmissionGateKind::NoReach,
        AdmissionGateKind::TimeWindow,
        AdmissionGateKind::RateLimit,
    ] {
        assert!(result.is_blocked_by(gate), "missing {}", gate.as_str());
    }
    assert_eq!(harness.transport.sent_to(), vec!["user-2"]);
}

#[tokio::test(start_paused = true)]
async fn integration_full_follow_up_queue_evicts_oldest_low_for_high() {
    let harness = harness(|config| config.follow_up.capacity = 3);
    for destination in ["user-1", "user-2", "user-3"] {
        assert_eq!(
            harness.pipeline.schedule_follow_up(FollowUpRequest::new(
                destination,
                FollowUpUrgency::Low,
                3_600_000,
                "cart abandoned",
                "¿Seguimos con tu pedido?",
            )),
            FollowUpAddOutcome::Added
        );
        harness.clock.advance(1_000);
    }

    let outcome = harness.pipeline.schedule_follow_up(FollowUpRequest::new(
        "user-4",
        FollowUpUrgency::High,
        60_000,
        "quote expiring",
        "Tu cotización vence hoy",
    ));
    assert_eq!(outcome, FollowUpAddOutcome::Added);
    let scheduler = harness.pipeline.follow_ups();
    assert_eq!(scheduler.len(), 3);
    assert!(!scheduler.contains("user-1"));
    assert!(scheduler.contains("user-4"));
    assert_eq!(harness.pipeline.stats().follow_ups.total, 3);
    harness.pipeline.shutdown();
}

#[tokio::test]
async fn integration_reconnect_drains_buffered_messages_once_in_order() {
    let harness = harness(|_| {});
    let processor = Arc::new(RecordingProcessor::default());
    harness.pipeline.set_inbound_processor(processor.clone());
    let connection = harness.pipeline.connection();
    connection
        .set_reconnecting("socket closed")
        .expect("reconnecting");

    for id in ["wamid-1", "wamid-2", "wamid-3"] {
        let outcome = harness
            .pipeline
            .accept_inbound(id, "user-1", "hola", DeliveryContext::default())
            .await;
        assert!(matches!(outcome, InboundAcceptOutcome::Queued { .. }));
        harness.clock.advance(10);
    }
    assert_eq!(harness.pipeline.inbound().len(), 3);
    assert!(processor.processed().is_empty());

    connection.set_connected().expect("connect");
    for _ in 0..100 {
        if harness.pipeline.inbound().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(harness.pipeline.inbound().is_empty());
    assert_eq!(processor.processed(), vec!["wamid-1", "wamid-2", "wamid-3"]);

    let second = harness.pipeline.drain_inbound().await;
    assert_eq!(second.status, InboundDrainStatus::Completed);
    assert_eq!(second.processed, 0);
    assert_eq!(processor.processed().len(), 3);
    assert_eq!(harness.pipeline.inbound().stats().drained_total, 3);
}

#[tokio::test(start_paused = true)]
async fn integration_follow_up_for_vanished_session_is_skipped_without_send() {
    let harness = harness(|_| {});
    harness.pipeline.connection().set_connected().expect("connect");
    harness
        .sessions
        .upsert("user-1", DeliverySession::default());
    assert!(harness
        .pipeline
        .schedule_follow_up(FollowUpRequest::new(
            "user-1",
            FollowUpUrgency::Medium,
            1_000,
            "quote pending",
            "¿Pudiste revisar la cotización?",
        ))
        .accepted());
    harness.sessions.remove("user-1");

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert!(!harness.pipeline.follow_ups().contains("user-1"));
    assert!(harness.transport.sent_to().is_empty());
    let skipped = harness
        .pipeline
        .recorder()
        .query(
            &DecisionTraceFilter {
                decision: Some(TraceDecision::Skip),
                reason_code: Some(TraceReasonCode::SessionMissing),
                ..DecisionTraceFilter::default()
            },
            Default::default(),
        )
        .expect("query");
    assert_eq!(skipped.total, 1);
}

#[tokio::test(start_paused = true)]
async fn integration_overlapping_sends_stay_within_global_and_destination_caps() {
    let harness = harness_with_transport(
        RecordingTransport::with_latency(Duration::from_millis(50)),
        |config| {
            config.gate.global_hourly_cap = 2;
            config.gate.per_destination_min_interval_ms = 60_000;
        },
    );
    harness.pipeline.connection().set_connected().expect("connect");

    let (first, second, third) = tokio::join!(
        harness
            .pipeline
            .send(OutboundSendRequest::new("user-1", "Tu pedido salió")),
        harness
            .pipeline
            .send(OutboundSendRequest::new("user-1", "Tu pedido llegó")),
        harness
            .pipeline
            .send(OutboundSendRequest::new("user-2", "Tu pedido salió")),
    );
    let sent = [&first, &second, &third]
        .iter()
        .filter(|result| result.sent)
        .count();
    assert_eq!(sent, 2);
    assert!(first.sent);
    assert!(!second.sent);
    assert!(second.is_blocked_by(AdmissionGateKind::RateLimit));
    assert!(third.sent);

    let (fourth, fifth) = tokio::join!(
        harness
            .pipeline
            .send(OutboundSendRequest::new("user-3", "Tu cotización")),
        harness
            .pipeline
            .send(OutboundSendRequest::new("user-4", "Tu cotización")),
    );
    assert!(!fourth.sent);
    assert!(!fifth.sent);
    assert_eq!(harness.transport.sent_to(), vec!["user-1", "user-2"]);
}
