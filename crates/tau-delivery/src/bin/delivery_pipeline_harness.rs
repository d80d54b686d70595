use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use tau_delivery::{
    current_unix_timestamp_ms, hash_destination, load_delivery_pipeline_config,
    system_delivery_clock, ChannelSendError, ChannelSendReceipt, ChannelTransport,
    DeliveryCollaborators, DeliveryContext, DeliveryPipeline, DeliverySession, FollowUpRequest,
    FollowUpUrgency, InMemorySessionStore, InboundProcessor, MessageKind, OutboundSendRequest,
    QueuedInboundMessage,
};
use tracing_subscriber::EnvFilter;

const HARNESS_DESTINATION: &str = "harness-user-1";
const HARNESS_DRAIN_WAIT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HarnessScenario {
    Reconnect,
    FollowUp,
    All,
}

#[derive(Debug, Parser)]
#[command(
    name = "delivery_pipeline_harness",
    about = "Runs a scripted delivery pipeline scenario and prints the resulting statistics"
)]
struct HarnessArgs {
    #[arg(
        long,
        help = "Delivery pipeline config JSON; defaults are used when omitted or missing"
    )]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = HarnessScenario::All)]
    scenario: HarnessScenario,

    #[arg(
        long = "log-filter",
        default_value = "info",
        help = "tracing EnvFilter directive used when RUST_LOG is unset"
    )]
    log_filter: String,
}

struct LoggingTransport;

#[async_trait]
impl ChannelTransport for LoggingTransport {
    async fn send_message(
        &self,
        address: &str,
        content: &str,
    ) -> Result<Option<ChannelSendReceipt>, ChannelSendError> {
        let provider_message_id = format!("harness-{}", current_unix_timestamp_ms());
        tracing::info!(
            destination = %hash_destination(address, None),
            content_chars = content.chars().count(),
            %provider_message_id,
            "harness transport accepted message"
        );
        Ok(Some(ChannelSendReceipt {
            provider_message_id: Some(provider_message_id),
        }))
    }
}

struct LoggingProcessor;

#[async_trait]
impl InboundProcessor for LoggingProcessor {
    async fn process(&self, message: &QueuedInboundMessage) -> Result<()> {
        tracing::info!(
            message_id = %message.message_id,
            queued_ms = current_unix_timestamp_ms().saturating_sub(message.enqueued_at_unix_ms),
            "harness processor handled inbound message"
        );
        Ok(())
    }
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid --log-filter '{default_filter}'"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

async fn run_reconnect_scenario(pipeline: &DeliveryPipeline) -> Result<()> {
    let connection = pipeline.connection();
    connection.set_connecting()?;
    connection.set_connected()?;
    connection.set_reconnecting("harness scripted drop")?;
    for index in 1..=3 {
        let outcome = pipeline
            .accept_inbound(
                &format!("harness-inbound-{index}"),
                HARNESS_DESTINATION,
                &format!("inbound message {index}"),
                DeliveryContext::new(MessageKind::Reply),
            )
            .await;
        tracing::info!(index, ?outcome, "harness inbound accepted");
    }
    connection.set_connected()?;

    let deadline = tokio::time::Instant::now() + Duration::from_millis(HARNESS_DRAIN_WAIT_MS);
    while !pipeline.inbound().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    tracing::info!(
        remaining = pipeline.inbound().len(),
        "harness reconnect scenario finished"
    );
    Ok(())
}

async fn run_follow_up_scenario(pipeline: &DeliveryPipeline) -> Result<()> {
    if !pipeline.connection().is_connected() {
        pipeline.connection().set_connected()?;
    }
    let reply = pipeline
        .send(
            OutboundSendRequest::new(HARNESS_DESTINATION, "Gracias por escribirnos")
                .with_kind(MessageKind::Transactional)
                .bypass_time_window(),
        )
        .await;
    tracing::info!(sent = reply.sent, reason = %reply.reason, "harness direct send finished");

    let outcome = pipeline.schedule_follow_up(FollowUpRequest::new(
        HARNESS_DESTINATION,
        FollowUpUrgency::Medium,
        0,
        "harness quote pending",
        "¿Pudiste revisar la cotización?",
    ));
    tracing::info!(?outcome, "harness follow-up scheduled");
    let processed = pipeline.follow_ups().process(HARNESS_DESTINATION).await;
    tracing::info!(?processed, "harness follow-up processed");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = HarnessArgs::parse();
    init_tracing(&args.log_filter)?;

    let config = match args.config.as_deref() {
        Some(path) => load_delivery_pipeline_config(path)?,
        None => Default::default(),
    };
    let sessions = Arc::new(InMemorySessionStore::new());
    sessions.upsert(HARNESS_DESTINATION, DeliverySession::default());
    let pipeline = DeliveryPipeline::new(
        config,
        DeliveryCollaborators::new(Arc::new(LoggingTransport), sessions),
        system_delivery_clock(),
    )?;
    pipeline.set_inbound_processor(Arc::new(LoggingProcessor));
    pipeline.start_background_tasks();

    if matches!(args.scenario, HarnessScenario::Reconnect | HarnessScenario::All) {
        run_reconnect_scenario(&pipeline).await?;
    }
    if matches!(args.scenario, HarnessScenario::FollowUp | HarnessScenario::All) {
        run_follow_up_scenario(&pipeline).await?;
    }

    let stats = serde_json::to_string_pretty(&pipeline.stats())
        .context("failed to serialize delivery pipeline stats")?;
    pipeline.shutdown();
    println!("{stats}");
    Ok(())
}
