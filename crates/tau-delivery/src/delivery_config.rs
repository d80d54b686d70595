//! On-disk configuration for the delivery pipeline.
//!
//! The config file is JSON with a `schema_version` envelope. Every section is
//! optional and falls back to production defaults; validation rejects values
//! that would disable a guarantee (zero capacity, zero timeout, an empty
//! delivery window).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::delivery_contract::PacingCategory;

pub const DELIVERY_PIPELINE_CONFIG_SCHEMA_VERSION: u32 = 1;

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

fn delivery_pipeline_config_schema_version() -> u32 {
    DELIVERY_PIPELINE_CONFIG_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
/// Public struct `InboundBufferConfig` used across Tau components.
pub struct InboundBufferConfig {
    pub capacity: usize,
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
    pub dedupe_window_ms: u64,
    pub dedupe_capacity: usize,
}

impl Default for InboundBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            ttl_ms: 10 * MINUTE_MS,
            sweep_interval_ms: MINUTE_MS,
            dedupe_window_ms: 5 * MINUTE_MS,
            dedupe_capacity: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
/// Inclusive range of randomized pacing delay, in milliseconds.
pub struct PacingRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl PacingRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub const fn none() -> Self {
        Self::new(0, 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
/// Public struct `AdmissionGateConfig` used across Tau components.
pub struct AdmissionGateConfig {
    pub provider_retry_after_ms: u64,
    pub follow_up_recency_ms: u64,
    pub user_activity_recency_ms: u64,
    pub send_timeout_ms: u64,
    pub global_hourly_cap: u32,
    pub global_daily_cap: u32,
    pub per_destination_min_interval_ms: u64,
    pub per_destination_hourly_cap: u32,
    pub bucket_idle_gc_ms: u64,
    pub bucket_gc_interval_ms: u64,
    pub transactional_pacing_ms: PacingRange,
    pub conversational_pacing_ms: PacingRange,
    pub bulk_pacing_ms: PacingRange,
}

impl AdmissionGateConfig {
    pub fn pacing_for(&self, category: PacingCategory) -> PacingRange {
        match category {
            PacingCategory::Transactional => self.transactional_pacing_ms,
            PacingCategory::Conversational => self.conversational_pacing_ms,
            PacingCategory::Bulk => self.bulk_pacing_ms,
        }
    }

    /// Disables every pacing delay; used by tests and the dry-run harness.
    pub fn without_pacing(mut self) -> Self {
        self.transactional_pacing_ms = PacingRange::none();
        self.conversational_pacing_ms = PacingRange::none();
        self.bulk_pacing_ms = PacingRange::none();
        self
    }
}

impl Default for AdmissionGateConfig {
    fn default() -> Self {
        Self {
            provider_retry_after_ms: 5_000,
            follow_up_recency_ms: DAY_MS,
            user_activity_recency_ms: 30 * MINUTE_MS,
            send_timeout_ms: 30_000,
            global_hourly_cap: 200,
            global_daily_cap: 1_500,
            per_destination_min_interval_ms: MINUTE_MS,
            per_destination_hourly_cap: 10,
            bucket_idle_gc_ms: DAY_MS,
            bucket_gc_interval_ms: HOUR_MS,
            transactional_pacing_ms: PacingRange::new(500, 1_500),
            conversational_pacing_ms: PacingRange::new(1_000, 3_000),
            bulk_pacing_ms: PacingRange::new(3_000, 8_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
/// Canonical delivery-hour window shared by the gate and the scheduler.
pub struct DeliveryWindowConfig {
    pub timezone: String,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for DeliveryWindowConfig {
    fn default() -> Self {
        Self {
            timezone: "America/Bogota".to_string(),
            start_hour: 9,
            end_hour: 21,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
/// Public struct `FollowUpSchedulerConfig` used across Tau components.
pub struct FollowUpSchedulerConfig {
    pub capacity: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub rate_limited_backoff_ms: u64,
    pub min_send_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub summary_top_n: usize,
}

impl Default for FollowUpSchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            max_retries: 2,
            retry_backoff_ms: 30 * MINUTE_MS,
            rate_limited_backoff_ms: 15 * MINUTE_MS,
            min_send_interval_ms: 5_000,
            sweep_interval_ms: 10 * MINUTE_MS,
            summary_top_n: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
/// Public struct `DecisionTraceConfig` used across Tau components.
pub struct DecisionTraceConfig {
    pub detail_max_chars: usize,
    pub retention_days: u32,
    pub retention_sweep_interval_ms: u64,
    pub store_path: Option<PathBuf>,
    pub hash_salt: Option<String>,
}

impl Default for DecisionTraceConfig {
    fn default() -> Self {
        Self {
            detail_max_chars: 280,
            retention_days: 30,
            retention_sweep_interval_ms: 6 * HOUR_MS,
            store_path: None,
            hash_salt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `DeliveryPipelineConfig` used across Tau components.
pub struct DeliveryPipelineConfig {
    #[serde(default = "delivery_pipeline_config_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub inbound: InboundBufferConfig,
    #[serde(default)]
    pub gate: AdmissionGateConfig,
    #[serde(default)]
    pub window: DeliveryWindowConfig,
    #[serde(default)]
    pub follow_up: FollowUpSchedulerConfig,
    #[serde(default)]
    pub trace: DecisionTraceConfig,
}

impl Default for DeliveryPipelineConfig {
    fn default() -> Self {
        Self {
            schema_version: DELIVERY_PIPELINE_CONFIG_SCHEMA_VERSION,
            inbound: InboundBufferConfig::default(),
            gate: AdmissionGateConfig::default(),
            window: DeliveryWindowConfig::default(),
            follow_up: FollowUpSchedulerConfig::default(),
            trace: DecisionTraceConfig::default(),
        }
    }
}

/// Loads and validates the pipeline config; a missing file yields defaults.
pub fn load_delivery_pipeline_config(path: &Path) -> Result<DeliveryPipelineConfig> {
    if !path.exists() {
        return Ok(DeliveryPipelineConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read delivery config {}", path.display()))?;
    let parsed = serde_json::from_str::<DeliveryPipelineConfig>(&raw)
        .with_context(|| format!("failed to parse delivery config {}", path.display()))?;
    validate_delivery_pipeline_config(&parsed)
        .with_context(|| format!("invalid delivery config {}", path.display()))?;
    Ok(parsed)
}

pub fn validate_delivery_pipeline_config(config: &DeliveryPipelineConfig) -> Result<()> {
    if config.schema_version != DELIVERY_PIPELINE_CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported delivery config schema_version {} (expected {})",
            config.schema_version,
            DELIVERY_PIPELINE_CONFIG_SCHEMA_VERSION
        );
    }
    if config.inbound.capacity == 0 {
        bail!("inbound.capacity must be greater than 0");
    }
    if config.inbound.ttl_ms == 0 {
        bail!("inbound.ttl_ms must be greater than 0");
    }
    if config.inbound.sweep_interval_ms == 0 {
        bail!("inbound.sweep_interval_ms must be greater than 0");
    }
    if config.gate.send_timeout_ms == 0 {
        bail!("gate.send_timeout_ms must be greater than 0");
    }
    if config.gate.bucket_gc_interval_ms == 0 {
        bail!("gate.bucket_gc_interval_ms must be greater than 0");
    }
    for (name, range) in [
        ("gate.transactional_pacing_ms", config.gate.transactional_pacing_ms),
        ("gate.conversational_pacing_ms", config.gate.conversational_pacing_ms),
        ("gate.bulk_pacing_ms", config.gate.bulk_pacing_ms),
    ] {
        if range.min_ms > range.max_ms {
            bail!(
                "{name} min_ms {} exceeds max_ms {}",
                range.min_ms,
                range.max_ms
            );
        }
    }
    if config.window.start_hour > 23 || config.window.end_hour > 23 {
        bail!("window hours must be within 0..=23");
    }
    if config.window.start_hour == config.window.end_hour {
        bail!("window.start_hour must differ from window.end_hour");
    }
    if config.window.timezone.parse::<Tz>().is_err() {
        bail!("window.timezone '{}' is not a valid IANA timezone", config.window.timezone);
    }
    if config.follow_up.capacity == 0 {
        bail!("follow_up.capacity must be greater than 0");
    }
    if config.follow_up.sweep_interval_ms == 0 {
        bail!("follow_up.sweep_interval_ms must be greater than 0");
    }
    if config.trace.retention_sweep_interval_ms == 0 {
        bail!("trace.retention_sweep_interval_ms must be greater than 0");
    }
    Ok(())
}
