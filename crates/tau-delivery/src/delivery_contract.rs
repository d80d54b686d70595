//! Collaborator contracts consumed by the delivery pipeline.
//!
//! The channel transport, session store, content-policy evaluator and inbound
//! processor are external systems. The pipeline reaches them only through the
//! narrow async traits below and treats every failure they report as data.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::delivery_error::ChannelSendError;
use crate::delivery_inbound::QueuedInboundMessage;

pub const DELIVERY_CONTEXT_MAX_ATTRIBUTES: usize = 16;
pub const DELIVERY_CONTEXT_MAX_KEY_CHARS: usize = 64;
pub const DELIVERY_CONTEXT_MAX_VALUE_CHARS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `MessageKind` values.
pub enum MessageKind {
    #[default]
    Reply,
    Transactional,
    Notification,
    FollowUp,
    Promotional,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Transactional => "transactional",
            Self::Notification => "notification",
            Self::FollowUp => "follow_up",
            Self::Promotional => "promotional",
        }
    }

    /// Proactive kinds are subject to the order-status and recency gates.
    pub fn is_proactive(self) -> bool {
        matches!(self, Self::FollowUp | Self::Promotional)
    }

    pub fn pacing_category(self) -> PacingCategory {
        match self {
            Self::Transactional | Self::Notification => PacingCategory::Transactional,
            Self::Reply => PacingCategory::Conversational,
            Self::FollowUp | Self::Promotional => PacingCategory::Bulk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Pacing bands applied before a send reaches the transport.
pub enum PacingCategory {
    Transactional,
    Conversational,
    Bulk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
/// Fixed-shape correlation context carried through buffers, gates and traces.
pub struct DeliveryContext {
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub message_kind: MessageKind,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

impl DeliveryContext {
    pub fn new(message_kind: MessageKind) -> Self {
        Self {
            correlation_id: None,
            message_kind,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        let trimmed = correlation_id.trim();
        self.correlation_id = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    /// Adds one attribute, truncating key/value and ignoring inserts past the
    /// attribute cap. Returns false when the attribute was dropped.
    pub fn insert_attribute(&mut self, key: &str, value: &str) -> bool {
        let key = bounded(key.trim(), DELIVERY_CONTEXT_MAX_KEY_CHARS);
        if key.is_empty() {
            return false;
        }
        if !self.attributes.contains_key(&key)
            && self.attributes.len() >= DELIVERY_CONTEXT_MAX_ATTRIBUTES
        {
            return false;
        }
        self.attributes
            .insert(key, bounded(value, DELIVERY_CONTEXT_MAX_VALUE_CHARS));
        true
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.insert_attribute(key, value);
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

fn bounded(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `OrderStatus` values.
pub enum OrderStatus {
    #[default]
    None,
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Confirmed | Self::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
/// Session view exposed by the external session store.
pub struct DeliverySession {
    #[serde(default)]
    pub opted_out: bool,
    #[serde(default)]
    pub blacklisted: bool,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub converted: bool,
    #[serde(default)]
    pub last_user_interaction_unix_ms: Option<u64>,
    #[serde(default)]
    pub last_follow_up_unix_ms: Option<u64>,
    #[serde(default)]
    pub cooldown_until_unix_ms: Option<u64>,
    #[serde(default)]
    pub order_status: OrderStatus,
}

impl DeliverySession {
    /// Returns the no-reach reason code, if any.
    pub fn no_reach_reason(&self) -> Option<&'static str> {
        if self.opted_out {
            Some("opted_out")
        } else if self.blacklisted {
            Some("blacklisted")
        } else if self.closed {
            Some("closed")
        } else {
            None
        }
    }

    /// Gate-2 reason for a send of `message_kind`. A converted destination is
    /// unreachable for proactive kinds only.
    pub fn no_reach_reason_for(&self, message_kind: MessageKind) -> Option<&'static str> {
        self.no_reach_reason()
            .or_else(|| (self.converted && message_kind.is_proactive()).then_some("converted"))
    }

    /// Returns the reason a queued follow-up should be dropped, if any.
    pub fn follow_up_ineligible_reason(&self) -> Option<&'static str> {
        if self.converted {
            return Some("converted");
        }
        self.no_reach_reason()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Acknowledgement returned by a transport for an accepted send.
pub struct ChannelSendReceipt {
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Outcome returned by the content-policy evaluator.
pub struct ContentPolicyVerdict {
    pub ok: bool,
    #[serde(default)]
    pub transformed_content: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ContentPolicyVerdict {
    pub fn allow() -> Self {
        Self {
            ok: true,
            transformed_content: None,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            transformed_content: None,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
/// Trait contract for `ChannelTransport` behavior.
///
/// `Ok(None)` is how some transports signal a failed send; the gate treats it
/// as a failure.
pub trait ChannelTransport: Send + Sync {
    async fn send_message(
        &self,
        address: &str,
        content: &str,
    ) -> Result<Option<ChannelSendReceipt>, ChannelSendError>;
}

#[async_trait]
/// Trait contract for `SessionStore` behavior.
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, address: &str) -> Option<DeliverySession>;
}

#[async_trait]
/// Trait contract for `ContentPolicyEvaluator` behavior.
pub trait ContentPolicyEvaluator: Send + Sync {
    async fn validate(
        &self,
        content: &str,
        context: &DeliveryContext,
    ) -> Result<ContentPolicyVerdict>;
}

#[async_trait]
/// Trait contract for the conversation-layer processor fed by inbound drains.
pub trait InboundProcessor: Send + Sync {
    async fn process(&self, message: &QueuedInboundMessage) -> Result<()>;
}

#[derive(Debug, Default)]
/// Map-backed session store used by the harness and tests.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, DeliverySession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, address: &str, session: DeliverySession) {
        match self.sessions.write() {
            Ok(mut sessions) => {
                sessions.insert(address.to_string(), session);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(address.to_string(), session);
            }
        }
    }

    pub fn remove(&self, address: &str) -> Option<DeliverySession> {
        match self.sessions.write() {
            Ok(mut sessions) => sessions.remove(address),
            Err(poisoned) => poisoned.into_inner().remove(address),
        }
    }

    /// Applies `update` to an existing session. Returns false when missing.
    pub fn update(&self, address: &str, update: impl FnOnce(&mut DeliverySession)) -> bool {
        let mut sessions = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match sessions.get_mut(address) {
            Some(session) => {
                update(session);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_session(&self, address: &str) -> Option<DeliverySession> {
        match self.sessions.read() {
            Ok(sessions) => sessions.get(address).cloned(),
            Err(poisoned) => poisoned.into_inner().get(address).cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Content policy that admits everything unchanged.
pub struct AllowAllContentPolicy;

#[async_trait]
impl ContentPolicyEvaluator for AllowAllContentPolicy {
    async fn validate(
        &self,
        _content: &str,
        _context: &DeliveryContext,
    ) -> Result<ContentPolicyVerdict> {
        Ok(ContentPolicyVerdict::allow())
    }
}

#[derive(Clone)]
/// Outbound collaborators shared by the admission gate and the scheduler.
pub struct DeliveryCollaborators {
    pub transport: Arc<dyn ChannelTransport>,
    pub sessions: Arc<dyn SessionStore>,
    pub content_policy: Arc<dyn ContentPolicyEvaluator>,
}

impl DeliveryCollaborators {
    /// Uses [`AllowAllContentPolicy`] until a real evaluator is attached.
    pub fn new(transport: Arc<dyn ChannelTransport>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            transport,
            sessions,
            content_policy: Arc::new(AllowAllContentPolicy),
        }
    }

    pub fn with_content_policy(mut self, content_policy: Arc<dyn ContentPolicyEvaluator>) -> Self {
        self.content_policy = content_policy;
        self
    }
}

impl std::fmt::Debug for DeliveryCollaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryCollaborators").finish_non_exhaustive()
    }
}
