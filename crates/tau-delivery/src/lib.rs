//! Outbound and inbound message delivery control for Tau channel runtimes.
//!
//! Provides the connection state machine, disconnected inbound buffer,
//! outbound admission gate, follow-up scheduler and decision trace recorder,
//! plus [`DeliveryPipeline`] which wires them together.

pub mod delivery_config;
pub mod delivery_connection;
pub mod delivery_contract;
pub mod delivery_error;
pub mod delivery_followup;
pub mod delivery_gate;
pub mod delivery_inbound;
pub mod delivery_pipeline;
pub mod delivery_rate_limit;
pub mod delivery_redaction;
pub mod delivery_time;
pub mod delivery_trace;
pub mod delivery_trace_store;
pub mod delivery_window;

pub use delivery_config::*;
pub use delivery_connection::{
    ConnectionSnapshot, ConnectionState, ConnectionStateCallback, ConnectionStateMachine,
    ConnectionTransition,
};
pub use delivery_contract::*;
pub use delivery_error::*;
pub use delivery_followup::*;
pub use delivery_gate::*;
pub use delivery_inbound::{
    InboundBuffer, InboundBufferStats, InboundDrainReport, InboundDrainStatus,
    InboundEnqueueOutcome, QueuedInboundMessage, INBOUND_ADDRESS_MAX_CHARS,
    INBOUND_CONTENT_MAX_CHARS, INBOUND_MESSAGE_ID_MAX_CHARS,
};
pub use delivery_pipeline::*;
pub use delivery_rate_limit::*;
pub use delivery_redaction::*;
pub use delivery_time::*;
pub use delivery_trace::*;
pub use delivery_trace_store::*;
pub use delivery_window::*;
