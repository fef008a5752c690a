//! # Wire Messages
//!
//! JSON shapes exchanged with the upstream event stream. Inbound, every
//! message of interest is an `EVENT` envelope stamped with the peer, stream,
//! and network identity — the machine checks those stamps on every single
//! message, because acking even one event from the wrong chain corrupts the
//! mirror. Outbound there are exactly two messages: `START_STREAM` to open
//! (or resume) the stream at the durable cursor, and `ACK` to advance the
//! upstream's send window.
//!
//! Unknown event types and unknown top-level message types decode into
//! explicit `Unknown` variants instead of failing — the upstream is allowed
//! to grow new event kinds without breaking deployed mirrors.

use serde::{Deserialize, Serialize};

use crate::ledger::VertexData;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Top-level message from the upstream stream.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamMessage {
    /// A ledger event wrapped in the stream identity envelope.
    #[serde(rename = "EVENT")]
    Event(EventEnvelope),

    /// Anything this mirror doesn't understand. Logged and dropped by the
    /// socket actor; not acked, because it carries no event id.
    #[serde(other)]
    Unknown,
}

/// The identity-stamped wrapper around every ledger event.
#[derive(Clone, Debug, Deserialize)]
pub struct EventEnvelope {
    pub peer_id: String,
    pub stream_id: String,
    pub network: String,
    /// Highest event id the upstream currently has. Lets the machine gauge
    /// how far behind it is.
    #[serde(default)]
    pub latest_event_id: Option<u64>,
    pub event: LedgerEvent,
}

/// One entry of the upstream's append-only event log.
#[derive(Clone, Debug, Deserialize)]
pub struct LedgerEvent {
    pub id: u64,
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: EventData,
    /// Set when the event belongs to a reorg group.
    #[serde(default)]
    pub group_id: Option<u64>,
}

/// The event types the upstream emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    NewVertexAccepted,
    VertexMetadataChanged,
    VertexRemoved,
    ReorgStarted,
    ReorgFinished,
    TokenCreated,
    #[serde(other)]
    Unknown,
}

/// Payload of a ledger event, discriminated by what it actually contains.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    /// Vertex-shaped payloads: accepted, metadata changed, removed.
    Vertex(Box<VertexData>),
    /// Reorg bookkeeping payloads. Also absorbs empty `{}` payloads — every
    /// field is optional.
    Reorg(ReorgData),
    /// Whatever else an unknown event type might carry.
    Other(serde_json::Value),
}

impl EventData {
    /// The vertex payload, when this event carries one.
    pub fn vertex(&self) -> Option<&VertexData> {
        match self {
            EventData::Vertex(vertex) => Some(vertex),
            _ => None,
        }
    }
}

/// Payload of `REORG_STARTED`.
#[derive(Clone, Debug, Deserialize)]
pub struct ReorgData {
    #[serde(default)]
    pub reorg_size: Option<u64>,
    #[serde(default)]
    pub previous_best_block: Option<String>,
    #[serde(default)]
    pub new_best_block: Option<String>,
    #[serde(default)]
    pub common_block: Option<String>,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Messages the mirror sends upstream.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Opens the stream at the durable cursor. Omitting
    /// `last_ack_event_id` asks for the stream from the very beginning.
    #[serde(rename = "START_STREAM")]
    StartStream {
        window_size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_ack_event_id: Option<u64>,
    },

    /// Confirms an event and slides the send window. Must be sent in
    /// strictly increasing id order.
    #[serde(rename = "ACK")]
    Ack { window_size: u64, ack_event_id: u64 },
}
