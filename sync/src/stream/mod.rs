//! # Event Stream Protocol
//!
//! Everything between the upstream node and the reconciliation engine: the
//! wire messages, the diff classifier, the fingerprint cache, the two
//! concurrent actors (socket and healthcheck), the HTTP client used for
//! init and loss detection, and the state machine that ties them together.
//!
//! The machine is the only writer. The actors never touch shared state —
//! they post [`MachineEvent`](machine::MachineEvent)s into the machine's
//! queue and the machine processes one event to completion before taking
//! the next.

pub mod cache;
pub mod classifier;
pub mod event;
pub mod healthcheck;
pub mod machine;
pub mod node_api;
pub mod socket;

pub use cache::TxCache;
pub use classifier::{classify, VertexDiff};
pub use machine::{MachineEvent, MachineState, SyncMachine, SyncSettings};

use thiserror::Error;

use crate::engine::EngineError;

/// Errors that terminate (or interrupt) the sync machine.
#[derive(Debug, Error)]
pub enum StreamError {
    /// HTTP request to the node failed after all retries.
    #[error("node http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A message failed to decode.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The upstream is not the one we were configured to mirror. Fatal —
    /// continuing would fill the mirror with a different chain's data.
    #[error("upstream contract violation: {0}")]
    Contract(String),

    /// Reconciliation failed. The transaction rolled back; the machine
    /// stops rather than ack the event.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The machine's event queue closed — every actor is gone.
    #[error("machine event channel closed")]
    ChannelClosed,

    /// An operation that requires a finished initialization ran before it.
    #[error("machine is not initialized")]
    NotInitialized,
}
