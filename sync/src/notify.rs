//! # Downstream Fan-Out
//!
//! After a reconciliation commits, every affected started wallet gets a
//! notification carrying its per-token balance deltas. Consumers are the
//! daemon's metrics, a queue bridge, or a push-notification trigger -- all
//! best-effort. A full or absent consumer never affects reconciliation;
//! the transaction has already committed by the time anything is sent.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::balance::TokenBalanceMap;
use crate::ledger::{VertexHash, WalletId};

/// What happened to the vertex that produced the notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    VertexAccepted,
    VertexVoided,
}

/// Balance changes for one wallet from one reconciled vertex.
#[derive(Clone, Debug, Serialize)]
pub struct WalletNotification {
    pub wallet_id: WalletId,
    pub vertex: VertexHash,
    pub kind: NotificationKind,
    pub balances: TokenBalanceMap,
}

/// Sender half of the fan-out channel.
pub type NotificationSender = broadcast::Sender<WalletNotification>;

/// Creates the fan-out channel. Slow consumers lag and lose the oldest
/// messages; the mirror itself is the source of truth they can re-read.
pub fn channel(capacity: usize) -> (NotificationSender, broadcast::Receiver<WalletNotification>) {
    broadcast::channel(capacity)
}
