//! # Ledger Store — The Persistence Seam
//!
//! The reconciliation engine never talks to a database directly. It talks to
//! [`StoreTxn`], a unit-of-work over the mirror's records: point reads and
//! upserts, the handful of scans reconciliation needs, and commit/rollback.
//! [`LedgerStore`] hands out transactions, one at a time.
//!
//! Production deployments are expected to implement these traits over their
//! relational database of choice — the method list maps one-to-one onto
//! indexed queries. This crate ships [`SledStore`], an embedded
//! implementation used by the daemon's standalone mode and by every test.
//!
//! ## Transaction contract
//!
//! - A transaction sees its own writes.
//! - `commit` applies everything atomically; `rollback` (or dropping the
//!   transaction) applies nothing.
//! - The engine runs at most one transaction at a time, so implementations
//!   need to serialize writers, not interleave them.
//! - `set_last_event_id` must refuse to move the durable cursor backwards.
//!   That is a programming-contract violation, not a recoverable condition.

mod sled_store;

pub use sled_store::{SledStore, SledTxn};

use thiserror::Error;

use crate::ledger::{
    AddressBalanceRecord, AddressRecord, HistoryRecord, TokenId, TokenRecord, UtxoRecord,
    VertexRecord, WalletBalanceRecord, WalletRecord,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying storage engine failed.
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),

    /// A record failed to encode or decode.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Something attempted to move the durable cursor backwards. The cursor
    /// is advance-only; rewinding it would replay events into balances that
    /// already include them.
    #[error("cursor regression: stored {stored}, attempted {attempted}")]
    CursorRegression { stored: u64, attempted: u64 },
}

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// LedgerStore
// ---------------------------------------------------------------------------

/// Hands out units of work over the mirror.
pub trait LedgerStore: Send + Sync + 'static {
    /// The transaction type this store produces.
    type Txn: StoreTxn;

    /// Opens a new transaction. Blocks until any in-flight transaction from
    /// another handle has finished — writers are serialized.
    fn begin(&self) -> StoreResult<Self::Txn>;
}

// ---------------------------------------------------------------------------
// StoreTxn
// ---------------------------------------------------------------------------

/// A single unit of work. All reads see prior writes within the same
/// transaction; nothing is visible outside until `commit`.
pub trait StoreTxn: Sized {
    // -- Vertices -----------------------------------------------------------

    /// Reads a vertex row by hash.
    fn vertex(&self, hash: &str) -> StoreResult<Option<VertexRecord>>;

    /// Upserts a vertex row.
    fn put_vertex(&mut self, record: &VertexRecord) -> StoreResult<()>;

    /// Removes a vertex row. Used only when the upstream explicitly removes
    /// the vertex, or to clear void residue before a re-accept.
    fn delete_vertex(&mut self, hash: &str) -> StoreResult<()>;

    // -- UTXOs --------------------------------------------------------------

    /// Reads one UTXO by `(tx_id, index)`.
    fn utxo(&self, tx_id: &str, index: u32) -> StoreResult<Option<UtxoRecord>>;

    /// Upserts a UTXO row and keeps the lock/lookup indexes in step with
    /// the record's current state.
    fn put_utxo(&mut self, record: &UtxoRecord) -> StoreResult<()>;

    /// All UTXO rows created by a vertex, in output-index order.
    fn utxos_of_vertex(&self, tx_id: &str) -> StoreResult<Vec<UtxoRecord>>;

    /// Deletes every UTXO row a vertex created.
    fn delete_utxos_of_vertex(&mut self, tx_id: &str) -> StoreResult<()>;

    /// Non-voided UTXOs held by an `(address, token)` pair, spent or not,
    /// locked or not. The engine filters; the store just indexes.
    fn utxos_for_pair(&self, address: &str, token: &str) -> StoreResult<Vec<UtxoRecord>>;

    /// Locked, non-voided UTXOs whose heightlock is at or below `height`.
    fn locked_utxos_ready_at_height(&self, height: u64) -> StoreResult<Vec<UtxoRecord>>;

    /// Locked, non-voided UTXOs whose timelock is at or before `timestamp`.
    fn locked_utxos_expired_at(&self, timestamp: i64) -> StoreResult<Vec<UtxoRecord>>;

    // -- Balances -----------------------------------------------------------

    /// Reads one address balance row.
    fn address_balance(
        &self,
        address: &str,
        token: &str,
    ) -> StoreResult<Option<AddressBalanceRecord>>;

    /// Upserts an address balance row.
    fn put_address_balance(&mut self, record: &AddressBalanceRecord) -> StoreResult<()>;

    /// All balance rows for one address, across tokens.
    fn address_balances(&self, address: &str) -> StoreResult<Vec<AddressBalanceRecord>>;

    /// Reads one wallet balance row.
    fn wallet_balance(
        &self,
        wallet_id: &str,
        token: &str,
    ) -> StoreResult<Option<WalletBalanceRecord>>;

    /// Upserts a wallet balance row.
    fn put_wallet_balance(&mut self, record: &WalletBalanceRecord) -> StoreResult<()>;

    // -- Ledger history -----------------------------------------------------

    /// Appends one history row.
    fn put_history(&mut self, record: &HistoryRecord) -> StoreResult<()>;

    /// Deletes every history row a vertex created.
    fn delete_history_of_vertex(&mut self, tx_id: &str) -> StoreResult<()>;

    /// Sum of `balance` over the remaining history rows of a pair. The
    /// conservation invariant compares this against the balance row.
    fn history_sum(&self, address: &str, token: &str) -> StoreResult<i64>;

    // -- Tokens -------------------------------------------------------------

    /// Reads a token row.
    fn token(&self, token_id: &str) -> StoreResult<Option<TokenRecord>>;

    /// Upserts a token row.
    fn put_token(&mut self, record: &TokenRecord) -> StoreResult<()>;

    /// Deletes a token row.
    fn delete_token(&mut self, token_id: &str) -> StoreResult<()>;

    /// Records that `tx_id` created `token_id`. Idempotent.
    fn put_token_creation(&mut self, tx_id: &str, token_id: &str) -> StoreResult<()>;

    /// Token ids whose creation mapping points at `tx_id`.
    fn tokens_created_by(&self, tx_id: &str) -> StoreResult<Vec<TokenId>>;

    /// Removes one creation mapping.
    fn delete_token_creation(&mut self, tx_id: &str, token_id: &str) -> StoreResult<()>;

    // -- Wallets & addresses ------------------------------------------------

    /// Reads a wallet row.
    fn wallet(&self, wallet_id: &str) -> StoreResult<Option<WalletRecord>>;

    /// Upserts a wallet row.
    fn put_wallet(&mut self, record: &WalletRecord) -> StoreResult<()>;

    /// Looks up the wallet membership of an address.
    fn address_entry(&self, address: &str) -> StoreResult<Option<AddressRecord>>;

    /// Upserts an address row.
    fn put_address(&mut self, record: &AddressRecord) -> StoreResult<()>;

    /// All address rows of a wallet, in derivation-index order.
    fn wallet_addresses(&self, wallet_id: &str) -> StoreResult<Vec<AddressRecord>>;

    /// Highest derivation index present for a wallet, if any address exists.
    fn max_address_index(&self, wallet_id: &str) -> StoreResult<Option<u32>>;

    // -- Miners -------------------------------------------------------------

    /// Records an address as having received a block reward.
    fn put_miner(&mut self, address: &str) -> StoreResult<()>;

    /// `true` if the address has ever received a block reward.
    fn is_miner(&self, address: &str) -> StoreResult<bool>;

    // -- Durable cursor -----------------------------------------------------

    /// The last fully processed event id, if any event has been processed.
    fn last_event_id(&self) -> StoreResult<Option<u64>>;

    /// Advances the durable cursor. Equal ids are tolerated (re-acking the
    /// same event after a restart is legitimate); lower ids fail with
    /// [`StoreError::CursorRegression`].
    fn set_last_event_id(&mut self, id: u64) -> StoreResult<()>;

    // -- Lifecycle ----------------------------------------------------------

    /// Atomically applies every buffered write.
    fn commit(self) -> StoreResult<()>;

    /// Discards every buffered write.
    fn rollback(self);
}
