//! # Ledger Domain Types
//!
//! Everything the mirror knows about the upstream DAG lives here: the wire
//! shape of a vertex as the event stream delivers it, and the record shapes
//! the store persists. The two are deliberately separate — the wire side is
//! whatever the upstream serializes, the record side is what reconciliation
//! needs to answer balance queries, and conflating them couples the mirror
//! schema to someone else's JSON.
//!
//! Identifiers are hex strings end to end. The upstream addresses vertices,
//! tokens, and outputs by hex id in every message, the mirror is keyed the
//! same way, and round-tripping through raw bytes would buy nothing but
//! conversion bugs.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifier aliases
// ---------------------------------------------------------------------------

/// Hex id of a vertex (transaction or block).
pub type VertexHash = String;

/// Token identifier. Either a vertex hash (the creating transaction) or the
/// native token literal [`NATIVE_TOKEN_ID`](crate::config::NATIVE_TOKEN_ID).
pub type TokenId = String;

/// Base58 address string.
pub type Address = String;

/// Wallet identifier assigned at registration time.
pub type WalletId = String;

// ---------------------------------------------------------------------------
// Vertex version
// ---------------------------------------------------------------------------

/// Wire discriminant for the kind of vertex. The numeric values are part of
/// the upstream serialization and must never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum VertexVersion {
    /// A mined block. Confirms transactions and carries a reward output.
    Block,
    /// An ordinary value-moving transaction.
    Transaction,
    /// A transaction that also creates a token whose id equals its own hash.
    TokenCreation,
    /// A block mined through merged mining. Block semantics, different proof.
    MergedMiningBlock,
    /// A nano-contract call. May create tokens as a side effect of a
    /// successful execution.
    NanoContract,
    /// A version this mirror doesn't know. Carried through untouched so an
    /// older mirror keeps syncing value movements from a newer chain.
    Other(u8),
}

impl TryFrom<u8> for VertexVersion {
    type Error = std::convert::Infallible;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Block,
            1 => Self::Transaction,
            2 => Self::TokenCreation,
            3 => Self::MergedMiningBlock,
            4 => Self::NanoContract,
            other => Self::Other(other),
        })
    }
}

impl From<VertexVersion> for u8 {
    fn from(version: VertexVersion) -> u8 {
        match version {
            VertexVersion::Block => 0,
            VertexVersion::Transaction => 1,
            VertexVersion::TokenCreation => 2,
            VertexVersion::MergedMiningBlock => 3,
            VertexVersion::NanoContract => 4,
            VertexVersion::Other(v) => v,
        }
    }
}

impl VertexVersion {
    /// `true` for both block flavors.
    pub fn is_block(self) -> bool {
        matches!(self, Self::Block | Self::MergedMiningBlock)
    }
}

// ---------------------------------------------------------------------------
// Nano-contract execution status
// ---------------------------------------------------------------------------

/// Execution status of a nano-contract call. Only `Success` makes the
/// call's side effects (token creation) real; a reorg can flip a vertex
/// between these states repeatedly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NcExecution {
    Success,
    Pending,
    Failure,
    Skipped,
}

// ---------------------------------------------------------------------------
// Wire types — what the event stream delivers
// ---------------------------------------------------------------------------

/// Reference to the output a transaction spends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Hash of the vertex that created the spent output.
    pub tx_id: VertexHash,
    /// Output index within that vertex.
    pub index: u32,
}

/// A decoded transaction output.
///
/// The upstream has already decoded the output script for us: the address,
/// timelock, and authority bits arrive as plain fields. An output is either
/// a value output (`authorities == 0`, `value` meaningful) or an authority
/// output (`authorities != 0`, conventionally `value == 0`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount moved, in the token's smallest unit. Zero for authority outputs.
    pub value: u64,
    /// Token this output moves.
    pub token: TokenId,
    /// Decoded destination address. `None` when the script doesn't resolve
    /// to an address (data outputs) — such outputs hold no mirrored value.
    #[serde(default)]
    pub address: Option<Address>,
    /// Unix timestamp before which the output cannot be spent.
    #[serde(default)]
    pub timelock: Option<i64>,
    /// Authority bitmask granted by this output. Zero for value outputs.
    #[serde(default)]
    pub authorities: u8,
}

impl TxOutput {
    /// `true` if this output grants authorities instead of moving value.
    pub fn is_authority(&self) -> bool {
        self.authorities != 0
    }
}

/// A token minted as a side effect of a nano-contract execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedToken {
    pub token_id: TokenId,
    pub name: String,
    pub symbol: String,
}

/// Nano-contract header attached to a vertex.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NanoHeader {
    /// Id of the contract being called.
    pub nc_id: String,
    /// Tokens this call creates when (and only while) its execution status
    /// is `Success`. Their ids differ from the vertex hash.
    #[serde(default)]
    pub created_tokens: Vec<CreatedToken>,
}

/// Mutable metadata of a vertex, as maintained by the upstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexMetadata {
    pub hash: VertexHash,
    /// Hashes of the vertices that void this one. Non-empty means voided.
    #[serde(default)]
    pub voided_by: Vec<VertexHash>,
    /// First block confirming this vertex, once one exists.
    #[serde(default)]
    pub first_block: Option<VertexHash>,
    /// Height, set once the vertex is (or is confirmed by) a block.
    #[serde(default)]
    pub height: Option<u64>,
    /// Nano-contract execution status, when the vertex carries a nano header.
    #[serde(default)]
    pub nc_execution: Option<NcExecution>,
}

/// A full vertex as delivered by `NEW_VERTEX_ACCEPTED`,
/// `VERTEX_METADATA_CHANGED`, and `VERTEX_REMOVED` events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VertexData {
    pub hash: VertexHash,
    pub timestamp: i64,
    pub version: VertexVersion,
    pub weight: f64,
    #[serde(default)]
    pub inputs: Vec<TxInput>,
    #[serde(default)]
    pub outputs: Vec<TxOutput>,
    /// Token name, for direct token-creation vertices.
    #[serde(default)]
    pub token_name: Option<String>,
    /// Token symbol, for direct token-creation vertices.
    #[serde(default)]
    pub token_symbol: Option<String>,
    /// Nano-contract header, when present.
    #[serde(default)]
    pub nano: Option<NanoHeader>,
    pub metadata: VertexMetadata,
}

impl VertexData {
    /// `true` for block vertices.
    pub fn is_block(&self) -> bool {
        self.version.is_block()
    }

    /// `true` when the upstream currently considers this vertex voided.
    pub fn is_voided(&self) -> bool {
        !self.metadata.voided_by.is_empty()
    }

    /// `true` when nano-contract semantics apply to this vertex.
    pub fn has_nano(&self) -> bool {
        self.nano.is_some() || self.version == VertexVersion::NanoContract
    }
}

// ---------------------------------------------------------------------------
// Stored records — what the mirror persists
// ---------------------------------------------------------------------------

/// The persisted row for a vertex.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VertexRecord {
    pub hash: VertexHash,
    /// Set once confirmed by (or mined as) a block.
    pub height: Option<u64>,
    pub timestamp: i64,
    pub version: VertexVersion,
    pub weight: f64,
    /// Mirrors "voided_by non-empty" upstream.
    pub voided: bool,
    pub nc_execution: Option<NcExecution>,
}

impl VertexRecord {
    /// Builds the stored row for a freshly accepted vertex.
    pub fn from_event(vertex: &VertexData) -> Self {
        Self {
            hash: vertex.hash.clone(),
            height: vertex.metadata.height,
            timestamp: vertex.timestamp,
            version: vertex.version,
            weight: vertex.weight,
            voided: vertex.is_voided(),
            nc_execution: vertex.metadata.nc_execution,
        }
    }
}

/// The persisted row for a transaction output, keyed `(tx_id, index)`.
///
/// UTXOs are never deleted on spend or void — `spent_by` and `voided` track
/// the lifecycle so that voiding a spender can restore the exact prior
/// state. Rows only disappear when their owning vertex is removed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoRecord {
    pub tx_id: VertexHash,
    pub index: u32,
    pub token: TokenId,
    pub address: Address,
    pub value: u64,
    /// Authority bitmask; zero for value outputs.
    pub authorities: u8,
    /// Unix timestamp before which this output cannot be spent.
    pub timelock: Option<i64>,
    /// Height at which this output unlocks (block rewards only).
    pub heightlock: Option<u64>,
    /// `true` while a height or time lock is still in force.
    pub locked: bool,
    /// The vertex that consumed this output, once spent.
    pub spent_by: Option<VertexHash>,
    /// `true` when the owning vertex is voided. Kept for audit; excluded
    /// from every balance and unlock query.
    pub voided: bool,
    /// Reservation mark set by the outgoing-transaction builder.
    pub tx_proposal: Option<String>,
    /// Position of this input within the reserving proposal.
    pub tx_proposal_index: Option<u32>,
}

impl UtxoRecord {
    /// `true` if the output is spendable right now: present, unspent,
    /// unlocked, and not voided.
    pub fn is_spendable(&self) -> bool {
        self.spent_by.is_none() && !self.locked && !self.voided
    }
}

/// Balance row for one `(address, token)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBalanceRecord {
    pub address: Address,
    pub token: TokenId,
    pub unlocked_balance: i64,
    pub locked_balance: i64,
    pub unlocked_authorities: u8,
    pub locked_authorities: u8,
    /// Earliest pending timelock among this pair's locked outputs.
    pub timelock_expires: Option<i64>,
    /// Number of non-voided transactions that touched this pair.
    pub transactions: u64,
    /// Cumulative value received by this pair.
    pub total_received: u64,
}

impl AddressBalanceRecord {
    /// An empty row for a pair seen for the first time.
    pub fn empty(address: &str, token: &str) -> Self {
        Self {
            address: address.to_string(),
            token: token.to_string(),
            unlocked_balance: 0,
            locked_balance: 0,
            unlocked_authorities: 0,
            locked_authorities: 0,
            timelock_expires: None,
            transactions: 0,
            total_received: 0,
        }
    }

    /// Total balance, locked and unlocked. The conservation invariant says
    /// this equals the sum of the pair's ledger-history rows.
    pub fn total(&self) -> i64 {
        self.unlocked_balance + self.locked_balance
    }
}

/// Balance row for one `(wallet, token)` pair — the aggregate of the
/// wallet's address balances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalanceRecord {
    pub wallet_id: WalletId,
    pub token: TokenId,
    pub unlocked_balance: i64,
    pub locked_balance: i64,
    pub unlocked_authorities: u8,
    pub locked_authorities: u8,
    pub timelock_expires: Option<i64>,
    pub transactions: u64,
    pub total_received: u64,
}

impl WalletBalanceRecord {
    /// An empty row for a pair seen for the first time.
    pub fn empty(wallet_id: &str, token: &str) -> Self {
        Self {
            wallet_id: wallet_id.to_string(),
            token: token.to_string(),
            unlocked_balance: 0,
            locked_balance: 0,
            unlocked_authorities: 0,
            locked_authorities: 0,
            timelock_expires: None,
            transactions: 0,
            total_received: 0,
        }
    }
}

/// One ledger-history row: the net balance change a vertex contributed to
/// an `(address, token)` pair. Deleted when the vertex is voided, so the
/// conservation check can simply sum what remains.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub address: Address,
    pub token: TokenId,
    pub tx_id: VertexHash,
    /// Net change, unlocked plus locked.
    pub balance: i64,
    pub timestamp: i64,
}

/// Registered token metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: TokenId,
    pub name: String,
    pub symbol: String,
    /// Number of non-voided transactions that moved this token.
    pub tx_count: u64,
}

/// A wallet registered with the mirror. Address derivation happens through
/// the [`AddressDeriver`](crate::wallet::AddressDeriver) collaborator; the
/// mirror only stores the results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub id: WalletId,
    /// Extended public key the wallet's addresses derive from.
    pub xpub: String,
    /// Gap of derived-but-unused addresses to keep ahead of the highest
    /// used index.
    pub max_gap: u32,
    /// Only started wallets receive balance aggregation and notifications.
    pub started: bool,
}

/// Maps one derived address back to its wallet and derivation index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: Address,
    pub wallet_id: WalletId,
    pub index: u32,
    /// Set once the address appears in a reconciled vertex.
    pub used: bool,
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// The slice of vertex metadata whose changes the mirror cares about.
/// Repeated notifications with an unchanged fingerprint carry no new
/// information and are acked without touching the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxFingerprint {
    pub voided: bool,
    pub first_block: Option<VertexHash>,
    pub height: Option<u64>,
}

impl TxFingerprint {
    /// Extracts the fingerprint from incoming metadata.
    pub fn of(metadata: &VertexMetadata) -> Self {
        Self {
            voided: !metadata.voided_by.is_empty(),
            first_block: metadata.first_block.clone(),
            height: metadata.height,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
