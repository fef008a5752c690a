//! # Balance & Authority Arithmetic
//!
//! Two kinds of value move through the ledger and they do not mix. Fungible
//! amounts add up: spend 30 of 100 and 70 remain. Authorities -- the right to
//! mint or melt a token -- do not add up: holding two mint authorities and
//! consuming one still leaves you able to mint. [`Authorities`] models the
//! latter as a fixed-width signed vector so that merging deltas can express
//! "an authority was consumed here" as a negative component, which the
//! reconciliation engine treats as a signal to recompute from the UTXO set
//! rather than a value to persist.
//!
//! [`Balance`] is the per-token delta (or accumulated state) carried through
//! reconciliation: amounts split into unlocked and locked buckets, the
//! earliest pending unlock, and the authority vectors for both buckets.
//! [`TokenBalanceMap`] groups balances by token for a single owner.
//!
//! All amount arithmetic is checked. Overflow means corrupt input or a bug,
//! and either way we refuse to write the result.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::TokenId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during balance arithmetic.
#[derive(Debug, Error)]
pub enum BalanceError {
    /// A checked addition overflowed. The operands are included for
    /// post-mortems; the write that triggered this never lands.
    #[error("balance overflow: {current} + {delta} (token {token_id})")]
    Overflow {
        /// The token whose balance overflowed.
        token_id: TokenId,
        /// The balance before the failed operation.
        current: i64,
        /// The delta that caused the overflow.
        delta: i64,
    },
}

// ---------------------------------------------------------------------------
// Authorities
// ---------------------------------------------------------------------------

/// Number of independent capability slots per token. The wire format packs
/// them into one byte, so eight is both the width and the ceiling.
pub const AUTHORITY_SLOTS: usize = 8;

/// Bit granting the right to mint new supply of a token.
pub const TOKEN_MINT_MASK: u8 = 0b01;

/// Bit granting the right to melt (destroy) supply of a token.
pub const TOKEN_MELT_MASK: u8 = 0b10;

/// A signed vector of capability slots.
///
/// Each slot holds -1, 0, or +1. A stored (persisted) authority set only
/// ever contains 0 or +1 per slot -- the bitmask form. The -1 state exists
/// only inside deltas, where it means "this operation consumed an authority
/// without producing a replacement". Merging keeps every slot in
/// `{-1, 0, +1}` by taking the sign of the sum: two grants are still one
/// capability, and a grant and a consumption cancel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorities {
    slots: [i8; AUTHORITY_SLOTS],
}

impl Authorities {
    /// Builds an authority vector from a stored bitmask. Each set bit
    /// becomes a +1 slot.
    pub fn from_mask(mask: u8) -> Self {
        let mut slots = [0i8; AUTHORITY_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate() {
            if mask & (1 << i) != 0 {
                *slot = 1;
            }
        }
        Self { slots }
    }

    /// Collapses the vector back into a bitmask. Only +1 slots set a bit;
    /// negative slots are dropped -- callers must check [`has_negative`]
    /// first and refresh from the UTXO set instead of persisting.
    ///
    /// [`has_negative`]: Authorities::has_negative
    pub fn to_mask(&self) -> u8 {
        let mut mask = 0u8;
        for (i, slot) in self.slots.iter().enumerate() {
            if *slot > 0 {
                mask |= 1 << i;
            }
        }
        mask
    }

    /// Element-wise merge: `sign(a[i] + b[i])`.
    ///
    /// Capabilities are binary, so +1 merged with +1 stays +1, and +1
    /// merged with -1 cancels to 0.
    pub fn merge(&self, other: &Self) -> Self {
        let mut slots = [0i8; AUTHORITY_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate() {
            *slot = (self.slots[i] + other.slots[i]).signum();
        }
        Self { slots }
    }

    /// Flips the sign of every slot. Used to turn an accept-time delta into
    /// its void-time inverse.
    pub fn negate(&self) -> Self {
        let mut slots = self.slots;
        for slot in &mut slots {
            *slot = -*slot;
        }
        Self { slots }
    }

    /// `true` if any slot is negative -- the refresh signal.
    pub fn has_negative(&self) -> bool {
        self.slots.iter().any(|s| *s < 0)
    }

    /// `true` if every slot is zero.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| *s == 0)
    }
}

// ---------------------------------------------------------------------------
// Balance
// ---------------------------------------------------------------------------

/// A per-token balance, used both as a delta (what one vertex contributed)
/// and as an accumulator while folding deltas together.
///
/// Amounts are signed 64-bit with checked arithmetic -- deltas are negative
/// on the spending side, and the stored rows may go negative only
/// transiently inside a single reconciliation transaction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// Value received by the owner in this delta (outputs only; spending
    /// does not reduce it). Negative only in void-time inverses.
    pub total_received: i64,

    /// Net change to the spendable amount.
    pub unlocked_amount: i64,

    /// Net change to the amount still under a height or time lock.
    pub locked_amount: i64,

    /// Earliest timestamp at which some locked portion unlocks, if any.
    /// Merging takes the minimum of two non-null values: the earliest
    /// pending unlock wins. A null means this delta carries no timelock,
    /// not that the balance is unlocked -- that's the caller's context.
    pub lock_expires: Option<i64>,

    /// Authority delta for the unlocked bucket.
    pub unlocked_authorities: Authorities,

    /// Authority delta for the locked bucket.
    pub locked_authorities: Authorities,
}

impl Balance {
    /// Merges two balances: amounts add (checked), lock expiries take the
    /// earliest non-null, authorities merge element-wise.
    pub fn merge(&self, other: &Self, token_id: &str) -> Result<Self, BalanceError> {
        let add = |a: i64, b: i64| {
            a.checked_add(b).ok_or(BalanceError::Overflow {
                token_id: token_id.to_string(),
                current: a,
                delta: b,
            })
        };

        let lock_expires = match (self.lock_expires, other.lock_expires) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        Ok(Self {
            total_received: add(self.total_received, other.total_received)?,
            unlocked_amount: add(self.unlocked_amount, other.unlocked_amount)?,
            locked_amount: add(self.locked_amount, other.locked_amount)?,
            lock_expires,
            unlocked_authorities: self.unlocked_authorities.merge(&other.unlocked_authorities),
            locked_authorities: self.locked_authorities.merge(&other.locked_authorities),
        })
    }

    /// The void-time inverse of this delta: every amount and authority
    /// negated. The lock expiry is dropped -- subtracting a delta never
    /// introduces a new pending unlock.
    pub fn negate(&self) -> Self {
        Self {
            total_received: -self.total_received,
            unlocked_amount: -self.unlocked_amount,
            locked_amount: -self.locked_amount,
            lock_expires: None,
            unlocked_authorities: self.unlocked_authorities.negate(),
            locked_authorities: self.locked_authorities.negate(),
        }
    }

    /// Net amount change, unlocked plus locked. This is what goes into the
    /// ledger-history row and what the conservation check sums.
    pub fn total(&self) -> i64 {
        self.unlocked_amount + self.locked_amount
    }
}

// ---------------------------------------------------------------------------
// TokenBalanceMap
// ---------------------------------------------------------------------------

/// The balances of a single owner across all tokens a vertex touched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenBalanceMap {
    balances: HashMap<TokenId, Balance>,
}

impl TokenBalanceMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `delta` into the slot for `token_id`, creating it if absent.
    pub fn add(&mut self, token_id: &str, delta: &Balance) -> Result<(), BalanceError> {
        let merged = match self.balances.get(token_id) {
            Some(existing) => existing.merge(delta, token_id)?,
            None => delta.clone(),
        };
        self.balances.insert(token_id.to_string(), merged);
        Ok(())
    }

    /// Returns the balance for a token, if the map has an entry for it.
    pub fn get(&self, token_id: &str) -> Option<&Balance> {
        self.balances.get(token_id)
    }

    /// Iterates over `(token_id, balance)` entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&TokenId, &Balance)> {
        self.balances.iter()
    }

    /// The set of tokens this map touches.
    pub fn tokens(&self) -> impl Iterator<Item = &TokenId> {
        self.balances.keys()
    }

    /// Negates every entry. See [`Balance::negate`].
    pub fn negate(&self) -> Self {
        Self {
            balances: self
                .balances
                .iter()
                .map(|(token, balance)| (token.clone(), balance.negate()))
                .collect(),
        }
    }

    /// `true` if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }

    /// Number of token entries.
    pub fn len(&self) -> usize {
        self.balances.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
