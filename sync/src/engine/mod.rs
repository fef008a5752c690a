//! # Reconciliation Engine
//!
//! Applies the upstream's decisions — vertex accepted, voided, unvoided,
//! removed, confirmed, nano execution flipped — to the mirrored ledger.
//! Every operation runs inside exactly one store transaction: it either
//! lands whole or not at all, because balances must always reflect a whole
//! number of fully applied vertices.
//!
//! The engine is deliberately synchronous and single-file-of-truth: the
//! accept path computes a per-address delta map and the void path subtracts
//! the same map, so there is one place where balance arithmetic can be
//! wrong instead of two.
//!
//! Split across submodules by operation:
//!
//! - [`accept`] — the accept path: unlock sweeps, UTXO creation, spending,
//!   balance deltas, history rows.
//! - [`void`] — void, unvoid, and removal: the exact inverse of accept.
//! - [`tokens`] — token lifecycle under direct creation, nano-contract
//!   execution, and reorgs.

pub mod accept;
pub mod tokens;
pub mod void;

pub(crate) mod delta;

#[cfg(test)]
pub(crate) mod test_support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::balance::{Authorities, Balance, BalanceError, TokenBalanceMap};
use crate::ledger::{
    Address, AddressBalanceRecord, TokenId, UtxoRecord, VertexHash, WalletBalanceRecord, WalletId,
};
use crate::notify::{NotificationKind, NotificationSender, WalletNotification};
use crate::store::{LedgerStore, StoreError, StoreTxn};
use crate::wallet::AddressDeriver;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while reconciling a vertex. All of these are fatal to the
/// sync machine: the transaction that produced them is discarded and the
/// machine stops rather than ack an event it did not apply.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The store failed, or the durable cursor was asked to move backwards.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Balance arithmetic overflowed.
    #[error("balance error: {0}")]
    Balance(#[from] BalanceError),

    /// A vertex spends an output the mirror has never seen. The mirror is
    /// behind or corrupt either way; continuing would fabricate balances.
    #[error("missing input {tx_id}:{index} while applying {spender}")]
    MissingInput {
        spender: VertexHash,
        tx_id: VertexHash,
        index: u32,
    },

    /// A monotonic counter would leave its valid range.
    #[error("counter out of range for ({owner}, {token})")]
    CounterOverflow { owner: String, token: TokenId },

    /// Post-void validation found a balance row that disagrees with the sum
    /// of its remaining history rows.
    #[error(
        "balance mismatch for ({address}, {token}): balance rows say {recorded}, history says {derived}"
    )]
    BalanceMismatch {
        address: Address,
        token: TokenId,
        recorded: i64,
        derived: i64,
    },
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Balance changes one reconciliation caused for one started wallet.
#[derive(Clone, Debug)]
pub struct WalletDelta {
    pub wallet_id: WalletId,
    pub balances: TokenBalanceMap,
}

/// What a reconciliation did, for fan-out and logging.
#[derive(Clone, Debug)]
pub struct ReconcileReport {
    pub vertex: VertexHash,
    pub wallets: Vec<WalletDelta>,
}

/// Result of the accept path.
#[derive(Debug)]
pub enum AcceptOutcome {
    /// The vertex was applied in full.
    Applied(ReconcileReport),
    /// The vertex was already stored; token metadata was refreshed but no
    /// balance work happened.
    Duplicate,
    /// The payload arrived already voided. Nothing to mirror.
    SkippedVoided,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The reconciliation engine. One instance per sync machine; all methods
/// take `&self` and run a complete store transaction.
pub struct ReconciliationEngine<S: LedgerStore> {
    pub(crate) store: Arc<S>,
    pub(crate) deriver: Arc<dyn AddressDeriver>,
    pub(crate) notifications: NotificationSender,
    /// Blocks that must be found on top of a reward before it unlocks.
    /// Fetched from the node at machine init.
    pub(crate) reward_spend_min_blocks: u64,
    /// See [`note_duplicate`](Self::note_duplicate).
    duplicate_grace: Duration,
    started_at: Instant,
}

impl<S: LedgerStore> ReconciliationEngine<S> {
    /// Builds an engine over the given store and collaborators.
    pub fn new(
        store: Arc<S>,
        deriver: Arc<dyn AddressDeriver>,
        notifications: NotificationSender,
        reward_spend_min_blocks: u64,
        duplicate_grace: Duration,
    ) -> Self {
        Self {
            store,
            deriver,
            notifications,
            reward_spend_min_blocks,
            duplicate_grace,
            started_at: Instant::now(),
        }
    }

    // -- Cursor -------------------------------------------------------------

    /// Reads the durable cursor.
    pub fn last_event_id(&self) -> Result<Option<u64>, EngineError> {
        let txn = self.store.begin()?;
        let id = txn.last_event_id()?;
        txn.rollback();
        Ok(id)
    }

    /// Advances the durable cursor in its own transaction. Called after the
    /// per-vertex reconciliation has committed, never before.
    pub fn update_cursor(&self, id: u64) -> Result<(), EngineError> {
        let mut txn = self.store.begin()?;
        txn.set_last_event_id(id)?;
        txn.commit()?;
        Ok(())
    }

    // -- Shared internals ---------------------------------------------------

    /// Logs a duplicate "new vertex" notification. Right after start the
    /// upstream legitimately resends the tail of the stream, so the noise
    /// level depends on how long we have been running.
    pub(crate) fn note_duplicate(&self, hash: &str) {
        if self.started_at.elapsed() < self.duplicate_grace {
            debug!(vertex = %hash, "duplicate vertex notification shortly after start, skipping");
        } else {
            warn!(vertex = %hash, "duplicate vertex notification, skipping");
        }
    }

    /// Folds a per-address delta map into the address and wallet balance
    /// rows. `tx_step` is `+1` on accept and `-1` on void and is applied to
    /// every touched pair's `transactions` counter.
    ///
    /// Returns the deltas grouped by started wallet, for fan-out.
    pub(crate) fn apply_deltas(
        &self,
        txn: &mut S::Txn,
        deltas: &HashMap<Address, TokenBalanceMap>,
        tx_step: i64,
    ) -> Result<Vec<WalletDelta>, EngineError> {
        let mut wallet_deltas: HashMap<WalletId, TokenBalanceMap> = HashMap::new();

        for (address, map) in deltas {
            for (token, delta) in map.iter() {
                self.apply_address_delta(txn, address, token, delta, tx_step)?;
            }

            // Wallet membership: mark the address used and fold the delta
            // into its wallet if that wallet has been started.
            if let Some(mut entry) = txn.address_entry(address)? {
                if !entry.used {
                    entry.used = true;
                    txn.put_address(&entry)?;
                }
                let started = txn
                    .wallet(&entry.wallet_id)?
                    .map(|w| w.started)
                    .unwrap_or(false);
                if started {
                    let folded = wallet_deltas.entry(entry.wallet_id.clone()).or_default();
                    for (token, delta) in map.iter() {
                        folded.add(token, delta)?;
                    }
                }
            }
        }

        let mut result = Vec::new();
        for (wallet_id, map) in wallet_deltas {
            for (token, delta) in map.iter() {
                self.apply_wallet_delta(txn, &wallet_id, token, delta, tx_step)?;
            }
            if tx_step > 0 {
                if let Some(wallet) = txn.wallet(&wallet_id)? {
                    self.extend_wallet_gap(txn, &wallet)?;
                }
            }
            result.push(WalletDelta {
                wallet_id,
                balances: map,
            });
        }
        Ok(result)
    }

    fn apply_address_delta(
        &self,
        txn: &mut S::Txn,
        address: &str,
        token: &str,
        delta: &Balance,
        tx_step: i64,
    ) -> Result<(), EngineError> {
        let mut row = txn
            .address_balance(address, token)?
            .unwrap_or_else(|| AddressBalanceRecord::empty(address, token));

        row.unlocked_balance = add_amount(row.unlocked_balance, delta.unlocked_amount, token)?;
        row.locked_balance = add_amount(row.locked_balance, delta.locked_amount, token)?;
        row.total_received = add_counter(row.total_received, delta.total_received, address, token)?;
        row.transactions = add_counter(row.transactions, tx_step, address, token)?;
        if let Some(expires) = delta.lock_expires {
            row.timelock_expires = Some(match row.timelock_expires {
                Some(current) => current.min(expires),
                None => expires,
            });
        }

        let unlocked = Authorities::from_mask(row.unlocked_authorities)
            .merge(&delta.unlocked_authorities);
        let locked = Authorities::from_mask(row.locked_authorities).merge(&delta.locked_authorities);
        if unlocked.has_negative() || locked.has_negative() {
            // Authority possession is "do I still control any UTXO granting
            // this", not a summable quantity — recompute from the UTXO set.
            let (u, l) = refresh_address_authorities(txn, address, token)?;
            row.unlocked_authorities = u;
            row.locked_authorities = l;
        } else {
            row.unlocked_authorities = unlocked.to_mask();
            row.locked_authorities = locked.to_mask();
        }

        txn.put_address_balance(&row)?;
        Ok(())
    }

    fn apply_wallet_delta(
        &self,
        txn: &mut S::Txn,
        wallet_id: &str,
        token: &str,
        delta: &Balance,
        tx_step: i64,
    ) -> Result<(), EngineError> {
        let mut row = txn
            .wallet_balance(wallet_id, token)?
            .unwrap_or_else(|| WalletBalanceRecord::empty(wallet_id, token));

        row.unlocked_balance = add_amount(row.unlocked_balance, delta.unlocked_amount, token)?;
        row.locked_balance = add_amount(row.locked_balance, delta.locked_amount, token)?;
        row.total_received =
            add_counter(row.total_received, delta.total_received, wallet_id, token)?;
        row.transactions = add_counter(row.transactions, tx_step, wallet_id, token)?;
        if let Some(expires) = delta.lock_expires {
            row.timelock_expires = Some(match row.timelock_expires {
                Some(current) => current.min(expires),
                None => expires,
            });
        }

        let unlocked = Authorities::from_mask(row.unlocked_authorities)
            .merge(&delta.unlocked_authorities);
        let locked = Authorities::from_mask(row.locked_authorities).merge(&delta.locked_authorities);
        if unlocked.has_negative() || locked.has_negative() {
            // Wallet authorities aggregate the member addresses, which were
            // refreshed just above in apply_address_delta.
            let (u, l) = refresh_wallet_authorities(txn, wallet_id, token)?;
            row.unlocked_authorities = u;
            row.locked_authorities = l;
        } else {
            row.unlocked_authorities = unlocked.to_mask();
            row.locked_authorities = locked.to_mask();
        }

        txn.put_wallet_balance(&row)?;
        Ok(())
    }

    /// Clears lock state on the given UTXOs and moves their value from the
    /// locked to the unlocked bucket of the owning address (and wallet).
    pub(crate) fn unlock_utxos(
        &self,
        txn: &mut S::Txn,
        utxos: Vec<UtxoRecord>,
    ) -> Result<(), EngineError> {
        for mut utxo in utxos {
            utxo.locked = false;
            txn.put_utxo(&utxo)?;

            let mut row = txn
                .address_balance(&utxo.address, &utxo.token)?
                .unwrap_or_else(|| AddressBalanceRecord::empty(&utxo.address, &utxo.token));
            let value = amount_of(&utxo)?;
            row.locked_balance = add_amount(row.locked_balance, -value, &utxo.token)?;
            row.unlocked_balance = add_amount(row.unlocked_balance, value, &utxo.token)?;
            let (u, l) = refresh_address_authorities(txn, &utxo.address, &utxo.token)?;
            row.unlocked_authorities = u;
            row.locked_authorities = l;
            row.timelock_expires = pair_timelock_floor(txn, &utxo.address, &utxo.token)?;
            txn.put_address_balance(&row)?;

            if let Some(entry) = txn.address_entry(&utxo.address)? {
                let started = txn
                    .wallet(&entry.wallet_id)?
                    .map(|w| w.started)
                    .unwrap_or(false);
                if started {
                    let mut wrow = txn
                        .wallet_balance(&entry.wallet_id, &utxo.token)?
                        .unwrap_or_else(|| WalletBalanceRecord::empty(&entry.wallet_id, &utxo.token));
                    wrow.locked_balance = add_amount(wrow.locked_balance, -value, &utxo.token)?;
                    wrow.unlocked_balance = add_amount(wrow.unlocked_balance, value, &utxo.token)?;
                    let (u, l) = refresh_wallet_authorities(txn, &entry.wallet_id, &utxo.token)?;
                    wrow.unlocked_authorities = u;
                    wrow.locked_authorities = l;
                    txn.put_wallet_balance(&wrow)?;
                }
            }
        }
        Ok(())
    }

    /// Derives addresses until the wallet's unused gap is restored.
    pub(crate) fn extend_wallet_gap(
        &self,
        txn: &mut S::Txn,
        wallet: &crate::ledger::WalletRecord,
    ) -> Result<(), EngineError> {
        let addresses = txn.wallet_addresses(&wallet.id)?;
        let highest_used = addresses.iter().filter(|a| a.used).map(|a| a.index).max();
        let highest = addresses.iter().map(|a| a.index).max();

        let target = match highest_used {
            Some(used) => used + wallet.max_gap,
            None => wallet.max_gap.saturating_sub(1),
        };
        let next = highest.map(|h| h + 1).unwrap_or(0);
        if next > target {
            return Ok(());
        }

        let count = target - next + 1;
        for (address, index) in self.deriver.derive(&wallet.xpub, next, count) {
            txn.put_address(&crate::ledger::AddressRecord {
                address,
                wallet_id: wallet.id.clone(),
                index,
                used: false,
            })?;
        }
        Ok(())
    }

    /// Checks conservation for every touched pair: the balance row total
    /// must equal the sum of the remaining history rows.
    pub(crate) fn validate_pairs(
        &self,
        txn: &S::Txn,
        deltas: &HashMap<Address, TokenBalanceMap>,
    ) -> Result<(), EngineError> {
        for (address, map) in deltas {
            for token in map.tokens() {
                let recorded = txn
                    .address_balance(address, token)?
                    .map(|row| row.total())
                    .unwrap_or(0);
                let derived = txn.history_sum(address, token)?;
                if recorded != derived {
                    return Err(EngineError::BalanceMismatch {
                        address: address.clone(),
                        token: token.clone(),
                        recorded,
                        derived,
                    });
                }
            }
        }
        Ok(())
    }

    /// Best-effort fan-out after commit. Failures are logged and forgotten —
    /// notifications never roll back a reconciliation.
    pub(crate) fn publish(&self, kind: NotificationKind, report: &ReconcileReport) {
        for wallet in &report.wallets {
            let notification = WalletNotification {
                wallet_id: wallet.wallet_id.clone(),
                vertex: report.vertex.clone(),
                kind,
                balances: wallet.balances.clone(),
            };
            if let Err(e) = self.notifications.send(notification) {
                debug!(wallet = %wallet.wallet_id, "no notification receivers: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// Checked signed addition for balance amounts.
pub(crate) fn add_amount(current: i64, delta: i64, token: &str) -> Result<i64, EngineError> {
    current.checked_add(delta).ok_or_else(|| {
        EngineError::Balance(BalanceError::Overflow {
            token_id: token.to_string(),
            current,
            delta,
        })
    })
}

/// Checked signed step for unsigned counters (`transactions`,
/// `total_received`, token `tx_count`).
pub(crate) fn add_counter(
    current: u64,
    step: i64,
    owner: &str,
    token: &str,
) -> Result<u64, EngineError> {
    current
        .checked_add_signed(step)
        .ok_or_else(|| EngineError::CounterOverflow {
            owner: owner.to_string(),
            token: token.to_string(),
        })
}

/// A UTXO's value as a signed amount. Authority outputs carry no value.
pub(crate) fn amount_of(utxo: &UtxoRecord) -> Result<i64, EngineError> {
    if utxo.authorities != 0 {
        return Ok(0);
    }
    i64::try_from(utxo.value).map_err(|_| {
        EngineError::Balance(BalanceError::Overflow {
            token_id: utxo.token.clone(),
            current: 0,
            delta: i64::MAX,
        })
    })
}

/// Recomputes both authority masks of a pair from its spendable UTXO set.
pub(crate) fn refresh_address_authorities<T: StoreTxn>(
    txn: &T,
    address: &str,
    token: &str,
) -> Result<(u8, u8), EngineError> {
    let mut unlocked = 0u8;
    let mut locked = 0u8;
    for utxo in txn.utxos_for_pair(address, token)? {
        if utxo.spent_by.is_some() {
            continue;
        }
        if utxo.locked {
            locked |= utxo.authorities;
        } else {
            unlocked |= utxo.authorities;
        }
    }
    Ok((unlocked, locked))
}

/// Recomputes both authority masks of a wallet pair by OR-ing its member
/// addresses' stored masks.
pub(crate) fn refresh_wallet_authorities<T: StoreTxn>(
    txn: &T,
    wallet_id: &str,
    token: &str,
) -> Result<(u8, u8), EngineError> {
    let mut unlocked = 0u8;
    let mut locked = 0u8;
    for entry in txn.wallet_addresses(wallet_id)? {
        if let Some(row) = txn.address_balance(&entry.address, token)? {
            unlocked |= row.unlocked_authorities;
            locked |= row.locked_authorities;
        }
    }
    Ok((unlocked, locked))
}

/// Earliest timelock still pending among a pair's locked, unspent UTXOs.
pub(crate) fn pair_timelock_floor<T: StoreTxn>(
    txn: &T,
    address: &str,
    token: &str,
) -> Result<Option<i64>, EngineError> {
    let mut floor: Option<i64> = None;
    for utxo in txn.utxos_for_pair(address, token)? {
        if !utxo.locked || utxo.spent_by.is_some() {
            continue;
        }
        if let Some(timelock) = utxo.timelock {
            floor = Some(match floor {
                Some(current) => current.min(timelock),
                None => timelock,
            });
        }
    }
    Ok(floor)
}
