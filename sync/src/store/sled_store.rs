//! # SledStore — Embedded Reference Store
//!
//! The embedded persistence layer for the mirror, built on sled. All records
//! live in a single named tree with prefixed composite keys, because sled's
//! `apply_batch` is atomic per tree — one tree means one batch means a
//! reconciliation transaction either lands whole or not at all.
//!
//! ## Key Layout
//!
//! | Prefix | Key                                        | Value                          |
//! |--------|--------------------------------------------|--------------------------------|
//! | `vtx`  | `hash`                                     | `bincode(VertexRecord)`        |
//! | `utx`  | `tx_id / index (4B BE)`                    | `bincode(UtxoRecord)`          |
//! | `aut`  | `address / token / tx_id / index (4B BE)`  | empty (pair lookup index)      |
//! | `lkh`  | `heightlock (8B BE) / tx_id / index (4B)`  | empty (height unlock index)    |
//! | `lkt`  | `timelock (8B BE) / tx_id / index (4B)`    | empty (time unlock index)      |
//! | `abl`  | `address / token`                          | `bincode(AddressBalanceRecord)`|
//! | `wbl`  | `wallet_id / token`                        | `bincode(WalletBalanceRecord)` |
//! | `hst`  | `address / token / tx_id`                  | `bincode(HistoryRecord)`       |
//! | `htx`  | `tx_id / address / token`                  | empty (history reverse index)  |
//! | `tok`  | `token_id`                                 | `bincode(TokenRecord)`         |
//! | `tkc`  | `tx_id / token_id`                         | empty (creation mapping)       |
//! | `wal`  | `wallet_id`                                | `bincode(WalletRecord)`        |
//! | `adr`  | `address`                                  | `bincode(AddressRecord)`       |
//! | `wad`  | `wallet_id / index (4B BE)`                | address (UTF-8)                |
//! | `mnr`  | `address`                                  | empty                          |
//! | `met`  | `last_event_id`                            | `u64` (8B BE)                  |
//!
//! Numeric key components are big-endian so sled's lexicographic ordering
//! matches numeric ordering — the unlock sweeps walk their index in height
//! or timestamp order and stop at the first entry past the bound.
//!
//! ## Transactions
//!
//! A [`SledTxn`] buffers every write in an overlay map (`None` marks a
//! deletion). Reads check the overlay first, then the tree, so a
//! transaction sees its own writes. `commit` turns the overlay into one
//! sled `Batch`; `rollback` just drops it. A store-wide mutex serializes
//! transactions — the sync machine only ever runs one, but the status API
//! reads through the same seam and must not observe a half-built overlay.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Batch, Tree};

use super::{LedgerStore, StoreError, StoreResult, StoreTxn};
use crate::ledger::{
    AddressBalanceRecord, AddressRecord, HistoryRecord, TokenId, TokenRecord, UtxoRecord,
    VertexRecord, WalletBalanceRecord, WalletRecord,
};

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

fn enc<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn dec<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Key construction
// ---------------------------------------------------------------------------

const SEP: u8 = b'/';

fn join(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len() + 1).sum::<usize>();
    let mut key = Vec::with_capacity(len);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(SEP);
        }
        key.extend_from_slice(part);
    }
    key
}

fn vertex_key(hash: &str) -> Vec<u8> {
    join(&[b"vtx", hash.as_bytes()])
}

fn utxo_key(tx_id: &str, index: u32) -> Vec<u8> {
    join(&[b"utx", tx_id.as_bytes(), &index.to_be_bytes()])
}

fn pair_index_key(address: &str, token: &str, tx_id: &str, index: u32) -> Vec<u8> {
    join(&[
        b"aut",
        address.as_bytes(),
        token.as_bytes(),
        tx_id.as_bytes(),
        &index.to_be_bytes(),
    ])
}

fn heightlock_key(height: u64, tx_id: &str, index: u32) -> Vec<u8> {
    join(&[
        b"lkh",
        &height.to_be_bytes(),
        tx_id.as_bytes(),
        &index.to_be_bytes(),
    ])
}

fn timelock_key(timelock: i64, tx_id: &str, index: u32) -> Vec<u8> {
    // Chain timestamps are non-negative; a negative input is clamped so it
    // cannot produce a key that sorts after every legitimate one.
    let ts = timelock.max(0) as u64;
    join(&[
        b"lkt",
        &ts.to_be_bytes(),
        tx_id.as_bytes(),
        &index.to_be_bytes(),
    ])
}

fn address_balance_key(address: &str, token: &str) -> Vec<u8> {
    join(&[b"abl", address.as_bytes(), token.as_bytes()])
}

fn wallet_balance_key(wallet_id: &str, token: &str) -> Vec<u8> {
    join(&[b"wbl", wallet_id.as_bytes(), token.as_bytes()])
}

fn history_key(address: &str, token: &str, tx_id: &str) -> Vec<u8> {
    join(&[b"hst", address.as_bytes(), token.as_bytes(), tx_id.as_bytes()])
}

fn history_index_key(tx_id: &str, address: &str, token: &str) -> Vec<u8> {
    join(&[b"htx", tx_id.as_bytes(), address.as_bytes(), token.as_bytes()])
}

fn token_key(token_id: &str) -> Vec<u8> {
    join(&[b"tok", token_id.as_bytes()])
}

fn token_creation_key(tx_id: &str, token_id: &str) -> Vec<u8> {
    join(&[b"tkc", tx_id.as_bytes(), token_id.as_bytes()])
}

fn wallet_key(wallet_id: &str) -> Vec<u8> {
    join(&[b"wal", wallet_id.as_bytes()])
}

fn address_key(address: &str) -> Vec<u8> {
    join(&[b"adr", address.as_bytes()])
}

fn wallet_address_key(wallet_id: &str, index: u32) -> Vec<u8> {
    join(&[b"wad", wallet_id.as_bytes(), &index.to_be_bytes()])
}

fn miner_key(address: &str) -> Vec<u8> {
    join(&[b"mnr", address.as_bytes()])
}

const CURSOR_KEY: &[u8] = b"met/last_event_id";

/// Splits a `... / tx_id / index (4B BE)` suffix from the end. The index is
/// fixed-width, so parsing from the back is unambiguous even though the
/// index bytes may themselves contain the separator.
fn split_utxo_suffix(suffix: &[u8]) -> Option<(String, u32)> {
    if suffix.len() < 5 {
        return None;
    }
    let (head, idx_bytes) = suffix.split_at(suffix.len() - 4);
    let head = head.strip_suffix(&[SEP])?;
    let tx_id = String::from_utf8(head.to_vec()).ok()?;
    let index = u32::from_be_bytes(idx_bytes.try_into().ok()?);
    Some((tx_id, index))
}

// ---------------------------------------------------------------------------
// SledStore
// ---------------------------------------------------------------------------

/// Embedded mirror store backed by a single sled tree.
///
/// Cheap to clone conceptually — wrap it in an `Arc` and share it between
/// the sync machine and the status API.
pub struct SledStore {
    db: sled::Db,
    tree: Tree,
    write_lock: Arc<Mutex<()>>,
}

impl SledStore {
    /// Opens or creates a store at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Creates a temporary store that vanishes on drop. Ideal for tests —
    /// no filesystem residue, no cleanup.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        let tree = db.open_tree("mirror")?;
        Ok(Self {
            db,
            tree,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Blocks until all committed data is durable on disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl LedgerStore for SledStore {
    type Txn = SledTxn;

    fn begin(&self) -> StoreResult<Self::Txn> {
        let guard = self.write_lock.lock_arc();
        Ok(SledTxn {
            tree: self.tree.clone(),
            overlay: BTreeMap::new(),
            _guard: guard,
        })
    }
}

// ---------------------------------------------------------------------------
// SledTxn
// ---------------------------------------------------------------------------

/// A buffered unit of work over the sled tree. See the module docs for the
/// overlay semantics.
pub struct SledTxn {
    tree: Tree,
    /// Buffered writes. `Some` is an upsert, `None` a deletion.
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl SledTxn {
    fn read(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        if let Some(buffered) = self.overlay.get(key) {
            return Ok(buffered.clone());
        }
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn write(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.overlay.insert(key, Some(value));
    }

    fn remove(&mut self, key: Vec<u8>) {
        self.overlay.insert(key, None);
    }

    /// Prefix scan merging the tree with the overlay, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for item in self.tree.scan_prefix(prefix) {
            let (key, value) = item?;
            merged.insert(key.to_vec(), value.to_vec());
        }
        for (key, value) in self.overlay.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn read_record<T: DeserializeOwned>(&self, key: &[u8]) -> StoreResult<Option<T>> {
        match self.read(key)? {
            Some(bytes) => Ok(Some(dec(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Index keys a UTXO record should currently occupy in the unlock
    /// indexes. Only locked rows are indexed; the sweeps never need to see
    /// anything else.
    fn lock_index_keys(record: &UtxoRecord) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        if record.locked {
            if let Some(height) = record.heightlock {
                keys.push(heightlock_key(height, &record.tx_id, record.index));
            }
            if let Some(timelock) = record.timelock {
                keys.push(timelock_key(timelock, &record.tx_id, record.index));
            }
        }
        keys
    }

    fn drop_utxo_indexes(&mut self, record: &UtxoRecord) {
        self.remove(pair_index_key(
            &record.address,
            &record.token,
            &record.tx_id,
            record.index,
        ));
        if let Some(height) = record.heightlock {
            self.remove(heightlock_key(height, &record.tx_id, record.index));
        }
        if let Some(timelock) = record.timelock {
            self.remove(timelock_key(timelock, &record.tx_id, record.index));
        }
    }

    /// Shared body of the two unlock sweeps: walk an ordered lock index up
    /// to `bound_key` (exclusive prefix comparison on the 8-byte bound) and
    /// load the still-relevant records.
    fn sweep_lock_index(&self, prefix: &[u8], bound: u64) -> StoreResult<Vec<UtxoRecord>> {
        let mut ready = Vec::new();
        for (key, _) in self.scan_prefix(prefix)? {
            let suffix = &key[prefix.len()..];
            if suffix.len() < 9 {
                continue;
            }
            let entry_bound = u64::from_be_bytes(
                suffix[..8]
                    .try_into()
                    .map_err(|_| StoreError::Serialization("bad lock index key".into()))?,
            );
            if entry_bound > bound {
                break;
            }
            let Some((tx_id, index)) = split_utxo_suffix(&suffix[9..]) else {
                continue;
            };
            // The record is authoritative; the index is only a candidate
            // list. Skip rows that were voided while still locked.
            if let Some(record) = self.utxo(&tx_id, index)? {
                if record.locked && !record.voided {
                    ready.push(record);
                }
            }
        }
        Ok(ready)
    }
}

impl StoreTxn for SledTxn {
    // -- Vertices -----------------------------------------------------------

    fn vertex(&self, hash: &str) -> StoreResult<Option<VertexRecord>> {
        self.read_record(&vertex_key(hash))
    }

    fn put_vertex(&mut self, record: &VertexRecord) -> StoreResult<()> {
        let bytes = enc(record)?;
        self.write(vertex_key(&record.hash), bytes);
        Ok(())
    }

    fn delete_vertex(&mut self, hash: &str) -> StoreResult<()> {
        self.remove(vertex_key(hash));
        Ok(())
    }

    // -- UTXOs --------------------------------------------------------------

    fn utxo(&self, tx_id: &str, index: u32) -> StoreResult<Option<UtxoRecord>> {
        self.read_record(&utxo_key(tx_id, index))
    }

    fn put_utxo(&mut self, record: &UtxoRecord) -> StoreResult<()> {
        // Reconcile the unlock indexes with the record's new state. The old
        // row may have been locked under a different key (or not at all).
        if let Some(old) = self.utxo(&record.tx_id, record.index)? {
            for key in Self::lock_index_keys(&old) {
                self.remove(key);
            }
        }
        for key in Self::lock_index_keys(record) {
            self.write(key, Vec::new());
        }
        self.write(
            pair_index_key(&record.address, &record.token, &record.tx_id, record.index),
            Vec::new(),
        );
        let bytes = enc(record)?;
        self.write(utxo_key(&record.tx_id, record.index), bytes);
        Ok(())
    }

    fn utxos_of_vertex(&self, tx_id: &str) -> StoreResult<Vec<UtxoRecord>> {
        let prefix = join(&[b"utx", tx_id.as_bytes(), b""]);
        let mut utxos = Vec::new();
        for (_, value) in self.scan_prefix(&prefix)? {
            utxos.push(dec(&value)?);
        }
        Ok(utxos)
    }

    fn delete_utxos_of_vertex(&mut self, tx_id: &str) -> StoreResult<()> {
        for record in self.utxos_of_vertex(tx_id)? {
            self.drop_utxo_indexes(&record);
            self.remove(utxo_key(&record.tx_id, record.index));
        }
        Ok(())
    }

    fn utxos_for_pair(&self, address: &str, token: &str) -> StoreResult<Vec<UtxoRecord>> {
        let prefix = join(&[b"aut", address.as_bytes(), token.as_bytes(), b""]);
        let mut utxos = Vec::new();
        for (key, _) in self.scan_prefix(&prefix)? {
            let Some((tx_id, index)) = split_utxo_suffix(&key[prefix.len()..]) else {
                continue;
            };
            if let Some(record) = self.utxo(&tx_id, index)? {
                if !record.voided {
                    utxos.push(record);
                }
            }
        }
        Ok(utxos)
    }

    fn locked_utxos_ready_at_height(&self, height: u64) -> StoreResult<Vec<UtxoRecord>> {
        self.sweep_lock_index(b"lkh/", height)
    }

    fn locked_utxos_expired_at(&self, timestamp: i64) -> StoreResult<Vec<UtxoRecord>> {
        self.sweep_lock_index(b"lkt/", timestamp.max(0) as u64)
    }

    // -- Balances -----------------------------------------------------------

    fn address_balance(
        &self,
        address: &str,
        token: &str,
    ) -> StoreResult<Option<AddressBalanceRecord>> {
        self.read_record(&address_balance_key(address, token))
    }

    fn put_address_balance(&mut self, record: &AddressBalanceRecord) -> StoreResult<()> {
        let bytes = enc(record)?;
        self.write(address_balance_key(&record.address, &record.token), bytes);
        Ok(())
    }

    fn address_balances(&self, address: &str) -> StoreResult<Vec<AddressBalanceRecord>> {
        let prefix = join(&[b"abl", address.as_bytes(), b""]);
        let mut balances = Vec::new();
        for (_, value) in self.scan_prefix(&prefix)? {
            balances.push(dec(&value)?);
        }
        Ok(balances)
    }

    fn wallet_balance(
        &self,
        wallet_id: &str,
        token: &str,
    ) -> StoreResult<Option<WalletBalanceRecord>> {
        self.read_record(&wallet_balance_key(wallet_id, token))
    }

    fn put_wallet_balance(&mut self, record: &WalletBalanceRecord) -> StoreResult<()> {
        let bytes = enc(record)?;
        self.write(wallet_balance_key(&record.wallet_id, &record.token), bytes);
        Ok(())
    }

    // -- Ledger history -----------------------------------------------------

    fn put_history(&mut self, record: &HistoryRecord) -> StoreResult<()> {
        let bytes = enc(record)?;
        self.write(
            history_key(&record.address, &record.token, &record.tx_id),
            bytes,
        );
        self.write(
            history_index_key(&record.tx_id, &record.address, &record.token),
            Vec::new(),
        );
        Ok(())
    }

    fn delete_history_of_vertex(&mut self, tx_id: &str) -> StoreResult<()> {
        let prefix = join(&[b"htx", tx_id.as_bytes(), b""]);
        for (key, _) in self.scan_prefix(&prefix)? {
            let suffix = &key[prefix.len()..];
            let mut parts = suffix.splitn(2, |b| *b == SEP);
            let (Some(address), Some(token)) = (parts.next(), parts.next()) else {
                continue;
            };
            let address = String::from_utf8_lossy(address).into_owned();
            let token = String::from_utf8_lossy(token).into_owned();
            self.remove(history_key(&address, &token, tx_id));
            self.remove(key);
        }
        Ok(())
    }

    fn history_sum(&self, address: &str, token: &str) -> StoreResult<i64> {
        let prefix = join(&[b"hst", address.as_bytes(), token.as_bytes(), b""]);
        let mut sum = 0i64;
        for (_, value) in self.scan_prefix(&prefix)? {
            let record: HistoryRecord = dec(&value)?;
            sum += record.balance;
        }
        Ok(sum)
    }

    // -- Tokens -------------------------------------------------------------

    fn token(&self, token_id: &str) -> StoreResult<Option<TokenRecord>> {
        self.read_record(&token_key(token_id))
    }

    fn put_token(&mut self, record: &TokenRecord) -> StoreResult<()> {
        let bytes = enc(record)?;
        self.write(token_key(&record.id), bytes);
        Ok(())
    }

    fn delete_token(&mut self, token_id: &str) -> StoreResult<()> {
        self.remove(token_key(token_id));
        Ok(())
    }

    fn put_token_creation(&mut self, tx_id: &str, token_id: &str) -> StoreResult<()> {
        self.write(token_creation_key(tx_id, token_id), Vec::new());
        Ok(())
    }

    fn tokens_created_by(&self, tx_id: &str) -> StoreResult<Vec<TokenId>> {
        let prefix = join(&[b"tkc", tx_id.as_bytes(), b""]);
        let mut tokens = Vec::new();
        for (key, _) in self.scan_prefix(&prefix)? {
            let token = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn delete_token_creation(&mut self, tx_id: &str, token_id: &str) -> StoreResult<()> {
        self.remove(token_creation_key(tx_id, token_id));
        Ok(())
    }

    // -- Wallets & addresses ------------------------------------------------

    fn wallet(&self, wallet_id: &str) -> StoreResult<Option<WalletRecord>> {
        self.read_record(&wallet_key(wallet_id))
    }

    fn put_wallet(&mut self, record: &WalletRecord) -> StoreResult<()> {
        let bytes = enc(record)?;
        self.write(wallet_key(&record.id), bytes);
        Ok(())
    }

    fn address_entry(&self, address: &str) -> StoreResult<Option<AddressRecord>> {
        self.read_record(&address_key(address))
    }

    fn put_address(&mut self, record: &AddressRecord) -> StoreResult<()> {
        let bytes = enc(record)?;
        self.write(address_key(&record.address), bytes);
        self.write(
            wallet_address_key(&record.wallet_id, record.index),
            record.address.as_bytes().to_vec(),
        );
        Ok(())
    }

    fn wallet_addresses(&self, wallet_id: &str) -> StoreResult<Vec<AddressRecord>> {
        let prefix = join(&[b"wad", wallet_id.as_bytes(), b""]);
        let mut records = Vec::new();
        for (_, value) in self.scan_prefix(&prefix)? {
            let address = String::from_utf8_lossy(&value).into_owned();
            if let Some(record) = self.address_entry(&address)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn max_address_index(&self, wallet_id: &str) -> StoreResult<Option<u32>> {
        let prefix = join(&[b"wad", wallet_id.as_bytes(), b""]);
        let entries = self.scan_prefix(&prefix)?;
        let Some((key, _)) = entries.last() else {
            return Ok(None);
        };
        let idx_bytes = &key[prefix.len()..];
        let index = u32::from_be_bytes(
            idx_bytes
                .try_into()
                .map_err(|_| StoreError::Serialization("bad wallet address key".into()))?,
        );
        Ok(Some(index))
    }

    // -- Miners -------------------------------------------------------------

    fn put_miner(&mut self, address: &str) -> StoreResult<()> {
        self.write(miner_key(address), Vec::new());
        Ok(())
    }

    fn is_miner(&self, address: &str) -> StoreResult<bool> {
        Ok(self.read(&miner_key(address))?.is_some())
    }

    // -- Durable cursor -----------------------------------------------------

    fn last_event_id(&self) -> StoreResult<Option<u64>> {
        match self.read(CURSOR_KEY)? {
            Some(bytes) => {
                let id = u64::from_be_bytes(
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| StoreError::Serialization("bad cursor bytes".into()))?,
                );
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    fn set_last_event_id(&mut self, id: u64) -> StoreResult<()> {
        if let Some(stored) = self.last_event_id()? {
            if id < stored {
                return Err(StoreError::CursorRegression {
                    stored,
                    attempted: id,
                });
            }
        }
        self.write(CURSOR_KEY.to_vec(), id.to_be_bytes().to_vec());
        Ok(())
    }

    // -- Lifecycle ----------------------------------------------------------

    fn commit(self) -> StoreResult<()> {
        let mut batch = Batch::default();
        for (key, value) in &self.overlay {
            match value {
                Some(v) => batch.insert(key.as_slice(), v.as_slice()),
                None => batch.remove(key.as_slice()),
            }
        }
        // apply_batch is atomic on a single tree — the whole reconciliation
        // lands or none of it does.
        self.tree.apply_batch(batch)?;
        self.tree.flush()?;
        Ok(())
    }

    fn rollback(self) {
        // Dropping the overlay is the rollback.
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
