//! # Token Lifecycle
//!
//! Tokens enter the mirror two ways. A direct token-creation vertex mints a
//! token whose id equals its own hash, visible as soon as the vertex is --
//! confirmation doesn't matter. A nano-contract call mints tokens with
//! foreign ids, visible only while the call's execution status is
//! `success`; a reorg can flip that status back and forth, deleting and
//! re-creating the same tokens.
//!
//! Both kinds are keyed to their creating transaction through the creation
//! mapping, and `token_id != tx_id` is the discriminator for "came through
//! the nano path". Every insert is an upsert -- re-creation after a reorg
//! must be a no-op, not an error.

use std::collections::BTreeSet;

use super::{add_counter, EngineError, ReconciliationEngine};
use crate::config::{NATIVE_TOKEN_ID, NATIVE_TOKEN_NAME, NATIVE_TOKEN_SYMBOL};
use crate::ledger::{NcExecution, TokenRecord, UtxoRecord, VertexData, VertexVersion};
use crate::store::{LedgerStore, StoreTxn};

impl<S: LedgerStore> ReconciliationEngine<S> {
    /// Handles the classifier's `NcExecVoided`: a reorg flipped a formerly
    /// successful nano execution away from `success`. Only the nano-path
    /// tokens die; a direct-creation token for the same vertex survives
    /// because the vertex itself is still valid.
    pub fn handle_nc_exec_voided(&self, vertex: &VertexData) -> Result<(), EngineError> {
        let mut txn = self.store.begin()?;
        if let Some(mut record) = txn.vertex(&vertex.hash)? {
            record.nc_execution = vertex.metadata.nc_execution;
            txn.put_vertex(&record)?;
        }
        delete_nano_tokens(&mut txn, &vertex.hash)?;
        txn.commit()?;
        tracing::info!(vertex = %vertex.hash, "nano execution voided, nano-created tokens dropped");
        Ok(())
    }
}

/// Brings the token rows and creation mappings for `vertex` in line with
/// its current state. Called on every accept, including the duplicate
/// branch -- that is what makes re-creation after a reorg idempotent.
pub(crate) fn sync_created_tokens<T: StoreTxn>(
    txn: &mut T,
    vertex: &VertexData,
) -> Result<(), EngineError> {
    if vertex.version == VertexVersion::TokenCreation {
        if let (Some(name), Some(symbol)) = (&vertex.token_name, &vertex.token_symbol) {
            upsert_token(txn, &vertex.hash, name, symbol)?;
            txn.put_token_creation(&vertex.hash, &vertex.hash)?;
        }
    }

    if vertex.has_nano() {
        match vertex.metadata.nc_execution {
            Some(NcExecution::Success) => {
                if let Some(nano) = &vertex.nano {
                    for created in &nano.created_tokens {
                        upsert_token(txn, &created.token_id, &created.name, &created.symbol)?;
                        txn.put_token_creation(&vertex.hash, &created.token_id)?;
                    }
                }
            }
            _ => delete_nano_tokens(txn, &vertex.hash)?,
        }
    }

    Ok(())
}

/// Deletes the tokens `tx_id` created through the nano path, leaving a
/// direct-creation token (id == tx_id) untouched.
fn delete_nano_tokens<T: StoreTxn>(txn: &mut T, tx_id: &str) -> Result<(), EngineError> {
    for token_id in txn.tokens_created_by(tx_id)? {
        if token_id != tx_id {
            txn.delete_token(&token_id)?;
            txn.delete_token_creation(tx_id, &token_id)?;
        }
    }
    Ok(())
}

/// Upserts a token row, preserving an existing transaction count.
fn upsert_token<T: StoreTxn>(
    txn: &mut T,
    token_id: &str,
    name: &str,
    symbol: &str,
) -> Result<(), EngineError> {
    let tx_count = txn.token(token_id)?.map(|t| t.tx_count).unwrap_or(0);
    txn.put_token(&TokenRecord {
        id: token_id.to_string(),
        name: name.to_string(),
        symbol: symbol.to_string(),
        tx_count,
    })?;
    Ok(())
}

/// Steps the `tx_count` of every token the vertex moved. The native token
/// row is created lazily -- the upstream never announces it. A non-native
/// token the mirror has never registered (possible when mirroring starts
/// mid-chain) is left uncounted rather than given a placeholder row.
pub(crate) fn adjust_tx_counts<T: StoreTxn>(
    txn: &mut T,
    vertex: &VertexData,
    spent: &[UtxoRecord],
    step: i64,
) -> Result<(), EngineError> {
    let mut tokens: BTreeSet<&str> = BTreeSet::new();
    for output in &vertex.outputs {
        if output.address.is_some() {
            tokens.insert(output.token.as_str());
        }
    }
    for utxo in spent {
        tokens.insert(utxo.token.as_str());
    }

    for token in tokens {
        let record = match txn.token(token)? {
            Some(record) => Some(record),
            None if token == NATIVE_TOKEN_ID => Some(TokenRecord {
                id: NATIVE_TOKEN_ID.to_string(),
                name: NATIVE_TOKEN_NAME.to_string(),
                symbol: NATIVE_TOKEN_SYMBOL.to_string(),
                tx_count: 0,
            }),
            None => None,
        };
        if let Some(mut record) = record {
            record.tx_count = add_counter(record.tx_count, step, "token", token)?;
            txn.put_token(&record)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::test_support::{engine, token_creation_tx, value_tx, with_nano};
    use crate::store::SledStore;

    #[test]
    fn direct_creation_registers_token_and_mapping() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        engine
            .handle_vertex_accepted(&token_creation_tx("tok-t", "Token T", "TKT", "addr1"))
            .unwrap();

        let txn = store.begin().unwrap();
        let token = txn.token("tok-t").unwrap().unwrap();
        assert_eq!(token.name, "Token T");
        assert_eq!(token.symbol, "TKT");
        assert_eq!(token.tx_count, 1);
        assert_eq!(txn.tokens_created_by("tok-t").unwrap(), vec!["tok-t"]);
    }

    #[test]
    fn token_recreation_is_idempotent() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        let creation = token_creation_tx("tok-t", "Token T", "TKT", "addr1");
        engine.handle_vertex_accepted(&creation).unwrap();
        // Duplicate delivery re-runs the token sync.
        engine.handle_vertex_accepted(&creation).unwrap();

        let txn = store.begin().unwrap();
        assert_eq!(txn.tokens_created_by("tok-t").unwrap().len(), 1);
        // tx_count untouched by the duplicate.
        assert_eq!(txn.token("tok-t").unwrap().unwrap().tx_count, 1);
    }

    #[test]
    fn nano_tokens_require_success() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        let pending = with_nano(
            value_tx("tx-n", &[], &[("addr1", 10)]),
            &[("tok-x", "Token X", "TKX")],
            NcExecution::Pending,
        );
        engine.handle_vertex_accepted(&pending).unwrap();

        let txn = store.begin().unwrap();
        assert!(txn.token("tok-x").unwrap().is_none());
        assert!(txn.tokens_created_by("tx-n").unwrap().is_empty());
    }

    #[test]
    fn hybrid_reorg_keeps_direct_token() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        // Vertex T is itself a token creation AND a successful nano call
        // that minted token X.
        let hybrid = with_nano(
            token_creation_tx("tok-t", "Token T", "TKT", "addr1"),
            &[("tok-x", "Token X", "TKX")],
            NcExecution::Success,
        );
        engine.handle_vertex_accepted(&hybrid).unwrap();

        {
            let txn = store.begin().unwrap();
            let mut created = txn.tokens_created_by("tok-t").unwrap();
            created.sort();
            assert_eq!(created, vec!["tok-t".to_string(), "tok-x".to_string()]);
            assert!(txn.token("tok-x").unwrap().is_some());
        }

        // Reorg flips the execution to pending: only X dies.
        let mut flipped = hybrid.clone();
        flipped.metadata.nc_execution = Some(NcExecution::Pending);
        engine.handle_nc_exec_voided(&flipped).unwrap();

        let txn = store.begin().unwrap();
        assert!(txn.token("tok-x").unwrap().is_none());
        assert!(txn.token("tok-t").unwrap().is_some());
        assert_eq!(txn.tokens_created_by("tok-t").unwrap(), vec!["tok-t"]);
        assert_eq!(
            txn.vertex("tok-t").unwrap().unwrap().nc_execution,
            Some(NcExecution::Pending)
        );
    }

    #[test]
    fn success_after_reorg_recreates_nano_token() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        let hybrid = with_nano(
            token_creation_tx("tok-t", "Token T", "TKT", "addr1"),
            &[("tok-x", "Token X", "TKX")],
            NcExecution::Success,
        );
        engine.handle_vertex_accepted(&hybrid).unwrap();

        let mut flipped = hybrid.clone();
        flipped.metadata.nc_execution = Some(NcExecution::Pending);
        engine.handle_nc_exec_voided(&flipped).unwrap();

        // Execution succeeds again: the duplicate-accept branch re-creates
        // token X idempotently.
        engine.handle_vertex_accepted(&hybrid).unwrap();

        let txn = store.begin().unwrap();
        assert!(txn.token("tok-x").unwrap().is_some());
        let mut created = txn.tokens_created_by("tok-t").unwrap();
        created.sort();
        assert_eq!(created, vec!["tok-t".to_string(), "tok-x".to_string()]);
    }

    #[test]
    fn full_void_deletes_every_created_token() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        let hybrid = with_nano(
            token_creation_tx("tok-t", "Token T", "TKT", "addr1"),
            &[("tok-x", "Token X", "TKX")],
            NcExecution::Success,
        );
        engine.handle_vertex_accepted(&hybrid).unwrap();

        let mut voided = hybrid;
        voided.metadata.voided_by = vec!["tx-z".into()];
        engine.handle_vertex_voided(&voided).unwrap();

        let txn = store.begin().unwrap();
        // Everything the vertex produced is gone, nano and direct alike.
        assert!(txn.token("tok-t").unwrap().is_none());
        assert!(txn.token("tok-x").unwrap().is_none());
        assert!(txn.tokens_created_by("tok-t").unwrap().is_empty());
    }

    #[test]
    fn native_token_counts_lazily() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        engine
            .handle_vertex_accepted(&value_tx("tx-a", &[], &[("addr1", 100)]))
            .unwrap();
        engine
            .handle_vertex_accepted(&value_tx("tx-b", &[("tx-a", 0)], &[("addr2", 100)]))
            .unwrap();

        let txn = store.begin().unwrap();
        let native = txn.token(NATIVE_TOKEN_ID).unwrap().unwrap();
        assert_eq!(native.tx_count, 2);
        assert_eq!(native.symbol, NATIVE_TOKEN_SYMBOL);
    }
}
