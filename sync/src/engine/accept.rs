//! # Accept Path
//!
//! Applies a newly accepted vertex to the mirror. The sequence matters:
//!
//! 1. Block housekeeping: unlock height-expired and time-expired UTXOs,
//!    record the miner. Runs before this block's own outputs exist so a
//!    zero-distance reward lock cannot unlock itself.
//! 2. Insert the vertex row and its UTXO rows.
//! 3. Mark every input `spent_by` this vertex.
//! 4. Compute the per-address delta map and fold it into the address and
//!    wallet balance rows, appending one history row per touched pair.
//! 5. Token lifecycle: direct creations, nano creations, transaction counts.
//!
//! Everything happens in one store transaction; an error at any step
//! discards the lot.

use tracing::info;

use super::delta;
use super::tokens;
use super::{AcceptOutcome, EngineError, ReconcileReport, ReconciliationEngine};
use crate::ledger::{HistoryRecord, UtxoRecord, VertexData, VertexRecord};
use crate::notify::NotificationKind;
use crate::store::{LedgerStore, StoreTxn};

impl<S: LedgerStore> ReconciliationEngine<S> {
    /// Handles `NEW_VERTEX_ACCEPTED` (and the classifier's `TxNew`, which
    /// includes the re-accept after an unvoid and a nano execution flipping
    /// back to success).
    pub fn handle_vertex_accepted(
        &self,
        vertex: &VertexData,
    ) -> Result<AcceptOutcome, EngineError> {
        if vertex.is_voided() {
            // The machine never routes an already-voided payload here; if
            // one slips through, mirroring it would corrupt balances.
            tracing::warn!(vertex = %vertex.hash, "refusing to accept a voided payload");
            return Ok(AcceptOutcome::SkippedVoided);
        }

        let mut txn = self.store.begin()?;

        if let Some(existing) = txn.vertex(&vertex.hash)? {
            if existing.voided {
                // Void residue from an out-of-band unvoid. Clear it and
                // apply fresh below — same effect as the unvoid handler.
                txn.delete_utxos_of_vertex(&vertex.hash)?;
                txn.delete_vertex(&vertex.hash)?;
            } else {
                self.note_duplicate(&vertex.hash);
                // Even a duplicate refreshes token state: a nano execution
                // that succeeded again after a reorg re-creates its tokens
                // here, idempotently.
                tokens::sync_created_tokens(&mut txn, vertex)?;
                let mut record = existing;
                record.nc_execution = vertex.metadata.nc_execution;
                record.height = record.height.or(vertex.metadata.height);
                txn.put_vertex(&record)?;
                txn.commit()?;
                return Ok(AcceptOutcome::Duplicate);
            }
        }

        if vertex.is_block() {
            if let Some(height) = vertex.metadata.height {
                let ready = txn.locked_utxos_ready_at_height(height)?;
                self.unlock_utxos(&mut txn, ready)?;
            }
            let expired = txn.locked_utxos_expired_at(vertex.timestamp)?;
            self.unlock_utxos(&mut txn, expired)?;

            if let Some(reward_address) = vertex.outputs.iter().find_map(|o| o.address.clone()) {
                txn.put_miner(&reward_address)?;
            }
        }

        txn.put_vertex(&VertexRecord::from_event(vertex))?;

        // Fresh outputs become UTXO rows.
        for (index, output) in vertex.outputs.iter().enumerate() {
            let Some(address) = &output.address else {
                continue;
            };
            let heightlock = if vertex.is_block() {
                vertex
                    .metadata
                    .height
                    .map(|h| h + self.reward_spend_min_blocks)
            } else {
                None
            };
            let timelocked = output.timelock.map_or(false, |t| t > vertex.timestamp);
            txn.put_utxo(&UtxoRecord {
                tx_id: vertex.hash.clone(),
                index: index as u32,
                token: output.token.clone(),
                address: address.clone(),
                value: output.value,
                authorities: output.authorities,
                timelock: output.timelock,
                heightlock,
                locked: heightlock.is_some() || timelocked,
                spent_by: None,
                voided: false,
                tx_proposal: None,
                tx_proposal_index: None,
            })?;
        }

        // Consume inputs. The pre-spend records feed the delta map.
        let mut spent = Vec::with_capacity(vertex.inputs.len());
        for input in &vertex.inputs {
            let mut utxo =
                txn.utxo(&input.tx_id, input.index)?
                    .ok_or_else(|| EngineError::MissingInput {
                        spender: vertex.hash.clone(),
                        tx_id: input.tx_id.clone(),
                        index: input.index,
                    })?;
            spent.push(utxo.clone());
            utxo.spent_by = Some(vertex.hash.clone());
            txn.put_utxo(&utxo)?;
        }

        let deltas = delta::accept_deltas(vertex, &spent)?;
        let wallets = self.apply_deltas(&mut txn, &deltas, 1)?;

        for (address, map) in &deltas {
            for (token, balance) in map.iter() {
                txn.put_history(&HistoryRecord {
                    address: address.clone(),
                    token: token.clone(),
                    tx_id: vertex.hash.clone(),
                    balance: balance.total(),
                    timestamp: vertex.timestamp,
                })?;
            }
        }

        tokens::sync_created_tokens(&mut txn, vertex)?;
        tokens::adjust_tx_counts(&mut txn, vertex, &spent, 1)?;

        txn.commit()?;

        info!(
            vertex = %vertex.hash,
            block = vertex.is_block(),
            addresses = deltas.len(),
            wallets = wallets.len(),
            "vertex accepted"
        );

        let report = ReconcileReport {
            vertex: vertex.hash.clone(),
            wallets,
        };
        self.publish(NotificationKind::VertexAccepted, &report);
        Ok(AcceptOutcome::Applied(report))
    }

    /// Handles the classifier's `TxFirstBlock`: the vertex gained its first
    /// confirming block, which fixes its height.
    pub fn handle_first_block(&self, vertex: &VertexData) -> Result<(), EngineError> {
        let mut txn = self.store.begin()?;
        if let Some(mut record) = txn.vertex(&vertex.hash)? {
            record.height = vertex.metadata.height;
            txn.put_vertex(&record)?;
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::test_support::{engine, value_tx, vertex_block};
    use crate::store::SledStore;

    #[test]
    fn accept_creates_utxos_and_balances() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        let tx_a = value_tx("tx-a", &[], &[("addr1", 100)]);
        let outcome = engine.handle_vertex_accepted(&tx_a).unwrap();
        assert!(matches!(outcome, AcceptOutcome::Applied(_)));

        let txn = store.begin().unwrap();
        let utxo = txn.utxo("tx-a", 0).unwrap().unwrap();
        assert!(utxo.is_spendable());

        let row = txn.address_balance("addr1", "00").unwrap().unwrap();
        assert_eq!(row.unlocked_balance, 100);
        assert_eq!(row.locked_balance, 0);
        assert_eq!(row.transactions, 1);
        assert_eq!(row.total_received, 100);
        assert_eq!(txn.history_sum("addr1", "00").unwrap(), 100);
    }

    #[test]
    fn accept_spends_inputs_and_moves_value() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        engine
            .handle_vertex_accepted(&value_tx("tx-a", &[], &[("addr1", 100)]))
            .unwrap();
        engine
            .handle_vertex_accepted(&value_tx("tx-b", &[("tx-a", 0)], &[("addr2", 100)]))
            .unwrap();

        let txn = store.begin().unwrap();
        let spent = txn.utxo("tx-a", 0).unwrap().unwrap();
        assert_eq!(spent.spent_by.as_deref(), Some("tx-b"));

        let from = txn.address_balance("addr1", "00").unwrap().unwrap();
        assert_eq!(from.unlocked_balance, 0);
        assert_eq!(from.transactions, 2);
        assert_eq!(from.total_received, 100);

        let to = txn.address_balance("addr2", "00").unwrap().unwrap();
        assert_eq!(to.unlocked_balance, 100);
        assert_eq!(to.transactions, 1);
    }

    #[test]
    fn duplicate_accept_is_skipped() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        let tx_a = value_tx("tx-a", &[], &[("addr1", 100)]);
        engine.handle_vertex_accepted(&tx_a).unwrap();
        let outcome = engine.handle_vertex_accepted(&tx_a).unwrap();
        assert!(matches!(outcome, AcceptOutcome::Duplicate));

        // Balances unchanged — the duplicate did no balance work.
        let txn = store.begin().unwrap();
        let row = txn.address_balance("addr1", "00").unwrap().unwrap();
        assert_eq!(row.unlocked_balance, 100);
        assert_eq!(row.transactions, 1);
    }

    #[test]
    fn voided_payload_is_refused() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        let mut tx_a = value_tx("tx-a", &[], &[("addr1", 100)]);
        tx_a.metadata.voided_by = vec!["tx-z".into()];

        let outcome = engine.handle_vertex_accepted(&tx_a).unwrap();
        assert!(matches!(outcome, AcceptOutcome::SkippedVoided));

        let txn = store.begin().unwrap();
        assert!(txn.vertex("tx-a").unwrap().is_none());
    }

    #[test]
    fn missing_input_is_fatal() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        let result =
            engine.handle_vertex_accepted(&value_tx("tx-b", &[("ghost", 0)], &[("addr2", 5)]));
        assert!(matches!(result, Err(EngineError::MissingInput { .. })));

        // The failed transaction left nothing behind.
        let txn = store.begin().unwrap();
        assert!(txn.vertex("tx-b").unwrap().is_none());
        assert!(txn.address_balance("addr2", "00").unwrap().is_none());
    }

    #[test]
    fn block_reward_is_heightlocked_then_unlocked() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store); // reward lock distance 3 in test_support

        engine
            .handle_vertex_accepted(&vertex_block("blk-1", 10, "miner", 6_400))
            .unwrap();

        {
            let txn = store.begin().unwrap();
            let reward = txn.utxo("blk-1", 0).unwrap().unwrap();
            assert!(reward.locked);
            assert_eq!(reward.heightlock, Some(13));
            let row = txn.address_balance("miner", "00").unwrap().unwrap();
            assert_eq!(row.locked_balance, 6_400);
            assert_eq!(row.unlocked_balance, 0);
            assert!(txn.is_miner("miner").unwrap());
        }

        // Height 12 is not enough.
        engine
            .handle_vertex_accepted(&vertex_block("blk-2", 12, "miner2", 6_400))
            .unwrap();
        {
            let txn = store.begin().unwrap();
            assert!(txn.utxo("blk-1", 0).unwrap().unwrap().locked);
        }

        // Height 13 unlocks the first reward.
        engine
            .handle_vertex_accepted(&vertex_block("blk-3", 13, "miner3", 6_400))
            .unwrap();
        let txn = store.begin().unwrap();
        let reward = txn.utxo("blk-1", 0).unwrap().unwrap();
        assert!(!reward.locked);
        let row = txn.address_balance("miner", "00").unwrap().unwrap();
        assert_eq!(row.unlocked_balance, 6_400);
        assert_eq!(row.locked_balance, 0);
    }

    #[test]
    fn first_block_sets_height() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);

        engine
            .handle_vertex_accepted(&value_tx("tx-a", &[], &[("addr1", 100)]))
            .unwrap();

        let mut confirmed = value_tx("tx-a", &[], &[("addr1", 100)]);
        confirmed.metadata.first_block = Some("blk-9".into());
        confirmed.metadata.height = Some(42);
        engine.handle_first_block(&confirmed).unwrap();

        let txn = store.begin().unwrap();
        assert_eq!(txn.vertex("tx-a").unwrap().unwrap().height, Some(42));
    }
}
