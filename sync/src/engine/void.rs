//! # Void, Unvoid, Removal
//!
//! Voiding is the exact inverse of accepting. The subtraction reuses the
//! same delta machinery as the accept path, built from the stored rows'
//! current state (see [`super::delta`] for why), and finishes with the
//! conservation check: every touched pair's balance row must again equal
//! the sum of its remaining history rows.
//!
//! Unvoiding deliberately does not re-run accept logic here. It clears the
//! voided residue and the machine re-routes the same event through the
//! accept path, so a single code path computes balances.

use tracing::info;

use super::delta;
use super::{EngineError, ReconcileReport, ReconciliationEngine, WalletDelta};
use crate::ledger::VertexData;
use crate::notify::NotificationKind;
use crate::store::{LedgerStore, StoreTxn};

impl<S: LedgerStore> ReconciliationEngine<S> {
    /// Handles the classifier's `TxVoided`: the upstream voided a vertex the
    /// mirror had applied.
    pub fn handle_vertex_voided(
        &self,
        vertex: &VertexData,
    ) -> Result<Option<ReconcileReport>, EngineError> {
        let mut txn = self.store.begin()?;
        let Some(wallets) = self.apply_void(&mut txn, vertex)? else {
            txn.rollback();
            return Ok(None);
        };
        txn.commit()?;

        info!(vertex = %vertex.hash, wallets = wallets.len(), "vertex voided");
        let report = ReconcileReport {
            vertex: vertex.hash.clone(),
            wallets,
        };
        self.publish(NotificationKind::VertexVoided, &report);
        Ok(Some(report))
    }

    /// Handles `VERTEX_REMOVED`: void effects if still needed, then the
    /// rows themselves disappear — the one case where the mirror forgets a
    /// vertex entirely.
    pub fn handle_vertex_removed(
        &self,
        vertex: &VertexData,
    ) -> Result<Option<ReconcileReport>, EngineError> {
        let mut txn = self.store.begin()?;
        let wallets = self.apply_void(&mut txn, vertex)?;
        txn.delete_utxos_of_vertex(&vertex.hash)?;
        txn.delete_vertex(&vertex.hash)?;
        txn.commit()?;

        info!(vertex = %vertex.hash, "vertex removed");
        Ok(wallets.map(|wallets| {
            let report = ReconcileReport {
                vertex: vertex.hash.clone(),
                wallets,
            };
            self.publish(NotificationKind::VertexVoided, &report);
            report
        }))
    }

    /// Handles the classifier's `TxUnvoided`: clears the voided residue so
    /// the machine can re-ingest the vertex as new. No balance work — that
    /// happens in the accept path the machine routes to next.
    pub fn handle_vertex_unvoided(&self, vertex: &VertexData) -> Result<(), EngineError> {
        let mut txn = self.store.begin()?;
        txn.delete_utxos_of_vertex(&vertex.hash)?;
        txn.delete_vertex(&vertex.hash)?;
        txn.commit()?;
        info!(vertex = %vertex.hash, "void residue cleared for re-accept");
        Ok(())
    }

    /// The void steps, shared by `handle_vertex_voided` and
    /// `handle_vertex_removed`. Returns `None` when there is nothing to
    /// invert (unknown vertex, or already voided).
    pub(crate) fn apply_void(
        &self,
        txn: &mut S::Txn,
        vertex: &VertexData,
    ) -> Result<Option<Vec<WalletDelta>>, EngineError> {
        let Some(mut record) = txn.vertex(&vertex.hash)? else {
            return Ok(None);
        };
        if record.voided {
            return Ok(None);
        }

        record.voided = true;
        txn.put_vertex(&record)?;

        // The vertex's own outputs stay in storage for audit but leave
        // every balance and unlock query.
        let own = txn.utxos_of_vertex(&vertex.hash)?;
        for utxo in &own {
            let mut voided = utxo.clone();
            voided.voided = true;
            txn.put_utxo(&voided)?;
        }

        // Current state of the inputs this vertex consumed.
        let mut spent = Vec::with_capacity(vertex.inputs.len());
        for input in &vertex.inputs {
            if let Some(utxo) = txn.utxo(&input.tx_id, input.index)? {
                spent.push(utxo);
            }
        }

        let deltas = delta::void_deltas(&own, &spent)?;
        let wallets = self.apply_deltas(txn, &deltas, -1)?;

        txn.delete_history_of_vertex(&vertex.hash)?;
        super::tokens::adjust_tx_counts(txn, vertex, &spent, -1)?;

        // Unspend inputs — unless a later vertex has re-spent them
        // (last-writer-wins: voiding an older vertex must not clobber a
        // newer one's claim). Reservations die either way; they were made
        // against a transaction that no longer exists.
        for mut utxo in spent {
            if utxo.spent_by.as_deref() == Some(vertex.hash.as_str()) {
                utxo.spent_by = None;
            }
            utxo.tx_proposal = None;
            utxo.tx_proposal_index = None;
            txn.put_utxo(&utxo)?;
        }

        // Voiding the whole vertex invalidates everything it produced,
        // independent of nano execution status.
        for token_id in txn.tokens_created_by(&vertex.hash)? {
            txn.delete_token(&token_id)?;
            txn.delete_token_creation(&vertex.hash, &token_id)?;
        }

        self.validate_pairs(txn, &deltas)?;

        Ok(Some(wallets))
    }
}
