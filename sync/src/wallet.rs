//! # Wallet Collaborators
//!
//! The mirror aggregates address balances into wallet balances, but it does
//! not know how to turn an extended public key into addresses -- that is
//! cryptography, and the mirror stays out of it. [`AddressDeriver`] is the
//! seam: a pure function from `(xpub, index range)` to addresses, supplied
//! by the deployment.

use crate::ledger::Address;

/// Derives wallet addresses from an extended public key.
///
/// Implementations must be deterministic: the same `(xpub, index)` always
/// yields the same address, or gap extension would fabricate addresses the
/// wallet can never spend from.
pub trait AddressDeriver: Send + Sync {
    /// Derives `count` addresses starting at `start_index`, returning
    /// `(address, index)` pairs.
    fn derive(&self, xpub: &str, start_index: u32, count: u32) -> Vec<(Address, u32)>;
}

/// Deriver that derives nothing. For deployments that register wallets with
/// pre-derived address sets, and for tests that manage addresses by hand.
pub struct NullDeriver;

impl AddressDeriver for NullDeriver {
    fn derive(&self, _xpub: &str, _start_index: u32, _count: u32) -> Vec<(Address, u32)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::test_support::{engine, value_tx, TEST_REWARD_LOCK};
    use crate::engine::ReconciliationEngine;
    use crate::ledger::{AddressRecord, WalletRecord};
    use crate::store::{LedgerStore, SledStore, StoreTxn};
    use crate::wallet::AddressDeriver;

    /// Deterministic test deriver: index n becomes "w-<wallet>-<n>".
    struct SeqDeriver(&'static str);

    impl AddressDeriver for SeqDeriver {
        fn derive(&self, _xpub: &str, start_index: u32, count: u32) -> Vec<(Address, u32)> {
            (start_index..start_index + count)
                .map(|i| (format!("w-{}-{i}", self.0), i))
                .collect()
        }
    }

    fn register_wallet(store: &Arc<SledStore>, id: &str, addresses: &[(&str, u32)]) {
        let mut txn = store.begin().unwrap();
        txn.put_wallet(&WalletRecord {
            id: id.into(),
            xpub: format!("xpub-{id}"),
            max_gap: 3,
            started: true,
        })
        .unwrap();
        for (address, index) in addresses {
            txn.put_address(&AddressRecord {
                address: (*address).into(),
                wallet_id: id.into(),
                index: *index,
                used: false,
            })
            .unwrap();
        }
        txn.commit().unwrap();
    }

    #[test]
    fn started_wallet_aggregates_address_deltas() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);
        register_wallet(&store, "w1", &[("addr1", 0)]);

        engine
            .handle_vertex_accepted(&value_tx("tx-a", &[], &[("addr1", 100)]))
            .unwrap();

        let txn = store.begin().unwrap();
        let row = txn.wallet_balance("w1", "00").unwrap().unwrap();
        assert_eq!(row.unlocked_balance, 100);
        assert_eq!(row.transactions, 1);
        assert!(txn.address_entry("addr1").unwrap().unwrap().used);
    }

    #[test]
    fn unstarted_wallet_gets_no_aggregation() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let engine = engine(&store);
        register_wallet(&store, "w1", &[("addr1", 0)]);
        {
            let mut txn = store.begin().unwrap();
            let mut wallet = txn.wallet("w1").unwrap().unwrap();
            wallet.started = false;
            txn.put_wallet(&wallet).unwrap();
            txn.commit().unwrap();
        }

        engine
            .handle_vertex_accepted(&value_tx("tx-a", &[], &[("addr1", 100)]))
            .unwrap();

        let txn = store.begin().unwrap();
        assert!(txn.wallet_balance("w1", "00").unwrap().is_none());
    }

    #[test]
    fn gap_is_extended_past_the_used_index() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let (notifications, _) = crate::notify::channel(16);
        let engine = ReconciliationEngine::new(
            Arc::clone(&store),
            Arc::new(SeqDeriver("w1")),
            notifications,
            TEST_REWARD_LOCK,
            std::time::Duration::from_secs(60),
        );
        // Wallet with addresses 0..=2 derived (max_gap = 3).
        register_wallet(
            &store,
            "w1",
            &[("w-w1-0", 0), ("w-w1-1", 1), ("w-w1-2", 2)],
        );

        // Using index 1 means indexes up to 1 + 3 = 4 must exist.
        engine
            .handle_vertex_accepted(&value_tx("tx-a", &[], &[("w-w1-1", 50)]))
            .unwrap();

        let txn = store.begin().unwrap();
        assert_eq!(txn.max_address_index("w1").unwrap(), Some(4));
        let derived = txn.address_entry("w-w1-4").unwrap().unwrap();
        assert!(!derived.used);
        assert_eq!(derived.index, 4);
    }

    #[test]
    fn null_deriver_derives_nothing() {
        assert!(NullDeriver.derive("xpub", 0, 20).is_empty());
    }
}
