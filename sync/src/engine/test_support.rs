//! Shared builders for engine tests. The reward-lock distance is a small 3
//! so height-unlock scenarios stay readable.

use std::sync::Arc;
use std::time::Duration;

use super::ReconciliationEngine;
use crate::ledger::{
    NcExecution, TxInput, TxOutput, VertexData, VertexMetadata, VertexVersion,
};
use crate::store::SledStore;
use crate::wallet::NullDeriver;

pub(crate) const TEST_REWARD_LOCK: u64 = 3;

pub(crate) fn engine(store: &Arc<SledStore>) -> ReconciliationEngine<SledStore> {
    let (notifications, _) = crate::notify::channel(16);
    ReconciliationEngine::new(
        Arc::clone(store),
        Arc::new(NullDeriver),
        notifications,
        TEST_REWARD_LOCK,
        Duration::from_secs(60),
    )
}

pub(crate) fn metadata(hash: &str) -> VertexMetadata {
    VertexMetadata {
        hash: hash.into(),
        voided_by: vec![],
        first_block: None,
        height: None,
        nc_execution: None,
    }
}

pub(crate) fn tx_with_outputs(
    hash: &str,
    inputs: &[(&str, u32)],
    outputs: Vec<TxOutput>,
) -> VertexData {
    VertexData {
        hash: hash.into(),
        timestamp: 1_000,
        version: VertexVersion::Transaction,
        weight: 17.0,
        inputs: inputs
            .iter()
            .map(|(tx_id, index)| TxInput {
                tx_id: (*tx_id).into(),
                index: *index,
            })
            .collect(),
        outputs,
        token_name: None,
        token_symbol: None,
        nano: None,
        metadata: metadata(hash),
    }
}

pub(crate) fn value_output(address: &str, value: u64) -> TxOutput {
    TxOutput {
        value,
        token: "00".into(),
        address: Some(address.into()),
        timelock: None,
        authorities: 0,
    }
}

pub(crate) fn token_output(address: &str, token: &str, value: u64) -> TxOutput {
    TxOutput {
        value,
        token: token.into(),
        address: Some(address.into()),
        timelock: None,
        authorities: 0,
    }
}

pub(crate) fn authority_output(address: &str, token: &str, mask: u8) -> TxOutput {
    TxOutput {
        value: 0,
        token: token.into(),
        address: Some(address.into()),
        timelock: None,
        authorities: mask,
    }
}

/// A plain value transaction over the native token.
pub(crate) fn value_tx(
    hash: &str,
    inputs: &[(&str, u32)],
    outputs: &[(&str, u64)],
) -> VertexData {
    tx_with_outputs(
        hash,
        inputs,
        outputs
            .iter()
            .map(|(address, value)| value_output(address, *value))
            .collect(),
    )
}

/// A block at `height` paying `value` to `miner`.
pub(crate) fn vertex_block(hash: &str, height: u64, miner: &str, value: u64) -> VertexData {
    let mut vertex = tx_with_outputs(hash, &[], vec![value_output(miner, value)]);
    vertex.version = VertexVersion::Block;
    vertex.timestamp = 1_000 + height as i64;
    vertex.metadata.height = Some(height);
    vertex
}

/// A direct token-creation transaction: creates `token == hash`.
pub(crate) fn token_creation_tx(hash: &str, name: &str, symbol: &str, address: &str) -> VertexData {
    let mut vertex = tx_with_outputs(hash, &[], vec![token_output(address, hash, 1_000)]);
    vertex.version = VertexVersion::TokenCreation;
    vertex.token_name = Some(name.into());
    vertex.token_symbol = Some(symbol.into());
    vertex
}

/// Attaches a nano header with the given created tokens and execution state.
pub(crate) fn with_nano(
    mut vertex: VertexData,
    created: &[(&str, &str, &str)],
    execution: NcExecution,
) -> VertexData {
    vertex.nano = Some(crate::ledger::NanoHeader {
        nc_id: "nc-1".into(),
        created_tokens: created
            .iter()
            .map(|(token_id, name, symbol)| crate::ledger::CreatedToken {
                token_id: (*token_id).into(),
                name: (*name).into(),
                symbol: (*symbol).into(),
            })
            .collect(),
    });
    vertex.metadata.nc_execution = Some(execution);
    vertex
}
