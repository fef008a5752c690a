//! # Delta Construction
//!
//! Builds the per-address balance delta map for a vertex. Two builders
//! exist because the lock state of an output can change between accept and
//! void: at accept time the lock state is computed from the vertex itself,
//! at void time it must be read from the stored UTXO rows -- a reward that
//! was locked when accepted may sit in the unlocked bucket by the time a
//! reorg voids it, and subtracting from the wrong bucket would leave a
//! permanently negative locked balance.
//!
//! Inputs always move through the unlocked bucket: a locked output cannot
//! be spent, and the unlock sweeps skip spent rows, so a spent UTXO's value
//! was unlocked at spend time and stays attributed there.

use std::collections::HashMap;

use crate::balance::{Authorities, Balance, TokenBalanceMap};
use crate::engine::{amount_of, EngineError};
use crate::ledger::{Address, TxOutput, UtxoRecord, VertexData};

/// Lock state and expiry of a fresh output, derived from the vertex.
fn output_lock(vertex: &VertexData, output: &TxOutput) -> (bool, Option<i64>) {
    let heightlocked = vertex.is_block() && vertex.metadata.height.is_some();
    let timelocked = output.timelock.map_or(false, |t| t > vertex.timestamp);
    let expires = if timelocked { output.timelock } else { None };
    (heightlocked || timelocked, expires)
}

/// The delta one fresh output contributes to its address.
fn output_delta(vertex: &VertexData, output: &TxOutput) -> Result<Balance, EngineError> {
    let (locked, expires) = output_lock(vertex, output);
    if output.is_authority() {
        let authorities = Authorities::from_mask(output.authorities);
        return Ok(Balance {
            unlocked_authorities: if locked {
                Authorities::default()
            } else {
                authorities
            },
            locked_authorities: if locked {
                authorities
            } else {
                Authorities::default()
            },
            lock_expires: expires,
            ..Balance::default()
        });
    }

    let value = i64::try_from(output.value).map_err(|_| {
        EngineError::Balance(crate::balance::BalanceError::Overflow {
            token_id: output.token.clone(),
            current: 0,
            delta: i64::MAX,
        })
    })?;
    Ok(Balance {
        total_received: value,
        unlocked_amount: if locked { 0 } else { value },
        locked_amount: if locked { value } else { 0 },
        lock_expires: expires,
        ..Balance::default()
    })
}

/// The delta spending one stored UTXO contributes to its (source) address.
fn input_delta(utxo: &UtxoRecord) -> Result<Balance, EngineError> {
    if utxo.authorities != 0 {
        return Ok(Balance {
            unlocked_authorities: Authorities::from_mask(utxo.authorities).negate(),
            ..Balance::default()
        });
    }
    Ok(Balance {
        unlocked_amount: -amount_of(utxo)?,
        ..Balance::default()
    })
}

/// Delta map for accepting `vertex`: outputs positive (lock state from the
/// vertex), spent inputs negative.
pub(crate) fn accept_deltas(
    vertex: &VertexData,
    spent: &[UtxoRecord],
) -> Result<HashMap<Address, TokenBalanceMap>, EngineError> {
    let mut deltas: HashMap<Address, TokenBalanceMap> = HashMap::new();

    for output in &vertex.outputs {
        let Some(address) = &output.address else {
            continue;
        };
        let delta = output_delta(vertex, output)?;
        deltas
            .entry(address.clone())
            .or_default()
            .add(&output.token, &delta)?;
    }

    for utxo in spent {
        let delta = input_delta(utxo)?;
        deltas
            .entry(utxo.address.clone())
            .or_default()
            .add(&utxo.token, &delta)?;
    }

    Ok(deltas)
}

/// Delta map for voiding a vertex: the inverse of its accept-time map, with
/// the output side read from the stored rows' current lock state.
pub(crate) fn void_deltas(
    own_utxos: &[UtxoRecord],
    spent: &[UtxoRecord],
) -> Result<HashMap<Address, TokenBalanceMap>, EngineError> {
    let mut deltas: HashMap<Address, TokenBalanceMap> = HashMap::new();

    for utxo in own_utxos {
        let delta = if utxo.authorities != 0 {
            let authorities = Authorities::from_mask(utxo.authorities).negate();
            Balance {
                unlocked_authorities: if utxo.locked {
                    Authorities::default()
                } else {
                    authorities
                },
                locked_authorities: if utxo.locked {
                    authorities
                } else {
                    Authorities::default()
                },
                ..Balance::default()
            }
        } else {
            let value = amount_of(utxo)?;
            Balance {
                total_received: -value,
                unlocked_amount: if utxo.locked { 0 } else { -value },
                locked_amount: if utxo.locked { -value } else { 0 },
                ..Balance::default()
            }
        };
        deltas
            .entry(utxo.address.clone())
            .or_default()
            .add(&utxo.token, &delta)?;
    }

    for utxo in spent {
        // Re-credit what the accept debited. input_delta negated: the value
        // returns to the unlocked bucket, consumed authorities come back.
        let delta = input_delta(utxo)?.negate();
        deltas
            .entry(utxo.address.clone())
            .or_default()
            .add(&utxo.token, &delta)?;
    }

    Ok(deltas)
}
