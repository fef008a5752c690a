//! # Diff Classifier
//!
//! Turns a `VERTEX_METADATA_CHANGED` notification plus the stored vertex row
//! into one semantic decision. The rules form a strict priority list, not
//! independent conditions: voided-state changes outrank everything else
//! because voiding invalidates block-membership and execution semantics
//! wholesale, and nano-execution changes outrank first-block changes for the
//! same reason in miniature.

use crate::ledger::{NcExecution, VertexData, VertexRecord};

/// The classifier's verdict on a metadata change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexDiff {
    /// Treat the vertex as newly accepted (also: re-accept after unvoid,
    /// and token re-creation after a nano execution succeeds again).
    TxNew,
    /// The vertex became voided.
    TxVoided,
    /// The vertex stopped being voided.
    TxUnvoided,
    /// A formerly successful nano execution is no longer successful.
    NcExecVoided,
    /// The vertex gained its first confirming block.
    TxFirstBlock,
    /// Nothing the mirror needs to act on.
    Ignore,
}

/// Classifies a metadata change. `stored` is the mirror's current row for
/// the vertex, or `None` when the mirror has never seen it.
pub fn classify(stored: Option<&VertexRecord>, incoming: &VertexData) -> VertexDiff {
    let voided = incoming.is_voided();

    let Some(stored) = stored else {
        // Never persist an unknown vertex that is already voided -- there is
        // nothing to invert and nothing a wallet could read.
        return if voided {
            VertexDiff::Ignore
        } else {
            VertexDiff::TxNew
        };
    };

    if voided {
        return if stored.voided {
            VertexDiff::Ignore
        } else {
            VertexDiff::TxVoided
        };
    }

    if stored.voided {
        return VertexDiff::TxUnvoided;
    }

    if incoming.has_nano() {
        let was_success = stored.nc_execution == Some(NcExecution::Success);
        let is_success = incoming.metadata.nc_execution == Some(NcExecution::Success);
        if was_success && !is_success {
            return VertexDiff::NcExecVoided;
        }
        if is_success && !was_success {
            // Route through the accept path; its duplicate branch re-creates
            // the nano tokens idempotently.
            return VertexDiff::TxNew;
        }
    }

    if incoming.metadata.first_block.is_some() && stored.height.is_none() {
        return VertexDiff::TxFirstBlock;
    }

    VertexDiff::Ignore
}
