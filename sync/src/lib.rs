// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # PRISM Sync — Core Library
//!
//! PRISM keeps a relational-style mirror of a DAG ledger in lockstep with an
//! upstream node's event stream, so wallets can read balances from the mirror
//! instead of hammering the ledger node. The upstream decides what is
//! accepted, voided, or reorganized away; our job is to replicate those
//! decisions faithfully, idempotently, and in order — nothing more, nothing
//! less. We validate no signatures and run no consensus. We are a mirror,
//! and mirrors don't argue.
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the actual concerns of a
//! sync daemon:
//!
//! - **balance** — Authority vectors and balance arithmetic. Small, pure,
//!   and the foundation everything else leans on.
//! - **ledger** — Domain types: vertices, UTXOs, balance rows, tokens.
//! - **store** — The `LedgerStore` transaction seam, plus the embedded
//!   sled-backed reference implementation.
//! - **engine** — The reconciliation engine: applies accept/void/unvoid
//!   effects inside a single store transaction per vertex.
//! - **stream** — The protocol state machine, diff classifier, socket and
//!   healthcheck actors, and the missed-event probe.
//! - **wallet** — Address-to-wallet resolution and gap extension.
//! - **notify** — Best-effort downstream fan-out of wallet balance changes.
//! - **config** — Protocol constants and tuning defaults.
//!
//! ## Design Philosophy
//!
//! 1. Balances always reflect a whole number of fully applied vertices.
//! 2. The durable cursor only ever moves forward. Ever.
//! 3. Voiding a vertex is the exact inverse of accepting it.
//! 4. If it touches money, it has tests. Plural.

pub mod balance;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod notify;
pub mod store;
pub mod stream;
pub mod wallet;
