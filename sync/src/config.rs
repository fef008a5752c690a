//! # Sync Constants & Tuning Defaults
//!
//! Every magic number in PRISM lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Most of these are defaults for [`SyncSettings`](crate::stream::SyncSettings)
//! and can be overridden per deployment. The token identifiers are part of
//! the upstream wire contract and cannot.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Native Token
// ---------------------------------------------------------------------------

/// The native token of the mirrored ledger. The upstream encodes it as the
/// literal two-character id `"00"` rather than a full 32-byte hash, and every
/// value output that doesn't name another token moves this one.
pub const NATIVE_TOKEN_ID: &str = "00";

/// Display name for the native token. Used when lazily creating the token
/// row on first sight — the upstream never sends metadata for it.
pub const NATIVE_TOKEN_NAME: &str = "Prism";

/// Display symbol for the native token.
pub const NATIVE_TOKEN_SYMBOL: &str = "PRSM";

// ---------------------------------------------------------------------------
// Stream Flow Control
// ---------------------------------------------------------------------------

/// Upstream send-window size advertised in START_STREAM and every ACK.
/// The upstream will keep at most this many unacked events in flight.
/// 256 absorbs bursts without letting a stalled consumer hoard memory.
pub const DEFAULT_ACK_WINDOW_SIZE: u64 = 256;

/// How long the machine sits idle with no new event before it suspects the
/// stream has silently dropped messages and probes the event-by-id endpoint.
/// Ten seconds is long enough to be quiet on a healthy stream and short
/// enough that a wedged connection is caught before wallets notice.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Base unit for reconnection backoff. The actual delay is
/// `min(retry_attempt, max_steps) * step`.
pub const DEFAULT_RETRY_BACKOFF_STEP: Duration = Duration::from_secs(1);

/// Cap on the backoff multiplier. With a 1s step this tops out at 30s
/// between reconnection attempts.
pub const DEFAULT_MAX_RETRY_BACKOFF_STEPS: u32 = 30;

/// Interval between healthcheck pings while connected.
pub const DEFAULT_HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Missed-Event Probe
// ---------------------------------------------------------------------------

/// Maximum attempts for one probe invocation before giving up. The probe is
/// advisory — exhausting retries returns the machine to idle, not to error.
pub const PROBE_MAX_ATTEMPTS: u32 = 10;

/// Initial delay between probe retries. Doubles on every failure.
pub const PROBE_BASE_DELAY: Duration = Duration::from_millis(100);

/// Ceiling on the probe retry delay.
pub const PROBE_MAX_DELAY: Duration = Duration::from_secs(10);

/// Page size requested from the event-by-id endpoint. One event would do —
/// we only ask "is there anything after my cursor" — but a page lets the
/// same call serve debugging by hand.
pub const PROBE_PAGE_SIZE: u64 = 100;

// ---------------------------------------------------------------------------
// Caching & Deduplication
// ---------------------------------------------------------------------------

/// Capacity of the vertex fingerprint cache. Entries are evicted
/// oldest-first; a miss only costs a store read and a no-op reconcile.
pub const DEFAULT_TX_CACHE_CAPACITY: usize = 10_000;

/// Grace period after machine start during which duplicate "new vertex"
/// notifications are logged at debug instead of warn. The upstream resends
/// the tail of the stream after a reconnect, so duplicates right after boot
/// are expected; duplicates long after it are an anomaly worth a warning.
pub const DEFAULT_DUPLICATE_GRACE: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Ledger Parameters
// ---------------------------------------------------------------------------

/// Fallback for the reward-spend distance when the node's version endpoint
/// doesn't advertise one. Block rewards stay height-locked until this many
/// blocks have been found on top of them.
pub const DEFAULT_REWARD_SPEND_MIN_BLOCKS: u64 = 300;

/// Default address gap maintained ahead of the highest used index of a
/// wallet. Matches the BIP-44 convention wallets expect.
pub const DEFAULT_WALLET_MAX_GAP: u32 = 20;
