//! # Protocol State Machine
//!
//! The single-threaded interpreter that owns the sync lifecycle:
//!
//! ```text
//! INITIALIZING ──> CONNECTING ──> CONNECTED{idle, handling*} <──> RECONNECTING
//!       │                              │
//!       └──────────> ERRORED <─────────┘   (terminal)
//! ```
//!
//! The machine processes one queued event to completion — including the
//! reconciliation transaction it triggers — before taking the next. The
//! socket and healthcheck actors run concurrently but only ever post into
//! the queue; the mutable [`Context`] lives here and is shared with nobody.
//!
//! Ordering rules worth stating once:
//!
//! - The durable cursor is advanced (its own transaction), then the ACK is
//!   sent. Crashing between the two re-delivers an event the mirror has
//!   already applied, which the duplicate guards absorb; the reverse order
//!   could ack an event the mirror never applied.
//! - An unvoid is not acked when the residue is cleared. The same event
//!   rides straight into the accept path and the ack waits for it, so the
//!   cursor only moves once the vertex has a fully reconciled balance state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::TxCache;
use super::classifier::{classify, VertexDiff};
use super::event::{ClientMessage, EventEnvelope, EventKind, LedgerEvent};
use super::healthcheck;
use super::node_api::NodeApiClient;
use super::socket::{SocketHandle, SocketSpawner};
use super::StreamError;
use crate::config;
use crate::engine::{EngineError, ReconciliationEngine};
use crate::ledger::{TxFingerprint, VertexData};
use crate::notify::NotificationSender;
use crate::store::{LedgerStore, StoreTxn};
use crate::wallet::AddressDeriver;

/// Capacity of the machine's inbound queue. Deep enough to absorb a full
/// upstream send window plus actor chatter.
const EVENT_QUEUE_CAPACITY: usize = 512;

// ---------------------------------------------------------------------------
// Events & states
// ---------------------------------------------------------------------------

/// Everything that can land in the machine's queue.
#[derive(Debug)]
pub enum MachineEvent {
    /// The socket actor established its connection.
    SocketConnected,
    /// The socket actor's connection is gone (or never came up).
    SocketDisconnected { reason: String },
    /// A decoded event envelope from the stream.
    Stream(Box<EventEnvelope>),
    /// Liveness tick from the healthcheck actor.
    HealthcheckPing,
}

/// The machine's states. The `Handling*` values are transient — they exist
/// for logging and tests; the dispatch loop passes through them within one
/// `tick`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineState {
    Initializing,
    Connecting,
    Idle,
    DetectingDiff,
    HandlingVertexAccepted,
    HandlingVoidedTx,
    HandlingUnvoidedTx,
    HandlingNcExecVoided,
    HandlingFirstBlock,
    HandlingVertexRemoved,
    HandlingUnhandledEvent,
    CheckingForMissedEvents,
    Reconnecting,
    Errored,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Tuning knobs for one sync machine. `new` fills everything except the
/// network from the defaults in [`crate::config`].
#[derive(Clone, Debug)]
pub struct SyncSettings {
    /// Network the mirror belongs to. Any envelope stamped otherwise is a
    /// fatal contract violation.
    pub network: String,
    /// Pin the upstream peer id. When `None`, the first envelope's peer id
    /// is pinned and enforced from then on.
    pub expected_peer_id: Option<String>,
    /// Pin the stream id, same rules as the peer id.
    pub expected_stream_id: Option<String>,
    /// Send-window size advertised upstream.
    pub ack_window_size: u64,
    /// Idle time without any event before the missed-event probe runs.
    pub ack_timeout: std::time::Duration,
    /// Backoff unit between reconnection attempts.
    pub retry_backoff_step: std::time::Duration,
    /// Cap on the backoff multiplier.
    pub max_retry_backoff_steps: u32,
    /// Fingerprint cache capacity.
    pub tx_cache_capacity: usize,
    /// Grace period for quiet duplicate logging after start.
    pub duplicate_grace: std::time::Duration,
    /// Healthcheck ping interval.
    pub healthcheck_interval: std::time::Duration,
}

impl SyncSettings {
    /// Defaults for `network`, everything else from [`crate::config`].
    pub fn new(network: &str) -> Self {
        Self {
            network: network.to_string(),
            expected_peer_id: None,
            expected_stream_id: None,
            ack_window_size: config::DEFAULT_ACK_WINDOW_SIZE,
            ack_timeout: config::DEFAULT_ACK_TIMEOUT,
            retry_backoff_step: config::DEFAULT_RETRY_BACKOFF_STEP,
            max_retry_backoff_steps: config::DEFAULT_MAX_RETRY_BACKOFF_STEPS,
            tx_cache_capacity: config::DEFAULT_TX_CACHE_CAPACITY,
            duplicate_grace: config::DEFAULT_DUPLICATE_GRACE,
            healthcheck_interval: config::DEFAULT_HEALTHCHECK_INTERVAL,
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Mutable state threaded through every transition. Owned by the dispatch
/// loop, passed nowhere.
struct Context {
    socket: Option<SocketHandle>,
    healthcheck: Option<JoinHandle<()>>,
    retry_attempt: u32,
    cache: TxCache,
    /// Peer id enforced on every envelope, pinned from settings or the
    /// first message.
    peer_id: Option<String>,
    stream_id: Option<String>,
    /// Last event id we acked, mirrored from the durable cursor.
    last_acked: Option<u64>,
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// The sync machine. Construct, then `run` — or drive `tick` by hand in
/// tests.
pub struct SyncMachine<S: LedgerStore, N: NodeApiClient> {
    settings: SyncSettings,
    store: Arc<S>,
    node: Arc<N>,
    deriver: Arc<dyn AddressDeriver>,
    notifications: NotificationSender,
    spawner: Arc<dyn SocketSpawner>,
    engine: Option<ReconciliationEngine<S>>,
    events_tx: mpsc::Sender<MachineEvent>,
    events_rx: mpsc::Receiver<MachineEvent>,
    state: MachineState,
    ctx: Context,
}

impl<S: LedgerStore, N: NodeApiClient> SyncMachine<S, N> {
    pub fn new(
        settings: SyncSettings,
        store: Arc<S>,
        node: Arc<N>,
        deriver: Arc<dyn AddressDeriver>,
        spawner: Arc<dyn SocketSpawner>,
        notifications: NotificationSender,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let cache = TxCache::new(settings.tx_cache_capacity);
        Self {
            settings,
            store,
            node,
            deriver,
            notifications,
            spawner,
            engine: None,
            events_tx,
            events_rx,
            state: MachineState::Initializing,
            ctx: Context {
                socket: None,
                healthcheck: None,
                retry_attempt: 0,
                cache,
                peer_id: None,
                stream_id: None,
                last_acked: None,
            },
        }
    }

    /// Current state. Mostly for tests and status reporting.
    pub fn state(&self) -> MachineState {
        self.state
    }

    /// A sender into the machine's queue, for actors (and tests).
    pub fn events_sender(&self) -> mpsc::Sender<MachineEvent> {
        self.events_tx.clone()
    }

    /// Runs until a fatal error. There is no clean exit: a mirror's job is
    /// never done, so returning is always a failure the process supervisor
    /// should react to.
    pub async fn run(mut self) -> Result<(), StreamError> {
        loop {
            if let Err(error) = self.tick().await {
                self.state = MachineState::Errored;
                self.teardown().await;
                tracing::error!(%error, "sync machine entered the terminal error state");
                return Err(error);
            }
        }
    }

    /// One state-machine step. Public so tests can single-step.
    pub async fn tick(&mut self) -> Result<(), StreamError> {
        match self.state {
            MachineState::Initializing => self.initialize().await,
            MachineState::Connecting => self.connect().await,
            MachineState::Idle => self.idle().await,
            MachineState::CheckingForMissedEvents => self.check_missed_events().await,
            MachineState::Reconnecting => self.reconnect().await,
            MachineState::Errored => Err(StreamError::Contract(
                "machine is in the terminal error state".to_string(),
            )),
            // Handling states resolve within the tick that entered them.
            _ => Ok(()),
        }
    }

    // -- INITIALIZING -------------------------------------------------------

    async fn initialize(&mut self) -> Result<(), StreamError> {
        let cursor = {
            let txn = self.store.begin().map_err(EngineError::Store)?;
            let cursor = txn.last_event_id().map_err(EngineError::Store)?;
            txn.rollback();
            cursor
        };

        let version = self.node.version().await?;
        if let Some(network) = &version.network {
            if network != &self.settings.network {
                return Err(StreamError::Contract(format!(
                    "node is on network {network:?}, mirror is configured for {:?}",
                    self.settings.network
                )));
            }
        }
        let reward_spend_min_blocks = version
            .reward_spend_min_blocks
            .unwrap_or(config::DEFAULT_REWARD_SPEND_MIN_BLOCKS);

        self.engine = Some(ReconciliationEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.deriver),
            self.notifications.clone(),
            reward_spend_min_blocks,
            self.settings.duplicate_grace,
        ));
        self.ctx.last_acked = cursor;

        info!(
            cursor = ?cursor,
            reward_spend_min_blocks,
            network = %self.settings.network,
            "sync machine initialized"
        );
        self.state = MachineState::Connecting;
        Ok(())
    }

    // -- CONNECTING ---------------------------------------------------------

    async fn connect(&mut self) -> Result<(), StreamError> {
        info!("spawning socket actor");
        let handle = self.spawner.spawn(self.events_tx.clone());
        self.ctx.socket = Some(handle);

        loop {
            match self.events_rx.recv().await {
                None => return Err(StreamError::ChannelClosed),
                Some(MachineEvent::SocketConnected) => {
                    self.ctx.retry_attempt = 0;
                    let start = ClientMessage::StartStream {
                        window_size: self.settings.ack_window_size,
                        last_ack_event_id: self.ctx.last_acked,
                    };
                    self.socket()?.send(start).await?;
                    self.start_healthcheck();
                    info!(last_acked = ?self.ctx.last_acked, "stream started");
                    self.state = MachineState::Idle;
                    return Ok(());
                }
                Some(MachineEvent::SocketDisconnected { reason }) => {
                    warn!(%reason, "socket did not come up");
                    self.state = MachineState::Reconnecting;
                    return Ok(());
                }
                // Stale events from a previous connection (or early pings)
                // are dropped; the fresh stream re-delivers from the cursor.
                Some(_) => {}
            }
        }
    }

    // -- CONNECTED.idle -----------------------------------------------------

    async fn idle(&mut self) -> Result<(), StreamError> {
        tokio::select! {
            incoming = self.events_rx.recv() => match incoming {
                None => Err(StreamError::ChannelClosed),
                Some(event) => self.dispatch(event).await,
            },
            _ = tokio::time::sleep(self.settings.ack_timeout) => {
                debug!("ack timeout elapsed with no events");
                self.state = MachineState::CheckingForMissedEvents;
                Ok(())
            }
        }
    }

    async fn dispatch(&mut self, event: MachineEvent) -> Result<(), StreamError> {
        match event {
            MachineEvent::SocketConnected => Ok(()),
            MachineEvent::SocketDisconnected { reason } => {
                warn!(%reason, "socket lost");
                self.state = MachineState::Reconnecting;
                Ok(())
            }
            MachineEvent::HealthcheckPing => {
                if let Some(socket) = &self.ctx.socket {
                    if socket.ping().await.is_err() {
                        self.state = MachineState::Reconnecting;
                    }
                }
                Ok(())
            }
            MachineEvent::Stream(envelope) => self.handle_envelope(*envelope).await,
        }
    }

    /// Guard chain for one envelope, in the specified order: identity,
    /// unchanged, metadata-changed, already-voided, vertex-accepted,
    /// everything else.
    async fn handle_envelope(&mut self, envelope: EventEnvelope) -> Result<(), StreamError> {
        self.check_identity(&envelope)?;
        let event = envelope.event;

        // The fingerprint shortcut only covers the two kinds whose effect is
        // fully described by the metadata slice. A removal changes state the
        // fingerprint cannot see and must never be skipped.
        if matches!(
            event.kind,
            EventKind::NewVertexAccepted | EventKind::VertexMetadataChanged
        ) {
            if let Some(vertex) = event.data.vertex() {
                let fingerprint = TxFingerprint::of(&vertex.metadata);
                if self.ctx.cache.is_unchanged(&vertex.hash, &fingerprint) {
                    debug!(vertex = %vertex.hash, event = event.id, "unchanged fingerprint");
                    return self.finish_event(event.id, None).await;
                }
            }
        }

        match event.kind {
            EventKind::VertexMetadataChanged => self.handle_metadata_changed(event).await,
            EventKind::NewVertexAccepted => {
                let Some(vertex) = event.data.vertex().cloned() else {
                    return self.finish_unhandled(event).await;
                };
                if vertex.is_voided() {
                    // Unknown and already voided: never persisted, just acked.
                    debug!(vertex = %vertex.hash, "already voided on arrival");
                    return self.finish_event(event.id, None).await;
                }
                self.state = MachineState::HandlingVertexAccepted;
                self.engine()?.handle_vertex_accepted(&vertex)?;
                self.finish_vertex_event(event.id, &vertex).await
            }
            EventKind::VertexRemoved => {
                let Some(vertex) = event.data.vertex().cloned() else {
                    return self.finish_unhandled(event).await;
                };
                self.state = MachineState::HandlingVertexRemoved;
                self.engine()?.handle_vertex_removed(&vertex)?;
                // Forget the fingerprint: if the vertex is ever announced
                // again, it must be re-ingested, not skipped as unchanged.
                self.ctx.cache.remove(&vertex.hash);
                self.finish_event(event.id, None).await
            }
            _ => self.finish_unhandled(event).await,
        }
    }

    async fn handle_metadata_changed(&mut self, event: LedgerEvent) -> Result<(), StreamError> {
        self.state = MachineState::DetectingDiff;
        let Some(vertex) = event.data.vertex().cloned() else {
            return self.finish_unhandled(event).await;
        };

        let stored = {
            let txn = self.store.begin().map_err(EngineError::Store)?;
            let stored = txn.vertex(&vertex.hash).map_err(EngineError::Store)?;
            txn.rollback();
            stored
        };

        let diff = classify(stored.as_ref(), &vertex);
        debug!(vertex = %vertex.hash, ?diff, event = event.id, "metadata diff");
        match diff {
            VertexDiff::TxNew => {
                self.state = MachineState::HandlingVertexAccepted;
                self.engine()?.handle_vertex_accepted(&vertex)?;
            }
            VertexDiff::TxVoided => {
                self.state = MachineState::HandlingVoidedTx;
                self.engine()?.handle_vertex_voided(&vertex)?;
            }
            VertexDiff::TxUnvoided => {
                // Clear the residue, then re-ingest as new. Deliberately no
                // ack in between: the cursor only advances once the vertex
                // is fully reconciled again.
                self.state = MachineState::HandlingUnvoidedTx;
                self.engine()?.handle_vertex_unvoided(&vertex)?;
                self.state = MachineState::HandlingVertexAccepted;
                self.engine()?.handle_vertex_accepted(&vertex)?;
            }
            VertexDiff::NcExecVoided => {
                self.state = MachineState::HandlingNcExecVoided;
                self.engine()?.handle_nc_exec_voided(&vertex)?;
            }
            VertexDiff::TxFirstBlock => {
                self.state = MachineState::HandlingFirstBlock;
                self.engine()?.handle_first_block(&vertex)?;
            }
            VertexDiff::Ignore => {
                self.state = MachineState::HandlingUnhandledEvent;
            }
        }
        self.finish_vertex_event(event.id, &vertex).await
    }

    async fn finish_unhandled(&mut self, event: LedgerEvent) -> Result<(), StreamError> {
        // Still acked — stalling the upstream's window over an event type
        // we intentionally ignore would wedge the whole stream.
        self.state = MachineState::HandlingUnhandledEvent;
        debug!(event = event.id, kind = ?event.kind, "unhandled event type");
        self.finish_event(event.id, None).await
    }

    /// Cursor, ack, cache, back to idle — the common tail of every
    /// successfully handled event.
    async fn finish_event(
        &mut self,
        event_id: u64,
        fingerprint: Option<(String, TxFingerprint)>,
    ) -> Result<(), StreamError> {
        self.engine()?.update_cursor(event_id)?;
        let ack = ClientMessage::Ack {
            window_size: self.settings.ack_window_size,
            ack_event_id: event_id,
        };
        self.socket()?.send(ack).await?;
        if let Some((hash, fingerprint)) = fingerprint {
            self.ctx.cache.insert(hash, fingerprint);
        }
        self.ctx.last_acked = Some(event_id);
        self.state = MachineState::Idle;
        Ok(())
    }

    async fn finish_vertex_event(
        &mut self,
        event_id: u64,
        vertex: &VertexData,
    ) -> Result<(), StreamError> {
        let fingerprint = TxFingerprint::of(&vertex.metadata);
        self.finish_event(event_id, Some((vertex.hash.clone(), fingerprint)))
            .await
    }

    fn check_identity(&mut self, envelope: &EventEnvelope) -> Result<(), StreamError> {
        if envelope.network != self.settings.network {
            return Err(StreamError::Contract(format!(
                "event from network {:?}, expected {:?}",
                envelope.network, self.settings.network
            )));
        }

        let expected_peer = self
            .ctx
            .peer_id
            .get_or_insert_with(|| {
                self.settings
                    .expected_peer_id
                    .clone()
                    .unwrap_or_else(|| envelope.peer_id.clone())
            })
            .clone();
        if envelope.peer_id != expected_peer {
            return Err(StreamError::Contract(format!(
                "event from peer {:?}, expected {expected_peer:?}",
                envelope.peer_id
            )));
        }

        let expected_stream = self
            .ctx
            .stream_id
            .get_or_insert_with(|| {
                self.settings
                    .expected_stream_id
                    .clone()
                    .unwrap_or_else(|| envelope.stream_id.clone())
            })
            .clone();
        if envelope.stream_id != expected_stream {
            return Err(StreamError::Contract(format!(
                "event from stream {:?}, expected {expected_stream:?}",
                envelope.stream_id
            )));
        }

        Ok(())
    }

    // -- checkingForMissedEvents --------------------------------------------

    async fn check_missed_events(&mut self) -> Result<(), StreamError> {
        match self.node.has_events_after(self.ctx.last_acked).await {
            Ok(true) => {
                warn!(
                    last_acked = ?self.ctx.last_acked,
                    "upstream has events we never received; forcing a fresh stream"
                );
                self.state = MachineState::Reconnecting;
            }
            Ok(false) => {
                debug!("no missed events");
                self.state = MachineState::Idle;
            }
            Err(error) => {
                // The probe is advisory. A broken probe must not take down
                // a healthy stream.
                warn!(%error, "missed-event probe failed; staying connected");
                self.state = MachineState::Idle;
            }
        }
        Ok(())
    }

    // -- RECONNECTING -------------------------------------------------------

    async fn reconnect(&mut self) -> Result<(), StreamError> {
        self.teardown().await;
        self.ctx.retry_attempt += 1;
        let steps = self
            .ctx
            .retry_attempt
            .min(self.settings.max_retry_backoff_steps);
        let delay = self.settings.retry_backoff_step * steps;
        info!(attempt = self.ctx.retry_attempt, ?delay, "reconnect backoff");
        tokio::time::sleep(delay).await;
        self.state = MachineState::Connecting;
        Ok(())
    }

    async fn teardown(&mut self) {
        self.stop_healthcheck();
        if let Some(socket) = self.ctx.socket.take() {
            socket.shutdown().await;
        }
    }

    fn start_healthcheck(&mut self) {
        self.stop_healthcheck();
        self.ctx.healthcheck = Some(healthcheck::spawn(
            self.settings.healthcheck_interval,
            self.events_tx.clone(),
        ));
    }

    fn stop_healthcheck(&mut self) {
        if let Some(task) = self.ctx.healthcheck.take() {
            task.abort();
        }
    }

    fn socket(&self) -> Result<&SocketHandle, StreamError> {
        self.ctx.socket.as_ref().ok_or(StreamError::NotInitialized)
    }

    fn engine(&self) -> Result<&ReconciliationEngine<S>, StreamError> {
        self.engine.as_ref().ok_or(StreamError::NotInitialized)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::engine::test_support::value_tx;
    use crate::stream::event::EventData;
    use crate::stream::node_api::VersionInfo;
    use crate::stream::socket::SocketCommand;
    use crate::store::SledStore;
    use crate::wallet::NullDeriver;

    // -- Fakes --------------------------------------------------------------

    struct FakeNode {
        version: VersionInfo,
        /// Scripted probe responses; `None` means "probe errored".
        probes: Mutex<VecDeque<Option<bool>>>,
    }

    impl FakeNode {
        fn new() -> Self {
            Self {
                version: VersionInfo {
                    network: Some("testnet".into()),
                    reward_spend_min_blocks: Some(3),
                },
                probes: Mutex::new(VecDeque::new()),
            }
        }

        fn script_probe(&self, response: Option<bool>) {
            self.probes.lock().push_back(response);
        }
    }

    #[async_trait]
    impl NodeApiClient for FakeNode {
        async fn version(&self) -> Result<VersionInfo, StreamError> {
            Ok(self.version.clone())
        }

        async fn has_events_after(&self, _: Option<u64>) -> Result<bool, StreamError> {
            match self.probes.lock().pop_front() {
                Some(Some(answer)) => Ok(answer),
                Some(None) => Err(StreamError::Contract("probe down".into())),
                None => Ok(false),
            }
        }
    }

    /// Spawner whose "socket" just records every command it is asked to send.
    struct FakeSpawner {
        commands: Arc<Mutex<Vec<SocketCommand>>>,
    }

    impl FakeSpawner {
        fn new() -> Self {
            Self {
                commands: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn acked_ids(&self) -> Vec<u64> {
            self.commands
                .lock()
                .iter()
                .filter_map(|command| match command {
                    SocketCommand::Send(ClientMessage::Ack { ack_event_id, .. }) => {
                        Some(*ack_event_id)
                    }
                    _ => None,
                })
                .collect()
        }

        fn start_stream_cursors(&self) -> Vec<Option<u64>> {
            self.commands
                .lock()
                .iter()
                .filter_map(|command| match command {
                    SocketCommand::Send(ClientMessage::StartStream {
                        last_ack_event_id, ..
                    }) => Some(*last_ack_event_id),
                    _ => None,
                })
                .collect()
        }
    }

    impl SocketSpawner for FakeSpawner {
        fn spawn(&self, _events: mpsc::Sender<MachineEvent>) -> SocketHandle {
            let (commands_tx, mut commands_rx) = mpsc::channel(64);
            let sink = Arc::clone(&self.commands);
            let task = tokio::spawn(async move {
                while let Some(command) = commands_rx.recv().await {
                    sink.lock().push(command);
                }
            });
            SocketHandle::new(commands_tx, task)
        }
    }

    // -- Builders -----------------------------------------------------------

    fn settings() -> SyncSettings {
        let mut settings = SyncSettings::new("testnet");
        settings.ack_timeout = Duration::from_millis(500);
        settings
    }

    type TestMachine = SyncMachine<SledStore, FakeNode>;

    fn machine(
        store: Arc<SledStore>,
        node: Arc<FakeNode>,
        spawner: Arc<FakeSpawner>,
    ) -> TestMachine {
        let (notifications, _) = crate::notify::channel(16);
        SyncMachine::new(
            settings(),
            store,
            node,
            Arc::new(NullDeriver),
            spawner,
            notifications,
        )
    }

    /// Runs INITIALIZING and CONNECTING so the machine sits in idle.
    async fn bring_up(machine: &mut TestMachine) {
        machine.tick().await.unwrap();
        assert_eq!(machine.state(), MachineState::Connecting);
        machine
            .events_sender()
            .send(MachineEvent::SocketConnected)
            .await
            .unwrap();
        machine.tick().await.unwrap();
        assert_eq!(machine.state(), MachineState::Idle);
    }

    fn envelope(id: u64, kind: EventKind, vertex: crate::ledger::VertexData) -> MachineEvent {
        MachineEvent::Stream(Box::new(EventEnvelope {
            peer_id: "peer-1".into(),
            stream_id: "stream-1".into(),
            network: "testnet".into(),
            latest_event_id: None,
            event: LedgerEvent {
                id,
                timestamp: 1.0,
                kind,
                data: EventData::Vertex(Box::new(vertex)),
                group_id: None,
            },
        }))
    }

    // -- Lifecycle ----------------------------------------------------------

    #[tokio::test]
    async fn initializes_and_starts_stream_at_cursor() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let spawner = Arc::new(FakeSpawner::new());
        let mut machine = machine(store, Arc::new(FakeNode::new()), Arc::clone(&spawner));

        bring_up(&mut machine).await;

        // Fresh mirror: the stream starts from the very beginning.
        tokio::task::yield_now().await;
        assert_eq!(spawner.start_stream_cursors(), vec![None]);
    }

    #[tokio::test]
    async fn wrong_network_in_version_is_fatal() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let node = FakeNode {
            version: VersionInfo {
                network: Some("mainnet".into()),
                reward_spend_min_blocks: Some(3),
            },
            probes: Mutex::new(VecDeque::new()),
        };
        let mut machine = machine(store, Arc::new(node), Arc::new(FakeSpawner::new()));

        let result = machine.tick().await;
        assert!(matches!(result, Err(StreamError::Contract(_))));
    }

    #[tokio::test]
    async fn accepts_vertex_and_acks_in_order() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let spawner = Arc::new(FakeSpawner::new());
        let mut machine = machine(
            Arc::clone(&store),
            Arc::new(FakeNode::new()),
            Arc::clone(&spawner),
        );
        bring_up(&mut machine).await;

        let sender = machine.events_sender();
        sender
            .send(envelope(
                10,
                EventKind::NewVertexAccepted,
                value_tx("tx-a", &[], &[("addr1", 100)]),
            ))
            .await
            .unwrap();
        machine.tick().await.unwrap();
        assert_eq!(machine.state(), MachineState::Idle);

        sender
            .send(envelope(
                11,
                EventKind::NewVertexAccepted,
                value_tx("tx-b", &[("tx-a", 0)], &[("addr2", 100)]),
            ))
            .await
            .unwrap();
        machine.tick().await.unwrap();

        // The mirror applied both vertices and the cursor tracked the acks.
        let txn = crate::store::LedgerStore::begin(&*store).unwrap();
        assert!(txn.vertex("tx-b").unwrap().is_some());
        assert_eq!(txn.last_event_id().unwrap(), Some(11));
        drop(txn);

        tokio::task::yield_now().await;
        assert_eq!(spawner.acked_ids(), vec![10, 11]);
    }

    #[tokio::test]
    async fn wrong_network_on_event_is_fatal() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let mut machine = machine(
            store,
            Arc::new(FakeNode::new()),
            Arc::new(FakeSpawner::new()),
        );
        bring_up(&mut machine).await;

        let MachineEvent::Stream(mut boxed) = envelope(
            1,
            EventKind::NewVertexAccepted,
            value_tx("tx-a", &[], &[("addr1", 1)]),
        ) else {
            unreachable!()
        };
        boxed.network = "mainnet".into();
        machine
            .events_sender()
            .send(MachineEvent::Stream(boxed))
            .await
            .unwrap();

        let result = machine.tick().await;
        assert!(matches!(result, Err(StreamError::Contract(_))));
    }

    #[tokio::test]
    async fn pinned_peer_id_is_enforced() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let mut machine = machine(
            store,
            Arc::new(FakeNode::new()),
            Arc::new(FakeSpawner::new()),
        );
        bring_up(&mut machine).await;
        let sender = machine.events_sender();

        sender
            .send(envelope(
                1,
                EventKind::NewVertexAccepted,
                value_tx("tx-a", &[], &[("addr1", 1)]),
            ))
            .await
            .unwrap();
        machine.tick().await.unwrap();

        // Same stream, different peer: the first envelope pinned "peer-1".
        let MachineEvent::Stream(mut boxed) = envelope(
            2,
            EventKind::NewVertexAccepted,
            value_tx("tx-b", &[], &[("addr1", 1)]),
        ) else {
            unreachable!()
        };
        boxed.peer_id = "peer-2".into();
        sender.send(MachineEvent::Stream(boxed)).await.unwrap();

        let result = machine.tick().await;
        assert!(matches!(result, Err(StreamError::Contract(_))));
    }

    #[tokio::test]
    async fn unknown_event_kinds_are_acked() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let spawner = Arc::new(FakeSpawner::new());
        let mut machine = machine(
            Arc::clone(&store),
            Arc::new(FakeNode::new()),
            Arc::clone(&spawner),
        );
        bring_up(&mut machine).await;

        machine
            .events_sender()
            .send(MachineEvent::Stream(Box::new(EventEnvelope {
                peer_id: "peer-1".into(),
                stream_id: "stream-1".into(),
                network: "testnet".into(),
                latest_event_id: None,
                event: LedgerEvent {
                    id: 5,
                    timestamp: 1.0,
                    kind: EventKind::ReorgStarted,
                    data: EventData::Other(serde_json::json!({})),
                    group_id: Some(1),
                },
            })))
            .await
            .unwrap();
        machine.tick().await.unwrap();

        assert_eq!(machine.state(), MachineState::Idle);
        tokio::task::yield_now().await;
        assert_eq!(spawner.acked_ids(), vec![5]);
    }

    #[tokio::test]
    async fn voided_unknown_vertex_is_acked_without_storing() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let spawner = Arc::new(FakeSpawner::new());
        let mut machine = machine(
            Arc::clone(&store),
            Arc::new(FakeNode::new()),
            Arc::clone(&spawner),
        );
        bring_up(&mut machine).await;

        let mut vertex = value_tx("tx-a", &[], &[("addr1", 100)]);
        vertex.metadata.voided_by = vec!["tx-z".into()];
        machine
            .events_sender()
            .send(envelope(7, EventKind::NewVertexAccepted, vertex))
            .await
            .unwrap();
        machine.tick().await.unwrap();

        let txn = crate::store::LedgerStore::begin(&*store).unwrap();
        assert!(txn.vertex("tx-a").unwrap().is_none());
        drop(txn);
        tokio::task::yield_now().await;
        assert_eq!(spawner.acked_ids(), vec![7]);
    }

    #[tokio::test]
    async fn unchanged_fingerprint_is_acked_cheaply() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let spawner = Arc::new(FakeSpawner::new());
        let mut machine = machine(
            Arc::clone(&store),
            Arc::new(FakeNode::new()),
            Arc::clone(&spawner),
        );
        bring_up(&mut machine).await;
        let sender = machine.events_sender();

        let vertex = value_tx("tx-a", &[], &[("addr1", 100)]);
        sender
            .send(envelope(1, EventKind::NewVertexAccepted, vertex.clone()))
            .await
            .unwrap();
        machine.tick().await.unwrap();

        // Identical metadata again: cache short-circuits, balances stay put.
        sender
            .send(envelope(2, EventKind::VertexMetadataChanged, vertex))
            .await
            .unwrap();
        machine.tick().await.unwrap();

        let txn = crate::store::LedgerStore::begin(&*store).unwrap();
        let row = txn.address_balance("addr1", "00").unwrap().unwrap();
        assert_eq!(row.transactions, 1);
        assert_eq!(txn.last_event_id().unwrap(), Some(2));
        drop(txn);
        tokio::task::yield_now().await;
        assert_eq!(spawner.acked_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn metadata_void_then_unvoid_roundtrip() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let spawner = Arc::new(FakeSpawner::new());
        let mut machine = machine(
            Arc::clone(&store),
            Arc::new(FakeNode::new()),
            Arc::clone(&spawner),
        );
        bring_up(&mut machine).await;
        let sender = machine.events_sender();

        let vertex = value_tx("tx-a", &[], &[("addr1", 100)]);
        sender
            .send(envelope(1, EventKind::NewVertexAccepted, vertex.clone()))
            .await
            .unwrap();
        machine.tick().await.unwrap();

        let mut voided = vertex.clone();
        voided.metadata.voided_by = vec!["tx-z".into()];
        sender
            .send(envelope(2, EventKind::VertexMetadataChanged, voided))
            .await
            .unwrap();
        machine.tick().await.unwrap();

        {
            let txn = crate::store::LedgerStore::begin(&*store).unwrap();
            assert!(txn.vertex("tx-a").unwrap().unwrap().voided);
            assert_eq!(
                txn.address_balance("addr1", "00").unwrap().unwrap().total(),
                0
            );
        }

        // Unvoid: single event drives residue-clear plus re-accept, acked
        // exactly once at the end.
        sender
            .send(envelope(3, EventKind::VertexMetadataChanged, vertex))
            .await
            .unwrap();
        machine.tick().await.unwrap();

        let txn = crate::store::LedgerStore::begin(&*store).unwrap();
        let row = txn.address_balance("addr1", "00").unwrap().unwrap();
        assert_eq!(row.unlocked_balance, 100);
        assert_eq!(row.transactions, 1);
        assert_eq!(txn.last_event_id().unwrap(), Some(3));
        drop(txn);
        tokio::task::yield_now().await;
        assert_eq!(spawner.acked_ids(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn removed_vertex_is_deleted_and_acked() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let spawner = Arc::new(FakeSpawner::new());
        let mut machine = machine(
            Arc::clone(&store),
            Arc::new(FakeNode::new()),
            Arc::clone(&spawner),
        );
        bring_up(&mut machine).await;
        let sender = machine.events_sender();

        let vertex = value_tx("tx-a", &[], &[("addr1", 100)]);
        sender
            .send(envelope(1, EventKind::NewVertexAccepted, vertex.clone()))
            .await
            .unwrap();
        machine.tick().await.unwrap();

        sender
            .send(envelope(2, EventKind::VertexRemoved, vertex.clone()))
            .await
            .unwrap();
        machine.tick().await.unwrap();

        {
            let txn = crate::store::LedgerStore::begin(&*store).unwrap();
            assert!(txn.vertex("tx-a").unwrap().is_none());
            assert!(txn.utxo("tx-a", 0).unwrap().is_none());
            assert_eq!(
                txn.address_balance("addr1", "00").unwrap().unwrap().total(),
                0
            );
        }

        // A re-announcement with identical metadata is re-ingested, not
        // skipped off the fingerprint cache.
        sender
            .send(envelope(3, EventKind::NewVertexAccepted, vertex))
            .await
            .unwrap();
        machine.tick().await.unwrap();

        let txn = crate::store::LedgerStore::begin(&*store).unwrap();
        assert!(txn.vertex("tx-a").unwrap().is_some());
        drop(txn);
        tokio::task::yield_now().await;
        assert_eq!(spawner.acked_ids(), vec![1, 2, 3]);
    }

    // -- ACK timeout escalation ---------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn ack_timeout_probes_then_returns_to_idle() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let node = Arc::new(FakeNode::new());
        let mut machine = machine(store, Arc::clone(&node), Arc::new(FakeSpawner::new()));
        bring_up(&mut machine).await;

        // Ack event N, then go quiet.
        machine
            .events_sender()
            .send(envelope(
                10,
                EventKind::NewVertexAccepted,
                value_tx("tx-a", &[], &[("addr1", 5)]),
            ))
            .await
            .unwrap();
        machine.tick().await.unwrap();
        assert_eq!(machine.state(), MachineState::Idle);
        assert_eq!(machine.ctx.last_acked, Some(10));

        node.script_probe(Some(false));
        machine.tick().await.unwrap(); // idle -> timeout fires (paused time auto-advances)
        assert_eq!(machine.state(), MachineState::CheckingForMissedEvents);

        machine.tick().await.unwrap();
        assert_eq!(machine.state(), MachineState::Idle);
        // A clean probe does not count as a reconnection attempt.
        assert_eq!(machine.ctx.retry_attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_timeout_with_missed_events_reconnects() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let node = Arc::new(FakeNode::new());
        let mut machine = machine(store, Arc::clone(&node), Arc::new(FakeSpawner::new()));
        bring_up(&mut machine).await;

        node.script_probe(Some(true));
        machine.tick().await.unwrap();
        assert_eq!(machine.state(), MachineState::CheckingForMissedEvents);

        machine.tick().await.unwrap();
        assert_eq!(machine.state(), MachineState::Reconnecting);

        machine.tick().await.unwrap(); // backoff sleep under paused time
        assert_eq!(machine.state(), MachineState::Connecting);
        assert_eq!(machine.ctx.retry_attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_error_is_transient() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let node = Arc::new(FakeNode::new());
        let mut machine = machine(store, Arc::clone(&node), Arc::new(FakeSpawner::new()));
        bring_up(&mut machine).await;

        node.script_probe(None); // probe errors out
        machine.tick().await.unwrap();
        machine.tick().await.unwrap();
        assert_eq!(machine.state(), MachineState::Idle);
        assert_eq!(machine.ctx.retry_attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_reconnects_with_backoff() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let spawner = Arc::new(FakeSpawner::new());
        let mut machine = machine(store, Arc::new(FakeNode::new()), Arc::clone(&spawner));
        bring_up(&mut machine).await;

        machine
            .events_sender()
            .send(MachineEvent::SocketDisconnected {
                reason: "eof".into(),
            })
            .await
            .unwrap();
        machine.tick().await.unwrap();
        assert_eq!(machine.state(), MachineState::Reconnecting);

        machine.tick().await.unwrap();
        assert_eq!(machine.state(), MachineState::Connecting);
        assert_eq!(machine.ctx.retry_attempt, 1);

        // Reconnect succeeds and the counter resets.
        machine
            .events_sender()
            .send(MachineEvent::SocketConnected)
            .await
            .unwrap();
        machine.tick().await.unwrap();
        assert_eq!(machine.state(), MachineState::Idle);
        assert_eq!(machine.ctx.retry_attempt, 0);
    }
}
