//! # Socket Actor
//!
//! Owns the WebSocket connection to the upstream's event stream. The actor
//! is the only task that touches the socket; it talks to the machine
//! exclusively through two channels — inbound decoded events into the
//! machine's queue, outbound [`SocketCommand`]s from the machine. No shared
//! mutable state, ever.
//!
//! Reconnection policy lives in the machine, not here: when the connection
//! dies for any reason the actor posts one `SocketDisconnected` and exits.
//! The machine decides whether and when to spawn a replacement.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::event::{ClientMessage, StreamMessage};
use super::machine::MachineEvent;
use super::StreamError;

/// Capacity of the machine→socket command channel. Commands are tiny and
/// the machine sends at most one per processed event.
const COMMAND_QUEUE_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Commands & handle
// ---------------------------------------------------------------------------

/// What the machine can ask of the socket actor.
#[derive(Clone, Debug)]
pub enum SocketCommand {
    /// Serialize and send a protocol message (START_STREAM or ACK).
    Send(ClientMessage),
    /// Send a WebSocket ping frame. Driven by the healthcheck actor.
    Ping,
    /// Close the connection and exit.
    Shutdown,
}

/// The machine's grip on a running socket actor.
pub struct SocketHandle {
    commands: mpsc::Sender<SocketCommand>,
    task: JoinHandle<()>,
}

impl SocketHandle {
    /// Wraps an already-spawned actor. Used by spawners — including the
    /// fakes that machine tests drive.
    pub fn new(commands: mpsc::Sender<SocketCommand>, task: JoinHandle<()>) -> Self {
        Self { commands, task }
    }

    /// Queues a protocol message for sending.
    pub async fn send(&self, message: ClientMessage) -> Result<(), StreamError> {
        self.commands
            .send(SocketCommand::Send(message))
            .await
            .map_err(|_| StreamError::ChannelClosed)
    }

    /// Queues a ping frame.
    pub async fn ping(&self) -> Result<(), StreamError> {
        self.commands
            .send(SocketCommand::Ping)
            .await
            .map_err(|_| StreamError::ChannelClosed)
    }

    /// Asks the actor to close, then makes sure it is gone.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SocketCommand::Shutdown).await;
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Spawner seam
// ---------------------------------------------------------------------------

/// Creates socket actors. The machine holds one of these instead of a URL
/// so tests can hand it a fake that never opens a network connection.
pub trait SocketSpawner: Send + Sync {
    /// Spawns a fresh actor that posts its events into `events`.
    fn spawn(&self, events: mpsc::Sender<MachineEvent>) -> SocketHandle;
}

/// The real thing: tokio-tungstenite against the configured URL.
pub struct WsSocketSpawner {
    url: String,
}

impl WsSocketSpawner {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

impl SocketSpawner for WsSocketSpawner {
    fn spawn(&self, events: mpsc::Sender<MachineEvent>) -> SocketHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let task = tokio::spawn(run_socket(self.url.clone(), events, commands_rx));
        SocketHandle::new(commands_tx, task)
    }
}

// ---------------------------------------------------------------------------
// Actor body
// ---------------------------------------------------------------------------

async fn run_socket(
    url: String,
    events: mpsc::Sender<MachineEvent>,
    mut commands: mpsc::Receiver<SocketCommand>,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(error) => {
            let _ = events
                .send(MachineEvent::SocketDisconnected {
                    reason: format!("connect failed: {error}"),
                })
                .await;
            return;
        }
    };

    let _ = events.send(MachineEvent::SocketConnected).await;
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => forward_text(&text, &events).await,
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events
                        .send(MachineEvent::SocketDisconnected {
                            reason: "closed by upstream".to_string(),
                        })
                        .await;
                    break;
                }
                Some(Err(error)) => {
                    let _ = events
                        .send(MachineEvent::SocketDisconnected {
                            reason: error.to_string(),
                        })
                        .await;
                    break;
                }
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Some(SocketCommand::Send(message)) => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(error) => {
                            warn!(%error, "failed to serialize outbound message");
                            continue;
                        }
                    };
                    if let Err(error) = write.send(Message::Text(json)).await {
                        let _ = events
                            .send(MachineEvent::SocketDisconnected {
                                reason: error.to_string(),
                            })
                            .await;
                        break;
                    }
                }
                Some(SocketCommand::Ping) => {
                    if let Err(error) = write.send(Message::Ping(Vec::new())).await {
                        let _ = events
                            .send(MachineEvent::SocketDisconnected {
                                reason: error.to_string(),
                            })
                            .await;
                        break;
                    }
                }
                Some(SocketCommand::Shutdown) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

/// Decodes one text frame and forwards event envelopes to the machine.
async fn forward_text(text: &str, events: &mpsc::Sender<MachineEvent>) {
    match serde_json::from_str::<StreamMessage>(text) {
        Ok(StreamMessage::Event(envelope)) => {
            let _ = events.send(MachineEvent::Stream(Box::new(envelope))).await;
        }
        Ok(StreamMessage::Unknown) => {
            debug!("ignoring unknown stream message type");
        }
        Err(error) => {
            warn!(%error, "undecodable stream message");
        }
    }
}
