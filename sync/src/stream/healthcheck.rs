//! # Healthcheck Actor
//!
//! A metronome, nothing more: while the machine is connected it posts a
//! liveness ping into the machine's queue on a fixed schedule, and the
//! machine turns each ping into a WebSocket ping frame. Started on entering
//! `CONNECTED`, aborted on leaving it. It shares no state with anyone.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::machine::MachineEvent;

/// Spawns the healthcheck ticker. The returned handle is aborted by the
/// machine when the connection goes away; the task also exits on its own
/// if the machine's queue closes.
pub fn spawn(interval: Duration, events: mpsc::Sender<MachineEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; the
        // connection was just established, so skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if events.send(MachineEvent::HealthcheckPing).await.is_err() {
                break;
            }
        }
    })
}
