//! Idle-connection reaper.
//!
//! A periodic sweep finds client connections with no activity past the
//! configured threshold and queues them for eviction. A separate consumer
//! drains the queue and closes each connection's outbound queue; the
//! connection's own writer task then tears the link down, which detaches
//! the client from its sessions the same way a voluntary disconnect would.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::mux::{CloseReason, ConnId, Multiplexer};

/// Eviction queue depth. Sweeps are periodic, so a small buffer suffices.
const EVICTION_QUEUE: usize = 64;

/// One connection picked for eviction.
#[derive(Debug)]
pub struct Eviction {
    /// Connection to evict.
    pub conn_id: ConnId,
    /// How long it had been idle when swept.
    pub idle: Duration,
}

/// Starts the sweep and eviction tasks.
pub fn start(
    mux: Arc<Multiplexer>,
    interval: Duration,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let (tx, rx) = mpsc::channel::<Eviction>(EVICTION_QUEUE);

    spawn_sweeper(Arc::clone(&mux), interval, idle_timeout, tx, cancel.clone());
    spawn_evictor(mux, rx, cancel);
}

fn spawn_sweeper(
    mux: Arc<Multiplexer>,
    interval: Duration,
    idle_timeout: Duration,
    tx: mpsc::Sender<Eviction>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Reaper sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    for conn_id in mux.conn_ids() {
                        let Some(idle_ms) = mux.idle_millis(&conn_id) else {
                            continue;
                        };
                        let idle = Duration::from_millis(idle_ms);
                        if idle < idle_timeout {
                            continue;
                        }
                        if tx
                            .send(Eviction { conn_id, idle })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
        }
    });
}

fn spawn_evictor(
    mux: Arc<Multiplexer>,
    mut rx: mpsc::Receiver<Eviction>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Reaper evictor stopping");
                    break;
                }
                eviction = rx.recv() => match eviction {
                    Some(eviction) => {
                        tracing::info!(
                            conn_id = %eviction.conn_id,
                            idle_secs = eviction.idle.as_secs(),
                            "Evicting idle connection"
                        );
                        mux.close_conn(&eviction.conn_id, CloseReason::Idle);
                    }
                    None => break,
                }
            }
        }
    });
}
