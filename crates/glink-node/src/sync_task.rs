//! Sync background task -- the single loop that owns the engine.
//!
//! Selects over discovery announcements, connection events, user commands,
//! the invite-expiry tick and the anti-entropy timer. Engine actions are
//! executed in order before the next event is taken.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use glink_protocol::{Cid, NodeAnnounce, Uid};
use glink_sync::{Action, SyncEngine, UiEvent};
use tokio::sync::{broadcast, mpsc};

use crate::connection::{ConnectionManager, NetworkEvent};

/// Input from the user interface.
#[derive(Debug, Clone)]
pub enum UiCommand {
    /// Chat text or a `!` command.
    Send { cid: Cid, text: String },
}

/// Run the sync loop until shutdown or until the connection layer goes away.
pub async fn run_sync_loop(
    mut engine: SyncEngine,
    conns: ConnectionManager,
    mut discovery_rx: mpsc::Receiver<NodeAnnounce>,
    mut network_rx: mpsc::Receiver<NetworkEvent>,
    mut command_rx: mpsc::Receiver<UiCommand>,
    ui_tx: broadcast::Sender<UiEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut expiry_tick = tokio::time::interval(Duration::from_secs(1));
    expiry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    expiry_tick.tick().await;

    let anti_entropy_secs = engine.config().anti_entropy_interval_secs;
    let mut anti_entropy = tokio::time::interval(Duration::from_secs(anti_entropy_secs.max(1)));
    anti_entropy.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    anti_entropy.tick().await;

    let mut discovery_open = true;
    let mut commands_open = true;

    tracing::info!(uid = %engine.own().uid, name = %engine.own().name, "sync: loop started");

    loop {
        let actions = tokio::select! {
            announce = discovery_rx.recv(), if discovery_open => match announce {
                Some(announce) => engine.on_discovery(&announce),
                None => {
                    discovery_open = false;
                    continue;
                }
            },

            event = network_rx.recv() => match event {
                Some(NetworkEvent::Connected { uid, name }) => {
                    tracing::debug!(peer = %uid, "sync: inbound peer connected");
                    engine.on_connected(&uid, Some(&name))
                }
                Some(NetworkEvent::Disconnected { uid }) => {
                    engine.on_disconnected(&uid);
                    continue;
                }
                Some(NetworkEvent::Message { from, message }) => engine.on_message(&from, message),
                None => {
                    tracing::info!("sync: network channel closed");
                    return;
                }
            },

            command = command_rx.recv(), if commands_open => match command {
                Some(UiCommand::Send { cid, text }) => engine.send_user_message(&cid, &text),
                None => {
                    commands_open = false;
                    continue;
                }
            },

            _ = expiry_tick.tick() => engine.on_tick(std::time::Instant::now()),

            _ = anti_entropy.tick(), if anti_entropy_secs > 0 => {
                let round = engine.anti_entropy_round();
                if !round.is_empty() {
                    tracing::debug!(peers = round.len(), "sync: anti-entropy round");
                }
                round
            }

            _ = shutdown.recv() => {
                tracing::info!("sync: loop stopped");
                return;
            }
        };

        execute(&mut engine, &conns, &ui_tx, actions).await;
    }
}

/// Carry out engine actions in order. A failed dial skips the sends that
/// were queued behind it for the same peer. A successful dial is reported to
/// the engine here, and whatever it answers runs after the current batch.
pub async fn execute(
    engine: &mut SyncEngine,
    conns: &ConnectionManager,
    ui_tx: &broadcast::Sender<UiEvent>,
    actions: Vec<Action>,
) {
    let mut failed_dials: HashSet<Uid> = HashSet::new();
    let mut queue: VecDeque<Action> = actions.into();

    while let Some(action) = queue.pop_front() {
        match action {
            Action::Connect { uid, endpoint } => {
                if conns.is_connected(&uid).await {
                    continue;
                }
                match conns.make_new_connection_to(&uid, &endpoint).await {
                    Ok(true) => {
                        tracing::debug!(peer = %uid, "sync: outbound peer connected");
                        queue.extend(engine.on_connected(&uid, None));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(peer = %uid, %endpoint, error = %e, "sync: connect failed");
                        failed_dials.insert(uid);
                    }
                }
            }
            Action::SendTo { uid, message } => {
                if failed_dials.contains(&uid) {
                    tracing::debug!(peer = %uid, kind = %message.message_type(), "sync: send skipped, peer unreachable");
                    continue;
                }
                if let Err(e) = conns.send_to(&uid, &message).await {
                    tracing::warn!(peer = %uid, kind = %message.message_type(), error = %e, "sync: send failed");
                }
            }
            Action::Broadcast(message) => {
                if let Err(e) = conns.send_to_all(&message).await {
                    tracing::warn!(kind = %message.message_type(), error = %e, "sync: broadcast failed");
                }
            }
            Action::Notify(event) => {
                // No subscribers is fine
                let _ = ui_tx.send(event);
            }
        }
    }
}
