// Event loop wiring the live feed, history fetches, user commands, and the
// typing debounce into one reconciler.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ApiError, ChatError};
use crate::live::{LiveReceiver, LiveSnapshot};
use crate::message::ConversationHistory;
use crate::protocol::{Notice, Operation, UiUpdate, UserCommand};
use crate::reconciler::{
    ClearOutcome, Confirmation, HistoryTicket, Propagation, Reconciler, SendOutcome,
};
use crate::transport::ChatApi;

/// A finished history fetch, tagged with the ticket it was issued under.
type HistoryResult = (HistoryTicket, Result<ConversationHistory, ApiError>);

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Run the conversation event loop until `Quit` arrives or the command
/// channel closes.
///
/// Listens on four sources using `tokio::select!`:
/// 1. Live-feed snapshots published by the transport
/// 2. Results of history fetches spawned by this loop
/// 3. User commands from the front end
/// 4. The typing debounce deadline
///
/// Pushes view snapshots, draft changes, and notices through `ui_tx`.
pub async fn run(
    mut reconciler: Reconciler,
    mut live_rx: LiveReceiver,
    mut cmd_rx: mpsc::Receiver<UserCommand>,
    ui_tx: mpsc::Sender<UiUpdate>,
) -> anyhow::Result<()> {
    info!("Conversation event loop started");

    // The loop keeps a sender alive, so this channel never reports closed.
    let (history_tx, mut history_rx) = mpsc::channel::<HistoryResult>(8);

    // When the feed owner goes away the watch reports an error forever, so
    // stop polling it instead of spinning.
    let mut live_open = true;
    let mut errors_seen = 0;

    let initial = live_rx.borrow_and_update().clone();
    reconciler.on_live_update(Arc::clone(&initial)).await;
    if reconciler.has_conversation() {
        start_history_load(&mut reconciler, &history_tx);
    }
    publish_view(&reconciler, &ui_tx).await;
    report_feed_error(&initial, &mut errors_seen, &ui_tx).await;

    loop {
        let typing_idle = reconciler.typing_idle();

        tokio::select! {
            // --- Live feed ---
            changed = live_rx.changed(), if live_open => {
                match changed {
                    Ok(()) => {
                        let snapshot = live_rx.borrow_and_update().clone();
                        reconciler.on_live_update(Arc::clone(&snapshot)).await;
                        publish_view(&reconciler, &ui_tx).await;
                        report_feed_error(&snapshot, &mut errors_seen, &ui_tx).await;
                    }
                    Err(_) => {
                        info!("Live feed closed");
                        live_open = false;
                    }
                }
            }

            // --- History fetch results ---
            Some((ticket, result)) = history_rx.recv() => {
                match reconciler.apply_history(&ticket, result).await {
                    Ok(true) => publish_view(&reconciler, &ui_tx).await,
                    Ok(false) => {}
                    Err(e) => {
                        publish_view(&reconciler, &ui_tx).await;
                        notify_failure(&ui_tx, Operation::FetchHistory, e.to_string()).await;
                    }
                }
            }

            // --- User commands ---
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UserCommand::Quit) => {
                        info!("Quit command received, shutting down");
                        break;
                    }
                    Some(cmd) => {
                        handle_command(&mut reconciler, cmd, &ui_tx, &history_tx).await;
                    }
                    None => {
                        info!("Command channel closed, shutting down");
                        break;
                    }
                }
            }

            // --- Typing debounce ---
            _ = typing_idle => {
                reconciler.on_typing_idle().await;
            }
        }
    }

    reconciler.shutdown().await;
    info!("Conversation event loop exiting");
    Ok(())
}

async fn handle_command(
    reconciler: &mut Reconciler,
    cmd: UserCommand,
    ui_tx: &mpsc::Sender<UiUpdate>,
    history_tx: &mpsc::Sender<HistoryResult>,
) {
    match cmd {
        UserCommand::Open(remote_user_id) => match reconciler.open(&remote_user_id).await {
            Ok(ticket) => {
                spawn_history_fetch(reconciler.api(), ticket, history_tx.clone());
                let _ = ui_tx.send(UiUpdate::Draft(String::new())).await;
                publish_view(reconciler, ui_tx).await;
            }
            Err(e) => {
                warn!("Cannot open conversation with {:?}: {}", remote_user_id, e);
                notify(ui_tx, Notice::Info(e.to_string())).await;
            }
        },
        UserCommand::Input(value) => {
            reconciler.on_input(value).await;
        }
        UserCommand::Send => match reconciler.send().await {
            Ok(SendOutcome::Sent) => {
                let _ = ui_tx.send(UiUpdate::Draft(reconciler.draft().to_string())).await;
            }
            Ok(SendOutcome::Skipped) => {
                debug!("Nothing sent");
            }
            Err(e) => {
                let _ = ui_tx.send(UiUpdate::Draft(reconciler.draft().to_string())).await;
                notify_failure(ui_tx, Operation::Send, e.to_string()).await;
            }
        },
        UserCommand::Edit {
            message_id,
            content,
        } => {
            let result = reconciler.edit(&message_id, &content).await;
            publish_view(reconciler, ui_tx).await;
            report_mutation(ui_tx, Operation::Edit, result).await;
        }
        UserCommand::Delete(message_id) => {
            let result = reconciler.delete(&message_id).await;
            publish_view(reconciler, ui_tx).await;
            report_mutation(ui_tx, Operation::Delete, result).await;
        }
        UserCommand::Clear { confirmed } => {
            match reconciler.clear(Confirmation::from(confirmed)).await {
                Ok(ClearOutcome::Declined) => {}
                Ok(ClearOutcome::Cleared(propagation)) => {
                    publish_view(reconciler, ui_tx).await;
                    report_mutation(ui_tx, Operation::Clear, Ok(propagation)).await;
                }
                Err(e) => {
                    publish_view(reconciler, ui_tx).await;
                    notify_failure(ui_tx, Operation::Clear, e.to_string()).await;
                }
            }
        }
        UserCommand::Refresh => {
            if reconciler.has_conversation() {
                start_history_load(reconciler, history_tx);
                publish_view(reconciler, ui_tx).await;
            } else {
                notify(ui_tx, Notice::Info(ChatError::NoConversation.to_string())).await;
            }
        }
        UserCommand::Quit => {}
    }
}

fn start_history_load(reconciler: &mut Reconciler, history_tx: &mpsc::Sender<HistoryResult>) {
    match reconciler.begin_history_load() {
        Ok(ticket) => spawn_history_fetch(reconciler.api(), ticket, history_tx.clone()),
        Err(e) => debug!("History load not started: {}", e),
    }
}

/// Fetch history off the loop. The result comes back through `tx` and is
/// applied only if its ticket is still current.
fn spawn_history_fetch(
    api: Arc<dyn ChatApi>,
    ticket: HistoryTicket,
    tx: mpsc::Sender<HistoryResult>,
) {
    debug!(
        "Fetching history with {} (generation {})",
        ticket.remote_user_id, ticket.generation
    );
    tokio::spawn(async move {
        let result = api.fetch_history(&ticket.remote_user_id).await;
        let _ = tx.send((ticket, result)).await;
    });
}

async fn publish_view(reconciler: &Reconciler, ui_tx: &mpsc::Sender<UiUpdate>) {
    let _ = ui_tx.send(UiUpdate::View(reconciler.snapshot())).await;
}

async fn notify(ui_tx: &mpsc::Sender<UiUpdate>, notice: Notice) {
    let _ = ui_tx.send(UiUpdate::Notice(notice)).await;
}

async fn notify_failure(ui_tx: &mpsc::Sender<UiUpdate>, operation: Operation, message: String) {
    notify(ui_tx, Notice::Failed { operation, message }).await;
}

/// Surface an error the server or the socket supervisor recorded on the feed
/// since the last one reported.
async fn report_feed_error(snapshot: &LiveSnapshot, seen: &mut u64, ui_tx: &mpsc::Sender<UiUpdate>) {
    let fresh = snapshot.error_since(*seen).map(str::to_string);
    *seen = snapshot.error_seq;
    if let Some(message) = fresh {
        notify_failure(ui_tx, Operation::Send, message).await;
    }
}

async fn report_mutation(
    ui_tx: &mpsc::Sender<UiUpdate>,
    operation: Operation,
    result: Result<Propagation, ChatError>,
) {
    match result {
        Ok(Propagation::Broadcast) => {}
        Ok(Propagation::LocalOnly) => {
            let message = format!(
                "{} saved, but the other participant was not notified",
                operation.label()
            );
            notify(ui_tx, Notice::Info(message)).await;
        }
        Err(e) => notify_failure(ui_tx, operation, e.to_string()).await,
    }
}
