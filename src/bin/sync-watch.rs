//! Follow one conversation from the command line.
//!
//! Loads the newest page, flushes any queued messages, optionally sends one,
//! then prints each change until interrupted.
//!
//! ```text
//! sync-watch <chat_id> <viewer_id> [message text...]
//! ```

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use message_sync::logging::init_tracing;
use message_sync::{
    spawn_poller, ChangeKind, InMemoryMessageStore, Message, SyncConfig, SyncDeps, SyncHandle,
    ViewEvent,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: sync-watch <chat_id> <viewer_id> [message text...]");
    }
    let (chat_id, viewer_id) = (args[1].as_str(), args[2].as_str());
    let text = args[3..].join(" ");

    let config = SyncConfig::from_env().context("Invalid SYNC_* configuration")?;
    init_tracing(config.log_format)?;

    let deps = SyncDeps::connect(&config, Arc::new(InMemoryMessageStore::new())).await?;
    let handle = SyncHandle::spawn(chat_id, viewer_id, &config, deps);
    let mut changes = handle.subscribe_changes().await?;
    let mut events = handle.subscribe_events();

    match handle.load_initial().await {
        Ok(count) => info!(count, "Conversation loaded"),
        Err(e) => warn!(error = %e, "Initial load failed, showing stored messages"),
    }
    for message in handle.snapshot().await? {
        print_message(&message);
    }

    let flushed = handle.connectivity_restored().await?;
    if flushed > 0 {
        info!(flushed, "Queued messages resent");
    }
    if !text.is_empty() {
        if let Err(e) = handle.send_text(text, None).await {
            warn!(error = %e, "Send failed, message stays queued");
        }
    }

    let poller = spawn_poller(handle.clone(), config.poll_interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Ok(change) if matches!(change.kind, ChangeKind::Inserted | ChangeKind::Changed) => {
                    if let Some(message) = handle.snapshot().await?.get(change.index) {
                        print_message(message);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed store changes"),
                Err(RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(ViewEvent::SendFailed { local_id, reason, .. }) => {
                    warn!(local_id = %local_id, reason = %reason, "Send failed");
                }
                Ok(ViewEvent::UnseenMessages { count, offer_summary: true }) => {
                    info!(count, "Many unseen messages");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    poller.abort();
    info!("Stopped");
    Ok(())
}

fn print_message(message: &Message) {
    println!(
        "{}\t{}\t{:?}\t{}",
        message.timestamp.format("%H:%M:%S"),
        message.sender_id,
        message.sync_status,
        message.content
    );
}
