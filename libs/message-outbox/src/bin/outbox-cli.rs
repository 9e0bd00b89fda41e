use std::env;

use chrono::{Duration, Utc};
use message_outbox::{LocalOutbox, SqliteOutboxRepository, SyncStatus};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage:");
        eprintln!("  outbox-cli list <pending|sending|synced|failed> <DATABASE_URL>");
        eprintln!("  outbox-cli requeue <local_id> <DATABASE_URL>");
        eprintln!("  outbox-cli recover <DATABASE_URL>");
        eprintln!("  outbox-cli purge <older_than_days> <DATABASE_URL>");
        std::process::exit(1);
    }

    let cmd = args[1].as_str();

    match cmd {
        "list" if args.len() == 4 => {
            let status: SyncStatus = args[2].parse()?;
            let outbox = open(&args[3]).await?;
            for entry in outbox.list(status).await? {
                println!(
                    "{}\t{}\t{}\tretries={}\t{}",
                    entry.local_id,
                    entry.chat_id,
                    entry.created_at.to_rfc3339(),
                    entry.retry_count,
                    entry.last_error.unwrap_or_default()
                );
            }
        }
        "requeue" if args.len() == 4 => {
            let outbox = open(&args[3]).await?;
            outbox.requeue(&args[2]).await?;
            println!("Requeued {}", args[2]);
        }
        "recover" if args.len() == 3 => {
            let outbox = open(&args[2]).await?;
            let count = outbox.recover_in_flight().await?;
            println!("Recovered {} in-flight entries", count);
        }
        "purge" if args.len() == 4 => {
            let days: i64 = args[2].parse()?;
            let outbox = open(&args[3]).await?;
            let count = outbox.purge_synced(Utc::now() - Duration::days(days)).await?;
            println!("Purged {} synced entries older than {} days", count, days);
        }
        _ => {
            eprintln!("Invalid arguments");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn open(database_url: &str) -> Result<LocalOutbox, Box<dyn std::error::Error>> {
    let repository = SqliteOutboxRepository::connect(database_url).await?;
    Ok(LocalOutbox::new(Arc::new(repository)))
}
