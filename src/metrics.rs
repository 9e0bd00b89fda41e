use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, TextEncoder};

static PAGES_FETCHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "message_sync_pages_fetched_total",
            "Message pages fetched from the server, by kind and result",
        ),
        &["kind", "result"],
    )
    .expect("failed to create message_sync_pages_fetched_total");
    register(Box::new(counter.clone()));
    counter
});

static STALE_RESPONSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "message_sync_stale_responses_total",
        "Page responses discarded because a newer initial load started",
    )
    .expect("failed to create message_sync_stale_responses_total");
    register(Box::new(counter.clone()));
    counter
});

static RECONCILED_MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "message_sync_reconciled_messages_total",
            "Messages merged into the conversation, by effect",
        ),
        &["effect"],
    )
    .expect("failed to create message_sync_reconciled_messages_total");
    register(Box::new(counter.clone()));
    counter
});

static SENDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "message_sync_sends_total",
            "Send attempts, by result",
        ),
        &["result"],
    )
    .expect("failed to create message_sync_sends_total");
    register(Box::new(counter.clone()));
    counter
});

// Several engines in one process share the collectors; a second registration
// of the same collector is not an error worth surfacing.
fn register(collector: Box<dyn prometheus::core::Collector>) {
    if let Err(e) = prometheus::default_registry().register(collector) {
        tracing::debug!("Sync metric already registered: {}", e);
    }
}

pub fn record_page(kind: &str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    PAGES_FETCHED_TOTAL.with_label_values(&[kind, result]).inc();
}

pub fn record_stale_response() {
    STALE_RESPONSES_TOTAL.inc();
}

pub fn record_reconciled(inserted: usize, updated: usize, confirmed: usize) {
    RECONCILED_MESSAGES_TOTAL
        .with_label_values(&["inserted"])
        .inc_by(inserted as u64);
    RECONCILED_MESSAGES_TOTAL
        .with_label_values(&["updated"])
        .inc_by(updated as u64);
    RECONCILED_MESSAGES_TOTAL
        .with_label_values(&["confirmed"])
        .inc_by(confirmed as u64);
}

pub fn record_send(result: &str) {
    SENDS_TOTAL.with_label_values(&[result]).inc();
}

/// Text exposition of every metric in the default registry, including the
/// outbox gauges.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
