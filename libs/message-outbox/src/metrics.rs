use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct OutboxMetrics {
    pub pending: IntGauge,
    pub synced: IntCounter,
    pub failed: IntCounter,
    pub retried: IntCounter,
}

impl OutboxMetrics {
    pub fn new(client: &str) -> Self {
        let registry = prometheus::default_registry();

        let pending = IntGauge::with_opts(
            Opts::new(
                "message_outbox_pending_count",
                "Number of unsent messages currently waiting in the outbox",
            )
            .const_label("client", client.to_string()),
        )
        .expect("valid metric opts for message_outbox_pending_count");

        let synced = IntCounter::with_opts(
            Opts::new(
                "message_outbox_synced_total",
                "Total number of outbox messages confirmed by the server",
            )
            .const_label("client", client.to_string()),
        )
        .expect("valid metric opts for message_outbox_synced_total");

        let failed = IntCounter::with_opts(
            Opts::new(
                "message_outbox_rejected_total",
                "Total number of outbox messages rejected by the server",
            )
            .const_label("client", client.to_string()),
        )
        .expect("valid metric opts for message_outbox_rejected_total");

        let retried = IntCounter::with_opts(
            Opts::new(
                "message_outbox_transient_failures_total",
                "Total number of sends returned to pending after a network failure",
            )
            .const_label("client", client.to_string()),
        )
        .expect("valid metric opts for message_outbox_transient_failures_total");

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(synced.clone()),
            Box::new(failed.clone()),
            Box::new(retried.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Self {
            pending,
            synced,
            failed,
            retried,
        }
    }
}
