//! # message-sync
//!
//! Client-side synchronization core for a chat conversation. It keeps an
//! ordered, de-duplicated local view of a conversation consistent with the
//! server while messages arrive from three sources:
//!
//! - paginated HTTP fetches (initial load, periodic refresh, older history)
//! - real-time push events from the socket layer
//! - optimistic local sends, queued durably in the
//!   [`message_outbox`](message_outbox) crate until the server confirms them
//!
//! All mutations of a conversation go through one [`SyncHandle`], whose actor
//! task applies them in order. Initial loads bump an epoch; page responses
//! from an older epoch are discarded.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use message_sync::{InMemoryMessageStore, SyncConfig, SyncDeps, SyncHandle};
//!
//! let config = SyncConfig::from_env()?;
//! let deps = SyncDeps::connect(&config, Arc::new(InMemoryMessageStore::new())).await?;
//! let handle = SyncHandle::spawn("chat-1", "me", &config, deps);
//!
//! handle.load_initial().await?;
//! let poller = message_sync::spawn_poller(handle.clone(), config.poll_interval);
//! handle.send_text("hello", None).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pagination;
pub mod persistence;
pub mod push;
pub mod reconcile;
pub mod signature;
pub mod store;
pub mod transport;

pub use config::SyncConfig;
pub use engine::{spawn_poller, SyncDeps, SyncHandle, ViewEvent, ViewState};
pub use error::{SyncError, SyncResult};
pub use models::{Message, MessageDraft, MessageType};
pub use pagination::{PageState, PrependDelta};
pub use persistence::{InMemoryMessageStore, MessagePersistence};
pub use push::{PushEvent, PushSink};
pub use reconcile::{Origin, ReconcileOutcome, ReconciliationEngine};
pub use store::{ChangeKind, ConversationStore, StoreChange};
pub use transport::{FetchedPage, HttpTransport, MessageTransport};

pub use message_outbox::{LocalOutbox, SyncStatus};
