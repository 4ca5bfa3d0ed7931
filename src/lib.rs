//! uskit - Client-side messaging layer for correlated request/reply and
//! continuous query subscriptions over one WebSocket.
//!
//! Every frame is a JSON text message with a type, a session-assigned id
//! and timestamp, and optional correlation and error fields. One
//! [`Session`] owns the physical connection and the id space; typed
//! channels ride on it and demultiplex by message type.
//!
//! # Architecture
//!
//! The crate follows a channel-composition pattern:
//!
//! - **Session** - Owns the WebSocket, assigns message ids, reconnects
//! - **Channel** - Capability trait: send, openness, observer registration
//! - **QueryChannel** - Snapshot/delta read subscription with pagination
//! - **TxnChannel** - One-shot write requests with ack/nack reporting
//! - **EventBus** - String-keyed async observer registry with `"*"` wildcard
//!
//! ```text
//! QueryChannel / TxnChannel
//!         │ Arc<dyn Channel>
//!         ▼
//!      Session ── EventBus (lifecycle, messages)
//!         │
//!         ▼
//!       ws:: ── tokio-tungstenite
//! ```
//!
//! # Modules
//!
//! - [`session`] - Connection owner and message-id space
//! - [`channel`] - Channel trait and composition base
//! - [`query`] - Continuous query subscription
//! - [`txn`] - Transaction requests
//! - [`table`] - In-memory row sink
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use uskit::{QueryChannel, Session, SessionConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let session = Session::new(SessionConfig {
//!     origin: Some("https://example.com".to_string()),
//!     ..SessionConfig::default()
//! });
//! session.open("/user_query")?;
//!
//! let users = QueryChannel::subscribe(
//!     Arc::new(session.clone()),
//!     "USER_QUERY",
//!     json!({ "DEPT": "eng" }),
//! )
//! .await?;
//! users.observe("insert", |event| async move {
//!     println!("{event:?}");
//!     Ok(())
//! });
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod error;
pub mod events;
pub mod message;
pub mod query;
pub mod session;
pub mod table;
pub mod txn;
pub mod ws;

// Re-export commonly used types
pub use channel::{Channel, ChannelCore};
pub use error::SessionError;
pub use events::EventBus;
pub use message::{Message, ReplyStatus, WireException};
pub use query::{QueryChannel, QueryEvent, QuerySink};
pub use session::{Session, SessionConfig, SessionEvent};
pub use table::MemoryTable;
pub use txn::{SubmitEvent, TxnChannel, TxnEvent, TxnSink};
