//! Channel capability and the composition base for typed channels.
//!
//! A channel is a logical sub-conversation riding on a parent, a
//! [`Session`](crate::session::Session) or another channel. The capability
//! is a trait rather than a base class: typed channels hold their parent as
//! `Arc<dyn Channel>` and embed a [`ChannelCore`] for the shared delegation
//! plumbing, so `is_open` and `send` walk up the parent chain until they
//! reach the session that owns the transport.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::events::{BoxedObserver, EventBus};
use crate::message::Message;
use crate::session::SessionEvent;

/// Boxed observer for inbound messages of one type (or `"*"`).
pub type MessageObserver = BoxedObserver<Message>;

/// Boxed observer for session lifecycle events (`"open"` / `"close"`).
pub type SessionObserver = BoxedObserver<SessionEvent>;

/// Capability shared by sessions and channels: send a message, report
/// openness, and accept observers for inbound messages and lifecycle
/// events. Channels delegate all four to their parent.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a message draft through the owning session.
    ///
    /// The session assigns the id and timestamp; the enriched message is
    /// returned so callers can correlate later out-of-band replies.
    async fn send(&self, message: Message) -> Result<Message, SessionError>;

    /// Whether the owning session's transport is open.
    fn is_open(&self) -> bool;

    /// Observe inbound messages of `message_type` (or `"*"` for all).
    fn add_message_observer(&self, message_type: &str, observer: MessageObserver);

    /// Observe session lifecycle events (`"open"` / `"close"`).
    fn add_session_observer(&self, event_type: &str, observer: SessionObserver);
}

/// Composition base for typed channels.
///
/// Holds the parent back-reference and a local message bus. Parent-facing
/// calls delegate upward; [`ChannelCore::notify_message_observers`] fans an
/// inbound message out to local observers, both the `"*"` wildcard and the
/// message's exact declared type.
pub struct ChannelCore {
    parent: Arc<dyn Channel>,
    messages: EventBus<Message>,
}

impl std::fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCore")
            .field("messages", &self.messages)
            .finish_non_exhaustive()
    }
}

impl ChannelCore {
    /// Bind to a parent. The core never opens its own transport.
    #[must_use]
    pub fn new(parent: Arc<dyn Channel>) -> Self {
        Self {
            parent,
            messages: EventBus::new(),
        }
    }

    /// The parent this channel rides on.
    #[must_use]
    pub fn parent(&self) -> &Arc<dyn Channel> {
        &self.parent
    }

    /// Delegates to the parent, transitively up to the session.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.parent.is_open()
    }

    /// Delegates to the parent's `send`.
    pub async fn send(&self, message: Message) -> Result<Message, SessionError> {
        self.parent.send(message).await
    }

    /// Subscribe to the parent's inbound messages of `message_type`.
    pub fn add_message_observer(&self, message_type: &str, observer: MessageObserver) {
        self.parent.add_message_observer(message_type, observer);
    }

    /// Register a local observer, notified via
    /// [`ChannelCore::notify_message_observers`].
    pub fn observe_message<F, Fut>(&self, message_type: &str, observer: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.messages.add_observer(message_type, observer);
    }

    /// Fan an inbound message out to local observers under both the `"*"`
    /// wildcard and the message's declared type. Returns the combined
    /// observer count.
    pub async fn notify_message_observers(&self, message: Message) -> anyhow::Result<usize> {
        let message_type = message.message_type.clone();
        self.messages.notify(&message_type, message).await
    }
}

#[async_trait]
impl Channel for ChannelCore {
    async fn send(&self, message: Message) -> Result<Message, SessionError> {
        ChannelCore::send(self, message).await
    }

    fn is_open(&self) -> bool {
        ChannelCore::is_open(self)
    }

    fn add_message_observer(&self, message_type: &str, observer: MessageObserver) {
        ChannelCore::add_message_observer(self, message_type, observer);
    }

    fn add_session_observer(&self, event_type: &str, observer: SessionObserver) {
        self.parent.add_session_observer(event_type, observer);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`Channel`] double used by the typed-channel unit tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Channel double: records sends, assigns ids like a session, and lets
    /// tests drive inbound dispatch and lifecycle events by hand.
    pub(crate) struct MockChannel {
        open: AtomicBool,
        next_id: AtomicU64,
        sent: Mutex<Vec<Message>>,
        events: EventBus<SessionEvent>,
        messages: EventBus<Message>,
    }

    impl MockChannel {
        pub(crate) fn new(open: bool) -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(open),
                next_id: AtomicU64::new(0),
                sent: Mutex::new(Vec::new()),
                events: EventBus::new(),
                messages: EventBus::new(),
            })
        }

        /// Messages sent through this channel so far, in send order.
        pub(crate) fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn set_open(&self, open: bool) {
            self.open.store(open, Ordering::SeqCst);
        }

        /// Dispatch an inbound message the way a session would.
        pub(crate) async fn deliver(&self, message: Message) -> anyhow::Result<usize> {
            let message_type = message.message_type.clone();
            self.messages.notify(&message_type, message).await
        }

        /// Mark open and fire the `"open"` lifecycle event.
        pub(crate) async fn emit_open(&self) -> anyhow::Result<usize> {
            self.open.store(true, Ordering::SeqCst);
            self.events.notify("open", SessionEvent::Open).await
        }
    }

    #[async_trait]
    impl Channel for MockChannel {
        async fn send(&self, mut message: Message) -> Result<Message, SessionError> {
            if !self.open.load(Ordering::SeqCst) {
                return Err(SessionError::NotOpen);
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            message.message_id = Some(id);
            message.timestamp = Some("2026-08-27 00:00:00.000000+00:00".to_string());
            self.sent.lock().unwrap().push(message.clone());
            Ok(message)
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn add_message_observer(&self, message_type: &str, observer: MessageObserver) {
            self.messages.add_boxed_observer(message_type, observer);
        }

        fn add_session_observer(&self, event_type: &str, observer: SessionObserver) {
            self.events.add_boxed_observer(event_type, observer);
        }
    }
}
