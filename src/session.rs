//! Session: owner of the physical connection and the message-id space.
//!
//! One session manages one WebSocket connection. Outgoing messages are
//! framed with an id from the session's monotonically increasing counter
//! and a send timestamp; inbound frames are parsed and demultiplexed to
//! message-type observers. On unexpected closure the session reconnects
//! against the same address after a fixed delay, indefinitely, until the
//! caller closes it.
//!
//! # Architecture
//!
//! ```text
//! Session
//!     ├── ws::connect / WsWriter / WsReader   (transport)
//!     ├── EventBus<SessionEvent>              ("open" / "close")
//!     ├── EventBus<Message>                   (keyed by MESSAGE_TYPE, "*")
//!     └── connection loop (spawned task, supervised reconnect)
//! ```
//!
//! Ids are allocated synchronously inside `send`, before any await, so no
//! two concurrent sends on channels of one session can share an id. Ids
//! are never reset on reconnect. The counter is owned per session, not
//! shared process-wide.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::channel::{Channel, MessageObserver, SessionObserver};
use crate::error::SessionError;
use crate::events::EventBus;
use crate::message::Message;
use crate::ws::{self, WsFrame, WsWriter};

/// Delay between reconnect attempts.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Timestamp format: lexicographically sortable, with timezone offset.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f%:z";

/// Session lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Transport connected (initial connect or reconnect).
    Open,
    /// Transport disconnected.
    Close,
}

/// Configuration for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Origin used to resolve path-only addresses (e.g.
    /// `https://example.com`). `None` means only absolute addresses are
    /// accepted by [`Session::open`].
    pub origin: Option<String>,

    /// Delay between reconnect attempts. Default: 1 second.
    pub reconnect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            origin: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

struct Inner {
    config: SessionConfig,
    events: EventBus<SessionEvent>,
    messages: EventBus<Message>,
    next_id: AtomicU64,
    /// Reconnect target. `None` disables reconnection (explicit close).
    target: RwLock<Option<String>>,
    writer: Mutex<Option<WsWriter>>,
    open: AtomicBool,
    running: AtomicBool,
}

/// Owner of one connection and its message-id space. Cheap to clone; all
/// clones share the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("open", &self.is_open())
            .field("next_id", &self.inner.next_id.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    /// Create a closed session.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                events: EventBus::new(),
                messages: EventBus::new(),
                next_id: AtomicU64::new(0),
                target: RwLock::new(None),
                writer: Mutex::new(None),
                open: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Resolve `address` and start the connection loop.
    ///
    /// The loop keeps the session connected: every time the transport
    /// closes unexpectedly it waits the configured delay and reconnects
    /// against the same address, until [`Session::close`] clears the
    /// target.
    ///
    /// # Errors
    ///
    /// [`SessionError::AddressInvalid`] if the address cannot be resolved,
    /// [`SessionError::AlreadyOpen`] if a connection loop is already
    /// running.
    pub fn open(&self, address: &str) -> Result<(), SessionError> {
        let endpoint = ws::resolve_endpoint(address, self.inner.config.origin.as_deref())?;

        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyOpen);
        }

        *self.inner.target.write().expect("target poisoned") = Some(endpoint);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_connection_loop(inner).await;
        });

        Ok(())
    }

    /// Clear the reconnect target and drop the transport.
    ///
    /// After this, a transport close event no longer schedules a
    /// reconnect. The session can be reopened later; the id counter is not
    /// reset.
    pub async fn close(&self) {
        *self.inner.target.write().expect("target poisoned") = None;
        self.inner.open.store(false, Ordering::SeqCst);
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.close().await;
        }
    }

    /// True iff a transport handle exists and reports itself ready.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Assign the next id and the current timestamp to `message`,
    /// serialize, and transmit.
    ///
    /// Returns the enriched message so callers can correlate its id with
    /// later out-of-band replies.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotOpen`] while the session is connecting or
    /// closed; sending is only valid when open. Nothing is queued.
    pub async fn send(&self, mut message: Message) -> Result<Message, SessionError> {
        if !self.is_open() {
            return Err(SessionError::NotOpen);
        }

        // Allocated before any await: unique and strictly increasing even
        // with concurrent sends on multiple channels.
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        message.message_id = Some(id);
        message.timestamp = Some(timestamp_now());

        let text = serde_json::to_string(&message).map_err(SessionError::Encode)?;

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::NotOpen)?;
        writer
            .send_text(&text)
            .await
            .map_err(|e| SessionError::Transport(format!("{e:#}")))?;

        log::debug!("sent {} id={id}", message.message_type);
        Ok(message)
    }
}

#[async_trait]
impl Channel for Session {
    async fn send(&self, message: Message) -> Result<Message, SessionError> {
        Session::send(self, message).await
    }

    fn is_open(&self) -> bool {
        Session::is_open(self)
    }

    fn add_message_observer(&self, message_type: &str, observer: MessageObserver) {
        self.inner.messages.add_boxed_observer(message_type, observer);
    }

    fn add_session_observer(&self, event_type: &str, observer: SessionObserver) {
        self.inner.events.add_boxed_observer(event_type, observer);
    }
}

/// Current time in the wire timestamp format.
fn timestamp_now() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Supervised connect/read/reconnect loop.
async fn run_connection_loop(inner: Arc<Inner>) {
    loop {
        let Some(endpoint) = inner.target.read().expect("target poisoned").clone() else {
            break;
        };

        match ws::connect(&endpoint).await {
            Ok((writer, reader)) => {
                *inner.writer.lock().await = Some(writer);
                inner.open.store(true, Ordering::SeqCst);
                log::info!("session connected to {endpoint}");

                // A failing open observer (e.g. a resubscribe racing a
                // transport drop) counts as a failed attempt: this
                // connection is torn down and retried after the delay.
                // Reconnection stops only on explicit close or a message
                // observer defect.
                let mut fatal = false;
                match inner.events.notify("open", SessionEvent::Open).await {
                    Ok(_) => fatal = read_frames(&inner, reader).await,
                    Err(e) => log::warn!("open observer failed, dropping connection: {e:#}"),
                }

                inner.open.store(false, Ordering::SeqCst);
                if let Some(mut writer) = inner.writer.lock().await.take() {
                    let _ = writer.close().await;
                }

                if let Err(e) = inner.events.notify("close", SessionEvent::Close).await {
                    log::warn!("close observer failed: {e:#}");
                }

                if fatal {
                    shutdown(&inner).await;
                    break;
                }

                log::warn!("session disconnected from {endpoint}");
            }
            Err(e) => {
                log::warn!("session connect to {endpoint} failed: {e:#}");
            }
        }

        if inner.target.read().expect("target poisoned").is_none() {
            break;
        }
        tokio::time::sleep(inner.config.reconnect_delay).await;
    }

    inner.running.store(false, Ordering::SeqCst);
}

/// Read frames until the connection ends.
///
/// Returns `true` for a fatal failure (observer defect): the caller must
/// stop the session instead of reconnecting. Malformed frames are logged
/// and discarded; the connection stays up.
async fn read_frames(inner: &Arc<Inner>, mut reader: ws::WsReader) -> bool {
    loop {
        let Some(frame) = reader.recv().await else {
            return false;
        };

        match frame {
            Ok(WsFrame::Text(text)) => match serde_json::from_str::<Message>(&text) {
                Ok(message) => {
                    log::debug!("recv {}", message.message_type);
                    let message_type = message.message_type.clone();
                    if let Err(e) = inner.messages.notify(&message_type, message).await {
                        log::error!("message observer failed: {e:#}");
                        return true;
                    }
                }
                Err(e) => {
                    log::warn!("discarding malformed frame: {e}");
                }
            },
            Ok(WsFrame::Ping(data)) => {
                if let Some(writer) = inner.writer.lock().await.as_mut() {
                    let _ = writer.send_pong(data).await;
                }
            }
            Ok(WsFrame::Close { code, reason }) => {
                log::info!("server closed connection ({code}: {reason})");
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("websocket read error: {e:#}");
                return false;
            }
        }
    }
}

/// Stop reconnecting and drop the transport (the fatal path of the
/// connection loop).
async fn shutdown(inner: &Arc<Inner>) {
    *inner.target.write().expect("target poisoned") = None;
    inner.open.store(false, Ordering::SeqCst);
    if let Some(mut writer) = inner.writer.lock().await.take() {
        let _ = writer.close().await;
    }
}
