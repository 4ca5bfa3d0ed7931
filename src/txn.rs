//! TxnChannel: one-shot write requests with ack/nack reporting.
//!
//! A transaction channel is bound to one request type. Each call to
//! [`TxnChannel::send`] sends one `<name>` message; the server answers
//! with `<name>_ACK` or `<name>_NACK`, or with a generic `NACK` when it
//! could not even parse the request far enough to know its type. Generic
//! NACKs carry only a `REPLY_TO_ID`, so they are attributed to this channel
//! by comparing against the id of the most recent submit.
//!
//! Correlation is by last sent id only: if two submits are in flight on the
//! same channel, a generic NACK for the older one is dropped. Typed
//! `<name>_ACK` / `<name>_NACK` replies are unaffected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::channel::{Channel, ChannelCore};
use crate::events::EventBus;
use crate::message::{Message, ReplyStatus};

/// UI-side submission event: the payload a form or dialog wants sent.
#[derive(Debug, Clone)]
pub struct SubmitEvent {
    /// Request payload to transmit verbatim.
    pub content: Value,
}

/// Event emitted to transaction consumers.
#[derive(Debug, Clone)]
pub enum TxnEvent {
    /// A request was sent, with its assigned id and payload.
    Submitted {
        /// Session-assigned message id of the request.
        message_id: u64,
        /// Request payload as sent.
        content: Value,
    },
    /// The server accepted the request.
    Ack(ReplyStatus),
    /// The server rejected the request (typed or correlated generic NACK).
    Nack(ReplyStatus),
}

/// External outcome sink for transaction results.
#[async_trait]
pub trait TxnSink: Send + Sync {
    /// The server accepted a request.
    async fn on_ack(&self, status: ReplyStatus) -> anyhow::Result<()>;
    /// The server rejected a request.
    async fn on_nack(&self, status: ReplyStatus) -> anyhow::Result<()>;
}

/// Write channel for one request type on a parent channel.
pub struct TxnChannel {
    name: String,
    core: ChannelCore,
    events: EventBus<TxnEvent>,
    /// Id of the most recent submit, 0 when none has been sent yet. Used
    /// to attribute generic NACK frames.
    last_sent_id: AtomicU64,
}

impl std::fmt::Debug for TxnChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnChannel")
            .field("name", &self.name)
            .field("last_sent_id", &self.last_sent_id.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl TxnChannel {
    /// Bind a transaction channel for request type `name` to `parent`.
    #[must_use]
    pub fn new(parent: Arc<dyn Channel>, name: impl Into<String>) -> Arc<Self> {
        let channel = Arc::new(Self {
            name: name.into(),
            core: ChannelCore::new(parent),
            events: EventBus::new(),
            last_sent_id: AtomicU64::new(0),
        });
        Self::register_observers(&channel);
        channel
    }

    /// Request type this channel submits.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send one request carrying `content` and remember its id for
    /// generic NACK attribution.
    ///
    /// Returns the enriched message as transmitted. The outcome arrives
    /// later as an `"ack"` or `"nack"` event.
    ///
    /// # Errors
    ///
    /// Fails when the session is not open, or when a `"submit"` observer
    /// fails.
    pub async fn send(&self, content: Value) -> anyhow::Result<Message> {
        let sent = self.core.send(Message::request(&self.name, content)).await?;

        if let Some(id) = sent.message_id {
            self.last_sent_id.store(id, Ordering::SeqCst);
        }

        self.events
            .notify(
                "submit",
                TxnEvent::Submitted {
                    message_id: sent.message_id.unwrap_or(0),
                    content: sent.content.clone(),
                },
            )
            .await?;

        Ok(sent)
    }

    /// Forward a UI submission straight into [`TxnChannel::send`],
    /// without intermediate glue.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`TxnChannel::send`].
    pub async fn on_submit(&self, event: SubmitEvent) -> anyhow::Result<Message> {
        self.send(event.content).await
    }

    /// Register `observer` for a local event type (`"submit"`, `"ack"`,
    /// `"nack"`, or `"*"`).
    pub fn observe<F, Fut>(&self, event_type: &str, observer: F)
    where
        F: Fn(TxnEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.events.add_observer(event_type, observer);
    }

    /// Bridge ack/nack outcomes to `sink`.
    pub fn attach_sink(&self, sink: Arc<dyn TxnSink>) {
        self.events.add_observer(crate::events::WILDCARD, move |event| {
            let sink = Arc::clone(&sink);
            async move {
                match event {
                    TxnEvent::Ack(status) => sink.on_ack(status).await,
                    TxnEvent::Nack(status) => sink.on_nack(status).await,
                    TxnEvent::Submitted { .. } => Ok(()),
                }
            }
        });
    }

    fn register_observers(channel: &Arc<Self>) {
        let weak = Arc::downgrade(channel);
        channel.core.add_message_observer(
            &format!("{}_ACK", channel.name),
            Box::new(move |message| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(channel) => channel.on_reply("ack", message).await,
                        None => Ok(()),
                    }
                })
            }),
        );

        let weak = Arc::downgrade(channel);
        channel.core.add_message_observer(
            &format!("{}_NACK", channel.name),
            Box::new(move |message| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(channel) => channel.on_reply("nack", message).await,
                        None => Ok(()),
                    }
                })
            }),
        );

        // Generic NACK: the server could not attribute the failure to a
        // request type, so the client matches on the last sent id.
        let weak = Arc::downgrade(channel);
        channel.core.add_message_observer(
            "NACK",
            Box::new(move |message| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(channel) = weak.upgrade() else {
                        return Ok(());
                    };
                    let last = channel.last_sent_id.load(Ordering::SeqCst);
                    if last != 0 && message.reply_to_id == Some(last) {
                        channel.on_reply("nack", message).await
                    } else {
                        Ok(())
                    }
                })
            }),
        );
    }

    async fn on_reply(&self, outcome: &str, message: Message) -> anyhow::Result<()> {
        self.core.notify_message_observers(message.clone()).await?;

        let status = ReplyStatus::of(&message);
        let event = match outcome {
            "ack" => TxnEvent::Ack(status),
            _ => TxnEvent::Nack(status),
        };
        self.events.notify(outcome, event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MockChannel;
    use crate::message::WireException;
    use serde_json::json;
    use std::sync::Mutex;

    fn trace(channel: &TxnChannel) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        channel.observe(crate::events::WILDCARD, move |event| {
            let sink = Arc::clone(&sink);
            async move {
                let line = match event {
                    TxnEvent::Submitted { message_id, .. } => format!("submit:{message_id}"),
                    TxnEvent::Ack(s) => format!("ack:{}", s.reply_to_id.unwrap_or_default()),
                    TxnEvent::Nack(s) => format!(
                        "nack:{}:{}",
                        s.reply_to_id.unwrap_or_default(),
                        s.error_code.unwrap_or_default()
                    ),
                };
                sink.lock().unwrap().push(line);
                Ok(())
            }
        });
        log
    }

    fn nack(message_type: &str, reply_to_id: u64, code: &str) -> Message {
        Message {
            message_type: message_type.to_string(),
            message_id: None,
            timestamp: None,
            reply_to_id: Some(reply_to_id),
            content: serde_json::Value::Null,
            exception: Some(WireException {
                error_code: Some(code.to_string()),
                error_text: Some("rejected".to_string()),
            }),
        }
    }

    #[tokio::test]
    async fn test_submit_sends_request_and_emits_submitted() {
        let parent = MockChannel::new(true);
        let channel = TxnChannel::new(parent.clone(), "USER_ADD");
        let log = trace(&channel);

        let sent = channel.send(json!({"user": "amy"})).await.unwrap();
        assert_eq!(sent.message_id, Some(1));

        let recorded = parent.sent();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].message_type, "USER_ADD");
        assert_eq!(recorded[0].content, json!({"user": "amy"}));
        assert_eq!(*log.lock().unwrap(), vec!["submit:1"]);
    }

    #[tokio::test]
    async fn test_on_submit_forwards_payload_verbatim() {
        let parent = MockChannel::new(true);
        let channel = TxnChannel::new(parent.clone(), "USER_ADD");

        channel
            .on_submit(SubmitEvent {
                content: json!({"user": "amy", "dept": "eng"}),
            })
            .await
            .unwrap();

        assert_eq!(parent.sent()[0].content, json!({"user": "amy", "dept": "eng"}));
    }

    #[tokio::test]
    async fn test_submit_while_closed_fails() {
        let parent = MockChannel::new(false);
        let channel = TxnChannel::new(parent, "USER_ADD");
        assert!(channel.send(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_typed_ack_emits_ack_event() {
        let parent = MockChannel::new(true);
        let channel = TxnChannel::new(parent.clone(), "USER_ADD");
        let log = trace(&channel);

        channel.send(json!({"user": "amy"})).await.unwrap();
        parent
            .deliver(Message {
                reply_to_id: Some(1),
                ..Message::request("USER_ADD_ACK", serde_json::Value::Null)
            })
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["submit:1", "ack:1"]);
    }

    #[tokio::test]
    async fn test_typed_nack_carries_error_detail() {
        let parent = MockChannel::new(true);
        let channel = TxnChannel::new(parent.clone(), "USER_ADD");
        let log = trace(&channel);

        channel.send(json!({})).await.unwrap();
        parent.deliver(nack("USER_ADD_NACK", 1, "XPRM")).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["submit:1", "nack:1:XPRM"]);
    }

    #[tokio::test]
    async fn test_generic_nack_matches_last_sent_id() {
        let parent = MockChannel::new(true);
        let channel = TxnChannel::new(parent.clone(), "USER_ADD");
        let log = trace(&channel);

        channel.send(json!({})).await.unwrap();
        parent.deliver(nack("NACK", 1, "XMSG")).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["submit:1", "nack:1:XMSG"]);
    }

    #[tokio::test]
    async fn test_generic_nack_for_other_request_is_ignored() {
        let parent = MockChannel::new(true);
        let channel = TxnChannel::new(parent.clone(), "USER_ADD");
        let log = trace(&channel);

        channel.send(json!({})).await.unwrap();
        // Some other channel's request failed (id 7, not ours).
        parent.deliver(nack("NACK", 7, "XMSG")).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["submit:1"]);
    }

    #[tokio::test]
    async fn test_generic_nack_before_any_submit_is_ignored() {
        let parent = MockChannel::new(true);
        let channel = TxnChannel::new(parent.clone(), "USER_ADD");
        let log = trace(&channel);

        parent.deliver(nack("NACK", 0, "XMSG")).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_generic_nack_after_newer_submit_is_dropped() {
        let parent = MockChannel::new(true);
        let channel = TxnChannel::new(parent.clone(), "USER_ADD");
        let log = trace(&channel);

        channel.send(json!({"n": 1})).await.unwrap();
        channel.send(json!({"n": 2})).await.unwrap();
        // NACK for the first submit arrives after the second went out.
        parent.deliver(nack("NACK", 1, "XMSG")).await.unwrap();
        parent.deliver(nack("NACK", 2, "XMSG")).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["submit:1", "submit:2", "nack:2:XMSG"]
        );
    }
}
