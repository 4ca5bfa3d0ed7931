//! QueryChannel: continuous read subscription with snapshot/delta
//! semantics and server-driven pagination.
//!
//! # Protocol
//!
//! ```text
//! Client                                  Server
//!   │  <name> { query params }              │
//!   │──────────────────────────────────────>│
//!   │  <name>_ACK { QUERY_ID, SCHEMA, … }   │   (may carry first page)
//!   │<──────────────────────────────────────│
//!   │  <name>_SNAPSHOT { INSERT, IS_LAST }  │
//!   │<──────────────────────────────────────│
//!   │  <name>_NEXT { QUERY_ID }             │   (while IS_LAST is false)
//!   │──────────────────────────────────────>│
//!   │  <name>_UPDATE { INSERT/UPDATE/DELETE }   (live deltas, forever)
//!   │<──────────────────────────────────────│
//! ```
//!
//! The channel holds no row state: rows are delegated to an external sink
//! through `reset` / `column` / `insert` / `update` / `delete` events. The
//! only negotiated state is the server-assigned query id used for
//! pagination. The subscription is re-issued on every parent `"open"`
//! event, so a reconnect bootstraps the same query again.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::channel::{Channel, ChannelCore};
use crate::events::EventBus;
use crate::message::{Message, ReplyStatus};

/// Key under which a row carries its unique identifier.
const ROW_ID_KEY: &str = "__rowid__";

/// Event emitted to query consumers, in fixed order within one reply:
/// reset, columns, inserts, updates, deletes.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// Subscription acknowledged (error fields absent on success).
    Ack(ReplyStatus),
    /// Subscription rejected; no delta follows.
    Nack(ReplyStatus),
    /// New schema: the sink must discard all prior rows and columns.
    Reset,
    /// One column descriptor, in declaration order.
    Column(Value),
    /// Row inserted (or re-sent on reconnect: treat as create-or-replace).
    Insert {
        /// Unique row identifier.
        row_id: String,
        /// Row values, identifier key stripped.
        row: Value,
    },
    /// Row updated (create-or-replace if absent).
    Update {
        /// Unique row identifier.
        row_id: String,
        /// Row values, identifier key stripped.
        row: Value,
    },
    /// Row deleted.
    Delete {
        /// Unique row identifier.
        row_id: String,
    },
}

/// External row sink, the core-to-UI boundary. Implementations must treat
/// `insert_row` on a present id and `update_row` on an absent id as
/// create-or-replace, since reconnect re-subscription can replay bootstrap
/// data.
#[async_trait]
pub trait QuerySink: Send + Sync {
    /// Discard all rows and columns.
    async fn reset(&self) -> anyhow::Result<()>;
    /// Append a column described by `descriptor`.
    async fn add_column(&self, descriptor: Value) -> anyhow::Result<()>;
    /// Create or replace a row.
    async fn insert_row(&self, row_id: String, row: Value) -> anyhow::Result<()>;
    /// Replace or create a row.
    async fn update_row(&self, row_id: String, row: Value) -> anyhow::Result<()>;
    /// Remove a row if present.
    async fn delete_row(&self, row_id: String) -> anyhow::Result<()>;
}

/// Reply content, shared by ACK/SNAPSHOT/UPDATE frames.
#[derive(Debug, Default, Deserialize)]
struct ReplyContent {
    #[serde(rename = "QUERY_ID", default)]
    query_id: Option<String>,
    #[serde(rename = "SCHEMA", default)]
    schema: Option<Vec<Value>>,
    #[serde(rename = "INSERT", default)]
    insert: Vec<Value>,
    #[serde(rename = "UPDATE", default)]
    update: Vec<Value>,
    #[serde(rename = "DELETE", default)]
    delete: Vec<Value>,
    #[serde(rename = "IS_LAST", default)]
    is_last: Option<bool>,
}

/// Continuous query subscription on a parent channel.
pub struct QueryChannel {
    name: String,
    request: Value,
    page_size: Option<u64>,
    core: ChannelCore,
    events: EventBus<QueryEvent>,
    query_id: RwLock<Option<String>>,
}

impl std::fmt::Debug for QueryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryChannel")
            .field("name", &self.name)
            .field("query_id", &*self.query_id.read().expect("query id poisoned"))
            .finish_non_exhaustive()
    }
}

impl QueryChannel {
    /// Subscribe to the query `name` with the fixed `request` parameters.
    ///
    /// The initial request is sent immediately if the parent is already
    /// open, and re-sent on every parent `"open"` event (initial connect
    /// or reconnect).
    ///
    /// # Errors
    ///
    /// Fails if the immediate initial request cannot be sent.
    pub async fn subscribe(
        parent: Arc<dyn Channel>,
        name: impl Into<String>,
        request: Value,
    ) -> anyhow::Result<Arc<Self>> {
        Self::subscribe_with_page_size(parent, name, request, None).await
    }

    /// Like [`QueryChannel::subscribe`], with a client-chosen page size:
    /// the initial request and every `_NEXT` carry `MAXCOUNT`.
    pub async fn subscribe_with_page_size(
        parent: Arc<dyn Channel>,
        name: impl Into<String>,
        request: Value,
        page_size: Option<u64>,
    ) -> anyhow::Result<Arc<Self>> {
        let channel = Arc::new(Self {
            name: name.into(),
            request,
            page_size,
            core: ChannelCore::new(parent),
            events: EventBus::new(),
            query_id: RwLock::new(None),
        });

        Self::register_observers(&channel);

        if channel.core.is_open() {
            channel.request_subscription().await?;
        }

        Ok(channel)
    }

    /// Query name (also the request message type).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Server-assigned query identifier, once a reply has been received.
    #[must_use]
    pub fn query_id(&self) -> Option<String> {
        self.query_id.read().expect("query id poisoned").clone()
    }

    /// Register `observer` for a local event type (`"ack"`, `"nack"`,
    /// `"reset"`, `"column"`, `"insert"`, `"update"`, `"delete"`, or `"*"`).
    pub fn observe<F, Fut>(&self, event_type: &str, observer: F)
    where
        F: Fn(QueryEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.events.add_observer(event_type, observer);
    }

    /// Bridge every row-level event to `sink`.
    pub fn attach_sink(&self, sink: Arc<dyn QuerySink>) {
        self.events.add_observer(crate::events::WILDCARD, move |event| {
            let sink = Arc::clone(&sink);
            async move {
                match event {
                    QueryEvent::Reset => sink.reset().await,
                    QueryEvent::Column(descriptor) => sink.add_column(descriptor).await,
                    QueryEvent::Insert { row_id, row } => sink.insert_row(row_id, row).await,
                    QueryEvent::Update { row_id, row } => sink.update_row(row_id, row).await,
                    QueryEvent::Delete { row_id } => sink.delete_row(row_id).await,
                    QueryEvent::Ack(_) | QueryEvent::Nack(_) => Ok(()),
                }
            }
        });
    }

    fn register_observers(channel: &Arc<Self>) {
        let weak = Arc::downgrade(channel);
        channel.core.parent().add_session_observer(
            "open",
            Box::new(move |_event| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(channel) => channel.request_subscription().await,
                        None => Ok(()),
                    }
                })
            }),
        );

        for suffix in ["ACK", "NACK", "SNAPSHOT", "UPDATE"] {
            let weak = Arc::downgrade(channel);
            let message_type = format!("{}_{suffix}", channel.name);
            channel.core.add_message_observer(
                &message_type,
                Box::new(move |message| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let Some(channel) = weak.upgrade() else {
                            return Ok(());
                        };
                        channel.on_message(suffix, message).await
                    })
                }),
            );
        }
    }

    /// (Re)issue the initial query request.
    async fn request_subscription(&self) -> anyhow::Result<()> {
        let content = self.with_page_size(self.request.clone());
        self.core.send(Message::request(&self.name, content)).await?;
        Ok(())
    }

    async fn on_message(&self, suffix: &str, message: Message) -> anyhow::Result<()> {
        self.core.notify_message_observers(message.clone()).await?;

        match suffix {
            "ACK" => {
                self.events
                    .notify("ack", QueryEvent::Ack(ReplyStatus::of(&message)))
                    .await?;
                // An ACK may carry the first page inline.
                self.apply_reply(&message).await
            }
            "NACK" => {
                // The subscription request failed; no delta follows.
                self.events
                    .notify("nack", QueryEvent::Nack(ReplyStatus::of(&message)))
                    .await?;
                Ok(())
            }
            _ => self.apply_reply(&message).await,
        }
    }

    /// Reconcile one reply: schema reset, columns, then deltas in fixed
    /// order, then the next page request if the reply is not final.
    async fn apply_reply(&self, message: &Message) -> anyhow::Result<()> {
        let content: ReplyContent = if message.content.is_null() {
            ReplyContent::default()
        } else {
            serde_json::from_value(message.content.clone())?
        };

        if let Some(query_id) = content.query_id {
            *self.query_id.write().expect("query id poisoned") = Some(query_id);
        }

        if let Some(schema) = content.schema {
            self.events.notify("reset", QueryEvent::Reset).await?;
            for descriptor in schema {
                self.events
                    .notify("column", QueryEvent::Column(descriptor))
                    .await?;
            }
        }

        for row in content.insert {
            let Some(row_id) = row_id_of(&row) else {
                log::warn!("{}: insert row without {ROW_ID_KEY}, skipped", self.name);
                continue;
            };
            self.events
                .notify(
                    "insert",
                    QueryEvent::Insert {
                        row_id,
                        row: strip_row_id(row),
                    },
                )
                .await?;
        }

        for row in content.update {
            let Some(row_id) = row_id_of(&row) else {
                log::warn!("{}: update row without {ROW_ID_KEY}, skipped", self.name);
                continue;
            };
            self.events
                .notify(
                    "update",
                    QueryEvent::Update {
                        row_id,
                        row: strip_row_id(row),
                    },
                )
                .await?;
        }

        for entry in content.delete {
            let Some(row_id) = row_id_of(&entry) else {
                log::warn!("{}: delete entry without {ROW_ID_KEY}, skipped", self.name);
                continue;
            };
            self.events
                .notify("delete", QueryEvent::Delete { row_id })
                .await?;
        }

        // All delta observers for this page have settled; pull the next
        // page. Never more than one _NEXT is outstanding per query.
        if content.is_last == Some(false) {
            let Some(query_id) = self.query_id() else {
                log::warn!("{}: non-final reply without a query id, cannot page", self.name);
                return Ok(());
            };
            let next = self.with_page_size(json!({ "QUERY_ID": query_id }));
            self.core
                .send(Message::request(format!("{}_NEXT", self.name), next))
                .await?;
        }

        Ok(())
    }

    fn with_page_size(&self, mut content: Value) -> Value {
        if let Some(page_size) = self.page_size {
            if content.is_null() {
                content = json!({});
            }
            if let Value::Object(ref mut map) = content {
                map.insert("MAXCOUNT".to_string(), page_size.into());
            }
        }
        content
    }
}

/// Extract a row identifier from a row object or a bare scalar (DELETE
/// sets may carry either).
fn row_id_of(entry: &Value) -> Option<String> {
    match entry {
        Value::Object(map) => map.get(ROW_ID_KEY).and_then(scalar_id),
        other => scalar_id(other),
    }
}

fn scalar_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn strip_row_id(mut row: Value) -> Value {
    if let Value::Object(ref mut map) = row {
        map.remove(ROW_ID_KEY);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MockChannel;
    use std::sync::Mutex;

    /// Collects a readable trace of every emitted event.
    fn trace(channel: &QueryChannel) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        channel.observe(crate::events::WILDCARD, move |event| {
            let sink = Arc::clone(&sink);
            async move {
                let line = match event {
                    QueryEvent::Ack(_) => "ack".to_string(),
                    QueryEvent::Nack(s) => format!("nack:{}", s.error_code.unwrap_or_default()),
                    QueryEvent::Reset => "reset".to_string(),
                    QueryEvent::Column(d) => format!("column:{}", d["name"].as_str().unwrap()),
                    QueryEvent::Insert { row_id, row } => format!("insert:{row_id}:{row}"),
                    QueryEvent::Update { row_id, row } => format!("update:{row_id}:{row}"),
                    QueryEvent::Delete { row_id } => format!("delete:{row_id}"),
                };
                sink.lock().unwrap().push(line);
                Ok(())
            }
        });
        log
    }

    async fn subscribed() -> (Arc<MockChannel>, Arc<QueryChannel>) {
        let parent = MockChannel::new(true);
        let channel = QueryChannel::subscribe(
            parent.clone(),
            "USER_QUERY",
            json!({"DEPT": "eng"}),
        )
        .await
        .unwrap();
        (parent, channel)
    }

    #[tokio::test]
    async fn test_subscribe_sends_initial_request_when_parent_open() {
        let (parent, _channel) = subscribed().await;

        let sent = parent.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type, "USER_QUERY");
        assert_eq!(sent[0].content, json!({"DEPT": "eng"}));
        assert_eq!(sent[0].message_id, Some(1));
    }

    #[tokio::test]
    async fn test_subscribe_waits_for_open_then_resubscribes_on_reconnect() {
        let parent = MockChannel::new(false);
        let _channel = QueryChannel::subscribe(parent.clone(), "USER_QUERY", json!({}))
            .await
            .unwrap();
        assert!(parent.sent().is_empty());

        parent.emit_open().await.unwrap();
        assert_eq!(parent.sent().len(), 1);

        // Reconnect: the open event fires again and the query is re-issued.
        parent.emit_open().await.unwrap();
        let sent = parent.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].message_type, "USER_QUERY");
    }

    #[tokio::test]
    async fn test_snapshot_emits_fixed_order_then_requests_next_page() {
        let (parent, channel) = subscribed().await;
        let log = trace(&channel);

        parent
            .deliver(Message {
                message_type: "USER_QUERY_SNAPSHOT".to_string(),
                message_id: None,
                timestamp: None,
                reply_to_id: Some(1),
                content: json!({
                    "QUERY_ID": "Q1-1|1",
                    "SCHEMA": [{"name": "a", "title": "A", "type": "integer"}],
                    "INSERT": [{"a": 1, "__rowid__": 1}],
                    "IS_LAST": false
                }),
                exception: None,
            })
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["reset", "column:a", "insert:1:{\"a\":1}"]
        );

        // The _NEXT went out after the deltas, carrying the negotiated id.
        let sent = parent.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].message_type, "USER_QUERY_NEXT");
        assert_eq!(sent[1].content, json!({"QUERY_ID": "Q1-1|1"}));
        assert_eq!(channel.query_id().as_deref(), Some("Q1-1|1"));
    }

    #[tokio::test]
    async fn test_next_page_without_schema_does_not_reset() {
        let (parent, channel) = subscribed().await;
        let log = trace(&channel);

        parent
            .deliver(Message::request(
                "USER_QUERY_SNAPSHOT",
                json!({
                    "QUERY_ID": "Q1-1|1",
                    "SCHEMA": [{"name": "a"}],
                    "INSERT": [{"a": 1, "__rowid__": 1}],
                    "IS_LAST": false
                }),
            ))
            .await
            .unwrap();
        parent
            .deliver(Message::request(
                "USER_QUERY_SNAPSHOT",
                json!({
                    "QUERY_ID": "Q1-1|1",
                    "INSERT": [{"a": 2, "__rowid__": 2}],
                    "IS_LAST": true
                }),
            ))
            .await
            .unwrap();

        let lines = log.lock().unwrap().clone();
        assert_eq!(lines.iter().filter(|l| *l == "reset").count(), 1);
        assert_eq!(lines.last().unwrap(), "insert:2:{\"a\":2}");
        // Final page: no further _NEXT.
        assert_eq!(parent.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_ack_emits_ack_then_applies_inline_first_page() {
        let (parent, channel) = subscribed().await;
        let log = trace(&channel);

        parent
            .deliver(Message::request(
                "USER_QUERY_ACK",
                json!({
                    "QUERY_ID": "Q9-9|1",
                    "SCHEMA": [{"name": "user"}],
                    "INSERT": [{"user": "amy", "__rowid__": 10}]
                }),
            ))
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["ack", "reset", "column:user", "insert:10:{\"user\":\"amy\"}"]
        );
        // IS_LAST absent means final: no _NEXT beyond the subscribe itself.
        assert_eq!(parent.sent().len(), 1);
        assert_eq!(channel.query_id().as_deref(), Some("Q9-9|1"));
    }

    #[tokio::test]
    async fn test_nack_emits_error_and_nothing_else() {
        let (parent, channel) = subscribed().await;
        let log = trace(&channel);

        parent
            .deliver(Message {
                message_type: "USER_QUERY_NACK".to_string(),
                message_id: None,
                timestamp: None,
                reply_to_id: Some(1),
                content: Value::Null,
                exception: Some(crate::message::WireException {
                    error_code: Some("XPRM".to_string()),
                    error_text: Some("Query not allowed".to_string()),
                }),
            })
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["nack:XPRM"]);
        assert_eq!(parent.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_update_reply_emits_deltas_in_order() {
        let (parent, channel) = subscribed().await;
        let log = trace(&channel);

        parent
            .deliver(Message::request(
                "USER_QUERY_UPDATE",
                json!({
                    "INSERT": [{"a": 3, "__rowid__": 3}],
                    "UPDATE": [{"a": 9, "__rowid__": 1}],
                    "DELETE": [{"__rowid__": 2}, 4],
                    "IS_LAST": true
                }),
            ))
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "insert:3:{\"a\":3}",
                "update:1:{\"a\":9}",
                "delete:2",
                "delete:4"
            ]
        );
    }

    #[tokio::test]
    async fn test_non_final_reply_without_query_id_does_not_page() {
        let (parent, channel) = subscribed().await;
        let log = trace(&channel);

        parent
            .deliver(Message::request(
                "USER_QUERY_SNAPSHOT",
                json!({
                    "INSERT": [{"a": 1, "__rowid__": 1}],
                    "IS_LAST": false
                }),
            ))
            .await
            .unwrap();

        // Deltas were applied, but with no id to quote there is nothing
        // to send a _NEXT for.
        assert_eq!(*log.lock().unwrap(), vec!["insert:1:{\"a\":1}"]);
        assert_eq!(parent.sent().len(), 1);
        assert!(channel.query_id().is_none());
    }

    #[tokio::test]
    async fn test_row_without_id_is_skipped() {
        let (parent, channel) = subscribed().await;
        let log = trace(&channel);

        parent
            .deliver(Message::request(
                "USER_QUERY_UPDATE",
                json!({"INSERT": [{"a": 1}, {"a": 2, "__rowid__": 2}]}),
            ))
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["insert:2:{\"a\":2}"]);
    }

    #[tokio::test]
    async fn test_page_size_is_carried_on_request_and_next() {
        let parent = MockChannel::new(true);
        let _channel = QueryChannel::subscribe_with_page_size(
            parent.clone(),
            "USER_QUERY",
            json!({"DEPT": "eng"}),
            Some(100),
        )
        .await
        .unwrap();

        parent
            .deliver(Message::request(
                "USER_QUERY_SNAPSHOT",
                json!({"QUERY_ID": "Q1", "IS_LAST": false}),
            ))
            .await
            .unwrap();

        let sent = parent.sent();
        assert_eq!(sent[0].content["MAXCOUNT"], json!(100));
        assert_eq!(sent[1].content, json!({"QUERY_ID": "Q1", "MAXCOUNT": 100}));
    }
}
