//! Row-change feed fed by Postgres `NOTIFY` and consumed through explicit
//! subscriptions.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::services::extension_alerts::reload_open_requests;
use crate::state::AppState;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    #[serde(alias = "insert")]
    Insert,
    #[serde(alias = "update")]
    Update,
    #[serde(alias = "delete")]
    Delete,
}

/// One remote row change, in the `{table, type, record, old_record}` shape
/// emitted by the change trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
}

impl RowChange {
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// Fan-out of row changes to any number of subscribers.
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<RowChange>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers received the change.
    pub fn publish(&self, change: RowChange) -> usize {
        self.sender.send(change).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Delivers every change on `table` to `callback` until the returned
    /// handle is unsubscribed or dropped. Must be called inside a tokio
    /// runtime.
    pub fn subscribe<F>(&self, table: impl Into<String>, mut callback: F) -> Subscription
    where
        F: FnMut(RowChange) + Send + 'static,
    {
        let table = table.into();
        let mut receiver = self.sender.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(change) if change.table == table => callback(change),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(table = %table, skipped, "Change subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }
}

/// Handle for a callback subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Source of raw `NOTIFY` payloads for one subscribed connection.
trait NotificationSource {
    fn next_payload(&mut self) -> impl Future<Output = Result<String, sqlx::Error>> + Send;
}

impl NotificationSource for PgListener {
    async fn next_payload(&mut self) -> Result<String, sqlx::Error> {
        let notification = self.recv().await?;
        Ok(notification.payload().to_string())
    }
}

/// Forwards `NOTIFY` payloads on the configured channel into the feed,
/// reconnecting after failures. Open extension requests are reloaded after
/// every successful `LISTEN`, since changes made while disconnected are
/// never delivered.
pub async fn run_pg_listener(state: AppState) {
    let Some(pool) = state.db_pool.clone() else {
        tracing::warn!("Realtime listener: no database pool configured, exiting");
        return;
    };
    let pool = &pool;
    let channel = state.config.realtime_channel.as_str();
    let state = &state;

    supervise(
        move || subscribe(pool, channel),
        move || reload_open_requests(state),
        &state.change_feed,
        RECONNECT_DELAY,
    )
    .await;
}

async fn subscribe(pool: &PgPool, channel: &str) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(channel).await?;
    tracing::info!(channel, "Realtime listener subscribed");
    Ok(listener)
}

/// Connect, resync, forward until the connection fails, wait, repeat.
///
/// `resync` runs after the subscription is live, so anything changed while
/// it loads is still queued on the connection and replayed afterwards.
async fn supervise<Connect, ConnectFut, Source, Resync, ResyncFut>(
    mut connect: Connect,
    mut resync: Resync,
    feed: &ChangeFeed,
    retry_delay: Duration,
) where
    Connect: FnMut() -> ConnectFut,
    ConnectFut: Future<Output = Result<Source, sqlx::Error>>,
    Source: NotificationSource,
    Resync: FnMut() -> ResyncFut,
    ResyncFut: Future<Output = ()>,
{
    loop {
        match connect().await {
            Ok(mut source) => {
                resync().await;
                let error = forward_all(&mut source, feed).await;
                tracing::warn!(error = %error, "Realtime listener disconnected, reconnecting");
            }
            Err(error) => {
                tracing::warn!(error = %error, "Realtime listener could not subscribe, retrying");
            }
        }
        tokio::time::sleep(retry_delay).await;
    }
}

/// Publishes every payload from `source` until it errors.
async fn forward_all<S: NotificationSource>(source: &mut S, feed: &ChangeFeed) -> sqlx::Error {
    loop {
        let payload = match source.next_payload().await {
            Ok(payload) => payload,
            Err(error) => return error,
        };
        match RowChange::from_payload(&payload) {
            Ok(change) => {
                let table = change.table.clone();
                let delivered = feed.publish(change);
                tracing::debug!(table = %table, delivered, "Published row change");
            }
            Err(error) => {
                tracing::warn!(error = %error, "Skipping malformed realtime payload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use std::collections::VecDeque;

    use serde_json::json;

    use super::*;

    fn change(table: &str, kind: ChangeKind) -> RowChange {
        RowChange {
            table: table.to_string(),
            kind,
            record: Some(json!({ "id": "r1" })),
            old_record: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn parses_trigger_payload() {
        let parsed = RowChange::from_payload(
            r#"{"table":"extension_requests","type":"DELETE","record":null,"old_record":{"id":"x"}}"#,
        )
        .expect("valid payload");
        assert_eq!(parsed.kind, ChangeKind::Delete);
        assert_eq!(parsed.record, None);
        assert_eq!(parsed.old_record, Some(json!({ "id": "x" })));

        let lowercase = RowChange::from_payload(r#"{"table":"t","type":"insert"}"#)
            .expect("lowercase kind");
        assert_eq!(lowercase.kind, ChangeKind::Insert);

        assert!(RowChange::from_payload("not json").is_err());
    }

    #[tokio::test]
    async fn delivers_matching_tables_until_unsubscribed() {
        let feed = ChangeFeed::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = feed.subscribe("extension_requests", move |change| {
            sink.lock().unwrap().push(change.kind);
        });

        assert_eq!(feed.publish(change("extension_requests", ChangeKind::Insert)), 1);
        feed.publish(change("messages", ChangeKind::Insert));
        feed.publish(change("extension_requests", ChangeKind::Update));
        settle().await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ChangeKind::Insert, ChangeKind::Update]
        );

        subscription.unsubscribe();
        settle().await;
        feed.publish(change("extension_requests", ChangeKind::Delete));
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let feed = ChangeFeed::new(4);
        assert_eq!(feed.publish(change("extension_requests", ChangeKind::Insert)), 0);
    }

    struct ScriptedSource {
        payloads: VecDeque<String>,
    }

    impl NotificationSource for ScriptedSource {
        async fn next_payload(&mut self) -> Result<String, sqlx::Error> {
            self.payloads.pop_front().ok_or(sqlx::Error::PoolClosed)
        }
    }

    #[tokio::test]
    async fn forwards_payloads_until_the_source_fails() {
        let feed = ChangeFeed::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = feed.subscribe("extension_requests", move |change| {
            sink.lock().unwrap().push(change.kind);
        });

        let mut source = ScriptedSource {
            payloads: VecDeque::from([
                r#"{"table":"extension_requests","type":"INSERT","record":{"id":"r1"}}"#.to_string(),
                "garbage".to_string(),
                r#"{"table":"extension_requests","type":"DELETE","old_record":{"id":"r1"}}"#.to_string(),
            ]),
        };
        let error = forward_all(&mut source, &feed).await;
        assert!(matches!(error, sqlx::Error::PoolClosed));

        settle().await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ChangeKind::Insert, ChangeKind::Delete]
        );
    }

    #[tokio::test]
    async fn resyncs_after_every_reconnect() {
        let feed = ChangeFeed::new(16);
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let (sender, mut received) = tokio::sync::mpsc::unbounded_channel();
        let _subscription = feed.subscribe("extension_requests", move |change| {
            let _ = sender.send(change);
        });

        let connect_log = Arc::clone(&log);
        let resync_log = Arc::clone(&log);
        let task_feed = feed.clone();
        let task = tokio::spawn(async move {
            supervise(
                move || {
                    connect_log.lock().unwrap().push("connect");
                    let source = ScriptedSource {
                        payloads: VecDeque::from([
                            r#"{"table":"extension_requests","type":"UPDATE","record":{"id":"r1"}}"#
                                .to_string(),
                        ]),
                    };
                    async move { Ok::<_, sqlx::Error>(source) }
                },
                move || {
                    resync_log.lock().unwrap().push("resync");
                    async {}
                },
                &task_feed,
                Duration::from_millis(1),
            )
            .await;
        });

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(1), received.recv())
                .await
                .expect("change forwarded")
                .expect("subscriber alive");
        }
        task.abort();

        let log = log.lock().unwrap().clone();
        assert!(log.len() >= 4, "unexpected log: {log:?}");
        assert_eq!(log[..4], ["connect", "resync", "connect", "resync"]);
    }
}
